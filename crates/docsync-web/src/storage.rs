//! Browser localStorage adapter.
//!
//! Keys are joined with `/` under the `docsync/` prefix; values are stored as
//! JSON arrays of byte values, since localStorage only holds strings.

use docsync_core::storage::{StorageError, StorageKey};

/// Prefix of every entry this adapter owns.
pub const KEY_PREFIX: &str = "docsync/";

/// Flatten a storage key into a localStorage key.
pub fn encode_key(key: &[String]) -> Result<String, StorageError> {
    if key.iter().any(|c| c.is_empty() || c.contains('/')) {
        return Err(StorageError::InvalidKey(key.to_vec()));
    }
    Ok(format!("{KEY_PREFIX}{}", key.join("/")))
}

/// Inverse of [`encode_key`]; `None` for entries owned by someone else.
pub fn decode_key(raw: &str) -> Option<StorageKey> {
    let rest = raw.strip_prefix(KEY_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    Some(rest.split('/').map(str::to_string).collect())
}

pub fn encode_value(data: &[u8]) -> Result<String, StorageError> {
    serde_json::to_string(data).map_err(|e| StorageError::Backend(e.to_string()))
}

pub fn decode_value(raw: &str) -> Result<Vec<u8>, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Backend(e.to_string()))
}

#[cfg(target_arch = "wasm32")]
pub use browser::LocalStorage;

#[cfg(target_arch = "wasm32")]
mod browser {
    use super::*;
    use docsync_core::storage::{Result, StorageAdapter};

    fn js_err(e: wasm_bindgen::JsValue) -> StorageError {
        StorageError::Backend(format!("{:?}", e))
    }

    /// `window.localStorage`, looked up per call so the adapter stays
    /// `Send + Sync`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LocalStorage;

    impl LocalStorage {
        pub fn new() -> Self {
            Self
        }

        fn storage(&self) -> Result<web_sys::Storage> {
            web_sys::window()
                .ok_or_else(|| StorageError::Backend("no window".into()))?
                .local_storage()
                .map_err(js_err)?
                .ok_or_else(|| StorageError::Backend("localStorage unavailable".into()))
        }

        /// Our entries under `prefix`, sorted by key.
        fn entries(&self, prefix: &[String]) -> Result<Vec<(StorageKey, String)>> {
            let storage = self.storage()?;
            let len = storage.length().map_err(js_err)?;
            let mut out = Vec::new();
            for i in 0..len {
                let Some(raw) = storage.key(i).map_err(js_err)? else {
                    continue;
                };
                let Some(key) = decode_key(&raw) else {
                    continue;
                };
                if key.starts_with(prefix) {
                    out.push((key, raw));
                }
            }
            out.sort();
            Ok(out)
        }
    }

    impl StorageAdapter for LocalStorage {
        fn load(&self, key: &[String]) -> Result<Option<Vec<u8>>> {
            let raw = self.storage()?.get_item(&encode_key(key)?).map_err(js_err)?;
            raw.as_deref().map(decode_value).transpose()
        }

        fn save(&self, key: &[String], data: &[u8]) -> Result<()> {
            self.storage()?
                .set_item(&encode_key(key)?, &encode_value(data)?)
                .map_err(js_err)
        }

        fn remove(&self, key: &[String]) -> Result<()> {
            self.storage()?
                .remove_item(&encode_key(key)?)
                .map_err(js_err)
        }

        fn load_range(&self, prefix: &[String]) -> Result<Vec<(StorageKey, Vec<u8>)>> {
            let storage = self.storage()?;
            let mut out = Vec::new();
            for (key, raw) in self.entries(prefix)? {
                // Entries can vanish between listing and reading (other tabs)
                if let Some(value) = storage.get_item(&raw).map_err(js_err)? {
                    out.push((key, decode_value(&value)?));
                }
            }
            Ok(out)
        }

        fn remove_range(&self, prefix: &[String]) -> Result<()> {
            let storage = self.storage()?;
            for (_, raw) in self.entries(prefix)? {
                storage.remove_item(&raw).map_err(js_err)?;
            }
            Ok(())
        }

        fn keys(&self, prefix: &[String]) -> Result<Vec<StorageKey>> {
            Ok(self.entries(prefix)?.into_iter().map(|(key, _)| key).collect())
        }
    }
}


#[cfg(all(test, target_arch = "wasm32"))]
mod browser_tests {
    use super::*;
    use docsync_core::StorageAdapter;
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    #[wasm_bindgen_test]
    fn test_local_storage_round_trip() {
        let storage = LocalStorage::new();
        let prefix = vec!["browser-test".to_string()];
        storage.remove_range(&prefix).unwrap();

        let snapshot = vec!["browser-test".to_string(), "snapshot".to_string()];
        storage.save(&snapshot, b"abc").unwrap();

        assert_eq!(storage.load(&snapshot).unwrap(), Some(b"abc".to_vec()));
        assert_eq!(storage.keys(&prefix).unwrap(), vec![snapshot.clone()]);

        storage.remove_range(&prefix).unwrap();
        assert_eq!(storage.load(&snapshot).unwrap(), None);
    }
}
