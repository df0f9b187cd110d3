//! Filesystem storage adapter.
//!
//! Each key maps to a file path under the root directory: every component but
//! the last is a directory, the last is the file. Writes go through a hidden
//! temporary file that is renamed into place.

use docsync_core::storage::{Result, StorageAdapter, StorageError, StorageKey};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Stores blobs as files under a root directory.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Open (and create if needed) a storage directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path, rejecting components that would escape the
    /// root or collide with temporary files.
    fn path_for(&self, key: &[String]) -> Result<PathBuf> {
        let valid = |c: &String| {
            !c.is_empty()
                && !c.starts_with('.')
                && !c.contains(['/', '\\', '\0'])
        };
        if !key.iter().all(valid) {
            return Err(StorageError::InvalidKey(key.to_vec()));
        }

        let mut path = self.root.clone();
        path.extend(key);
        Ok(path)
    }

    /// Collect files below `dir`, whose key is `key`.
    fn walk(dir: &Path, key: &mut StorageKey, out: &mut Vec<(StorageKey, Vec<u8>)>) -> Result<()> {
        let mut entries: Vec<_> = match fs::read_dir(dir) {
            Ok(entries) => entries.collect::<std::io::Result<_>>()?,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            key.push(name);
            if entry.file_type()?.is_dir() {
                Self::walk(&entry.path(), key, out)?;
            } else {
                out.push((key.clone(), fs::read(entry.path())?));
            }
            key.pop();
        }
        Ok(())
    }
}

impl StorageAdapter for FsStorage {
    fn load(&self, key: &[String]) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &[String], data: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(StorageError::InvalidKey(key.to_vec()));
        };
        fs::create_dir_all(parent)?;

        let mut tmp_name = std::ffi::OsString::from(".");
        tmp_name.push(name);
        tmp_name.push(".tmp");
        let tmp = parent.join(tmp_name);

        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &[String]) -> Result<()> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_range(&self, prefix: &[String]) -> Result<Vec<(StorageKey, Vec<u8>)>> {
        let mut out = Vec::new();
        let path = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.path_for(prefix)?
        };

        if path.is_file() {
            out.push((prefix.to_vec(), fs::read(&path)?));
        } else {
            Self::walk(&path, &mut prefix.to_vec(), &mut out)?;
        }
        Ok(out)
    }

    fn remove_range(&self, prefix: &[String]) -> Result<()> {
        if prefix.is_empty() {
            for entry in fs::read_dir(&self.root)? {
                let path = entry?.path();
                if path.is_dir() {
                    fs::remove_dir_all(path)?;
                } else {
                    fs::remove_file(path)?;
                }
            }
            return Ok(());
        }

        let path = self.path_for(prefix)?;
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{DocStorage, Document, DocumentId};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn key(parts: &[&str]) -> StorageKey {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new(dir.path()).unwrap();

        storage.save(&key(&["doc", "snapshot"]), b"hello").unwrap();

        assert_eq!(
            storage.load(&key(&["doc", "snapshot"])).unwrap(),
            Some(b"hello".to_vec())
        );
        assert!(dir.path().join("doc").join("snapshot").is_file());
        assert_eq!(storage.load(&key(&["doc", "missing"])).unwrap(), None);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new(dir.path()).unwrap();

        storage.save(&key(&["doc", "snapshot"]), b"one").unwrap();
        storage.save(&key(&["doc", "snapshot"]), b"two").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path().join("doc"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("snapshot")]);
    }

    #[test]
    fn test_load_range_sorted() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new(dir.path()).unwrap();

        storage.save(&key(&["a", "incremental", "2"]), b"2").unwrap();
        storage.save(&key(&["a", "incremental", "1"]), b"1").unwrap();
        storage.save(&key(&["b", "snapshot"]), b"b").unwrap();

        let range = storage.load_range(&key(&["a", "incremental"])).unwrap();
        assert_eq!(
            range,
            vec![
                (key(&["a", "incremental", "1"]), b"1".to_vec()),
                (key(&["a", "incremental", "2"]), b"2".to_vec()),
            ]
        );

        assert_eq!(storage.keys(&[]).unwrap().len(), 3);
        assert!(storage.load_range(&key(&["nope"])).unwrap().is_empty());
    }

    #[test]
    fn test_remove_and_remove_range() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new(dir.path()).unwrap();

        storage.save(&key(&["a", "snapshot"]), b"s").unwrap();
        storage.save(&key(&["a", "incremental", "1"]), b"1").unwrap();

        storage.remove(&key(&["a", "snapshot"])).unwrap();
        storage.remove(&key(&["a", "snapshot"])).unwrap();
        assert_eq!(storage.load(&key(&["a", "snapshot"])).unwrap(), None);

        storage.remove_range(&key(&["a"])).unwrap();
        assert!(storage.keys(&[]).unwrap().is_empty());
        storage.remove_range(&key(&["a"])).unwrap();
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new(dir.path()).unwrap();

        let bad_keys: [&[&str]; 4] = [&["..", "x"], &["a/b"], &[""], &[".hidden"]];
        for bad in bad_keys {
            let err = storage.save(&key(bad), b"x").unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey(_)), "{bad:?}");
        }
    }

    #[test]
    fn test_doc_storage_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = DocumentId::generate();

        {
            let storage = DocStorage::new(Arc::new(FsStorage::new(dir.path()).unwrap()));
            let doc = Document::new();
            let empty = doc.version();
            doc.change(|d| d.set("counter", 3_i64)).unwrap();
            storage.save_doc(&id, &doc, &empty).unwrap();
        }

        let storage = DocStorage::new(Arc::new(FsStorage::new(dir.path()).unwrap()));
        assert_eq!(storage.list_documents().unwrap(), vec![id.clone()]);
        let doc = storage.load_doc(&id).unwrap().unwrap();
        assert_eq!(doc.to_json()["counter"], 3);
    }
}
