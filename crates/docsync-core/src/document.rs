//! Document: Loro document wrapper for one replicated JSON-like mapping.
//!
//! Each document is a Loro document whose `root` map holds the user-visible
//! keys. Merge logic and the operation log stay inside Loro; this module only
//! exposes the pieces the repository needs (versions, exports, imports) and a
//! narrow mutation view for change callbacks.

use loro::{ExportMode, LoroDoc, LoroMap, LoroValue, VersionVector};
use thiserror::Error;

/// Name of the root map container.
pub const ROOT_MAP: &str = "root";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// A single replicated document.
pub struct Document {
    doc: LoroDoc,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self { doc: LoroDoc::new() }
    }

    /// Create a document from stored snapshot and update chunks, applied in order.
    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Result<Self> {
        let document = Self::new();
        for chunk in chunks {
            document.import(chunk)?;
        }
        Ok(document)
    }

    /// Current version vector of the operation log.
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    /// Whether the document has no operations at all.
    pub fn is_empty(&self) -> bool {
        VersionVector::default().includes_vv(&self.version())
    }

    /// Export a full snapshot.
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Export the operations not covered by `from`.
    pub fn export_updates(&self, from: &VersionVector) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::updates(from))
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Import a snapshot or updates. Returns true if the version moved.
    pub fn import(&self, data: &[u8]) -> Result<bool> {
        if data.is_empty() {
            return Ok(false);
        }
        let before = self.version();
        self.doc
            .import(data)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(self.version() != before)
    }

    /// Run a mutation against the root map and commit it.
    ///
    /// The callback edits a fork carrying this document's peer id; its
    /// operations are imported only when it returns `Ok`, so a failing
    /// callback leaves the document untouched.
    pub fn change<R>(&self, f: impl FnOnce(&DocMut<'_>) -> Result<R>) -> Result<(R, bool)> {
        let before = self.version();
        let draft = self.doc.fork();
        draft
            .set_peer_id(self.doc.peer_id())
            .map_err(|e| DocumentError::Loro(e.to_string()))?;

        let root = draft.get_map(ROOT_MAP);
        let out = f(&DocMut { root: &root })?;
        draft.commit();

        let updates = draft
            .export(ExportMode::updates(&before))
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        let changed = self.import(&updates)?;
        Ok((out, changed))
    }

    /// The root map as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        loro_value_to_json(&self.root().get_deep_value())
    }

    fn root(&self) -> LoroMap {
        self.doc.get_map(ROOT_MAP)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable view of a document's root map, handed to change callbacks.
pub struct DocMut<'a> {
    root: &'a LoroMap,
}

impl DocMut<'_> {
    /// Read a key as JSON.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        match self.root.get_deep_value() {
            LoroValue::Map(map) => map.get(key).map(loro_value_to_json),
            _ => None,
        }
    }

    /// Read a key as an integer, if it holds one.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    pub fn set(&self, key: &str, value: impl Into<LoroValue>) -> Result<()> {
        self.root
            .insert(key, value)
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.root
            .delete(key)
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Current contents of the root map, including edits made so far.
    pub fn value(&self) -> serde_json::Value {
        loro_value_to_json(&self.root.get_deep_value())
    }
}

/// Convert LoroValue to serde_json::Value
pub fn loro_value_to_json(value: &LoroValue) -> serde_json::Value {
    match value {
        LoroValue::Null => serde_json::Value::Null,
        LoroValue::Bool(b) => serde_json::Value::Bool(*b),
        LoroValue::I64(n) => serde_json::json!(*n),
        LoroValue::Double(n) => serde_json::json!(*n),
        LoroValue::String(s) => serde_json::Value::String(s.to_string()),
        LoroValue::List(arr) => serde_json::Value::Array(arr.iter().map(loro_value_to_json).collect()),
        LoroValue::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), loro_value_to_json(v)))
                .collect(),
        ),
        _ => serde_json::Value::Null, // Binary and container refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_document_is_empty() {
        let doc = Document::new();
        assert!(doc.is_empty());
        assert_eq!(doc.to_json(), json!({}));
    }

    #[test]
    fn test_change_reports_version_move() {
        let doc = Document::new();
        let ((), changed) = doc.change(|d| d.set("counter", 1i64)).unwrap();
        assert!(changed);
        assert!(!doc.is_empty());
        assert_eq!(doc.to_json(), json!({"counter": 1}));

        let ((), changed) = doc.change(|_| Ok(())).unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_failed_change_discards_partial_writes() {
        let doc = Document::new();
        doc.change(|d| d.set("counter", 1i64)).unwrap();
        let before = doc.version();

        let result: Result<((), bool)> = doc.change(|d| {
            d.set("half", 1i64)?;
            Err(DocumentError::Serialization("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(doc.version(), before);
        assert_eq!(doc.to_json(), json!({"counter": 1}));

        // A later change does not pick the discarded write up
        doc.change(|d| d.set("counter", 2i64)).unwrap();
        assert_eq!(doc.to_json(), json!({"counter": 2}));
    }

    #[test]
    fn test_docmut_reads_own_writes() {
        let doc = Document::new();
        let (seen, _) = doc
            .change(|d| {
                d.set("name", "alpha")?;
                Ok(d.get("name"))
            })
            .unwrap();
        assert_eq!(seen, Some(json!("alpha")));
    }

    #[test]
    fn test_get_i64_ignores_other_types() {
        let doc = Document::new();
        let (n, _) = doc
            .change(|d| {
                d.set("counter", "seven")?;
                Ok(d.get_i64("counter"))
            })
            .unwrap();
        assert_eq!(n, None);
    }

    #[test]
    fn test_delete_key() {
        let doc = Document::new();
        doc.change(|d| d.set("gone", true)).unwrap();
        doc.change(|d| d.delete("gone")).unwrap();
        assert_eq!(doc.to_json(), json!({}));
    }

    #[test]
    fn test_snapshot_import() {
        let a = Document::new();
        a.change(|d| d.set("timestamp", "2024-01-01T00:00:00.000Z")).unwrap();

        let b = Document::from_chunks([a.export_snapshot().unwrap().as_slice()]).unwrap();
        assert_eq!(b.to_json(), a.to_json());
        assert_eq!(b.version(), a.version());
    }

    #[test]
    fn test_export_updates_since_version() {
        let a = Document::new();
        a.change(|d| d.set("counter", 1i64)).unwrap();
        let b = Document::from_chunks([a.export_snapshot().unwrap().as_slice()]).unwrap();

        let seen = b.version();
        a.change(|d| d.set("counter", 2i64)).unwrap();

        let delta = a.export_updates(&seen).unwrap();
        assert!(b.import(&delta).unwrap());
        assert_eq!(b.to_json(), json!({"counter": 2}));

        // Re-importing is a no-op
        assert!(!b.import(&delta).unwrap());
    }

    #[test]
    fn test_import_empty_is_noop() {
        let doc = Document::new();
        assert!(!doc.import(&[]).unwrap());
    }

    #[test]
    fn test_import_garbage_fails() {
        let doc = Document::new();
        assert!(matches!(doc.import(&[1, 2, 3, 4]), Err(DocumentError::Loro(_))));
    }

    #[test]
    fn test_loro_value_to_json_nested() {
        let doc = Document::new();
        doc.change(|d| {
            d.set("flag", true)?;
            d.set("ratio", 0.5)?;
            d.set("nothing", LoroValue::Null)
        })
        .unwrap();
        assert_eq!(
            doc.to_json(),
            json!({"flag": true, "ratio": 0.5, "nothing": null})
        );
    }
}
