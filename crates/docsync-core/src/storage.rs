//! Storage subsystem: key/value adapters plus document-level persistence.
//!
//! Adapters store opaque byte blobs under hierarchical keys. `DocStorage`
//! lays documents out on top of them:
//!
//! - `[doc_id, "snapshot"]`: full Loro snapshot written on compaction
//! - `[doc_id, "incremental", <hash>]`: update chunks written per change
//!
//! After `COMPACTION_THRESHOLD` incremental saves the document is compacted
//! into a single snapshot and the chunks are removed.

use crate::document::{Document, DocumentError};
use crate::document_id::DocumentId;
use crate::repo_id::fnv1a_bytes;
use loro::VersionVector;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Hierarchical storage key.
pub type StorageKey = Vec<String>;

/// Incremental saves before a document is compacted.
pub const COMPACTION_THRESHOLD: usize = 10;

const SNAPSHOT: &str = "snapshot";
const INCREMENTAL: &str = "incremental";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Invalid storage key {0:?}")]
    InvalidKey(StorageKey),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Byte-oriented key/value backend.
pub trait StorageAdapter: Send + Sync {
    fn load(&self, key: &[String]) -> Result<Option<Vec<u8>>>;

    fn save(&self, key: &[String], data: &[u8]) -> Result<()>;

    fn remove(&self, key: &[String]) -> Result<()>;

    /// All entries whose key starts with `prefix`, sorted by key.
    fn load_range(&self, prefix: &[String]) -> Result<Vec<(StorageKey, Vec<u8>)>>;

    fn remove_range(&self, prefix: &[String]) -> Result<()>;

    /// Keys starting with `prefix`, sorted.
    fn keys(&self, prefix: &[String]) -> Result<Vec<StorageKey>> {
        Ok(self
            .load_range(prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }
}

/// In-process adapter. Clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    data: Arc<Mutex<BTreeMap<StorageKey, Vec<u8>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageAdapter for InMemoryStorage {
    fn load(&self, key: &[String]) -> Result<Option<Vec<u8>>> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(data.get(key).cloned())
    }

    fn save(&self, key: &[String], bytes: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.insert(key.to_vec(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &[String]) -> Result<()> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.remove(key);
        Ok(())
    }

    fn load_range(&self, prefix: &[String]) -> Result<Vec<(StorageKey, Vec<u8>)>> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn remove_range(&self, prefix: &[String]) -> Result<()> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

/// Key component for a document id: percent-encoded, with `.` escaped too so
/// no component is hidden or a path step on disk.
pub fn id_component(id: &DocumentId) -> String {
    urlencoding::encode(id.as_str()).replace('.', "%2E")
}

/// Inverse of [`id_component`]; `None` unless `component` is exactly what
/// [`id_component`] produces for some id.
pub fn parse_id_component(component: &str) -> Option<DocumentId> {
    let id: DocumentId = urlencoding::decode(component).ok()?.parse().ok()?;
    (id_component(&id) == component).then_some(id)
}

/// Document persistence on top of a `StorageAdapter`.
#[derive(Clone)]
pub struct DocStorage {
    adapter: Arc<dyn StorageAdapter>,
    /// Incremental chunks written since the last snapshot, per document.
    pending: Arc<Mutex<HashMap<DocumentId, usize>>>,
}

impl DocStorage {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Load a document from its snapshot and incremental chunks.
    ///
    /// Returns `None` if nothing is stored for `id`.
    pub fn load_doc(&self, id: &DocumentId) -> Result<Option<Document>> {
        let entries = self.adapter.load_range(&[id_component(id)])?;
        if entries.is_empty() {
            return Ok(None);
        }

        // Snapshot first, then chunks in key order
        let (snapshots, chunks): (Vec<_>, Vec<_>) = entries
            .iter()
            .partition(|(key, _)| key.get(1).map(String::as_str) == Some(SNAPSHOT));
        let chunk_count = chunks.len();

        let doc = Document::from_chunks(
            snapshots
                .iter()
                .chain(chunks.iter())
                .map(|(_, data)| data.as_slice()),
        )?;

        self.set_pending(id, chunk_count);
        tracing::debug!(doc = %id, chunks = chunk_count, "Loaded document from storage");
        Ok(Some(doc))
    }

    /// Persist the operations `doc` gained since `since`.
    ///
    /// Writes one incremental chunk, or compacts once the threshold is hit.
    pub fn save_doc(&self, id: &DocumentId, doc: &Document, since: &VersionVector) -> Result<()> {
        let count = self.pending_count(id);
        if count + 1 >= COMPACTION_THRESHOLD {
            return self.compact(id, doc);
        }
        let updates = doc.export_updates(since)?;
        self.save_incremental(id, &updates)
    }

    /// Store one chunk of updates under a content-addressed key.
    pub fn save_incremental(&self, id: &DocumentId, data: &[u8]) -> Result<()> {
        let key = vec![
            id_component(id),
            INCREMENTAL.to_string(),
            format!("{:016x}", fnv1a_bytes(data)),
        ];
        self.adapter.save(&key, data)?;
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending.entry(id.clone()).or_insert(0) += 1;
        Ok(())
    }

    /// Replace all stored chunks with one snapshot.
    pub fn compact(&self, id: &DocumentId, doc: &Document) -> Result<()> {
        let snapshot = doc.export_snapshot()?;
        // Snapshot first so a failure in between never loses data
        self.adapter
            .save(&[id_component(id), SNAPSHOT.to_string()], &snapshot)?;
        self.adapter
            .remove_range(&[id_component(id), INCREMENTAL.to_string()])?;
        self.set_pending(id, 0);
        tracing::debug!(doc = %id, bytes = snapshot.len(), "Compacted document");
        Ok(())
    }

    pub fn remove_doc(&self, id: &DocumentId) -> Result<()> {
        self.adapter.remove_range(&[id_component(id)])?;
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }

    /// Ids of every stored document. Keys that no id maps to are skipped.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>> {
        let ids: BTreeSet<DocumentId> = self
            .adapter
            .keys(&[])?
            .into_iter()
            .filter_map(|key| key.first().and_then(|s| parse_id_component(s)))
            .collect();
        Ok(ids.into_iter().collect())
    }

    /// Incremental chunks written since the last compaction.
    pub fn pending_count(&self, id: &DocumentId) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    fn set_pending(&self, id: &DocumentId, count: usize) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(parts: &[&str]) -> StorageKey {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn doc_id(s: &str) -> DocumentId {
        s.parse().unwrap()
    }

    // ========================================================================
    // InMemoryStorage
    // ========================================================================

    #[test]
    fn test_memory_save_load_remove() {
        let storage = InMemoryStorage::new();
        storage.save(&key(&["a", "b"]), b"hello").unwrap();
        assert_eq!(storage.load(&key(&["a", "b"])).unwrap(), Some(b"hello".to_vec()));

        storage.remove(&key(&["a", "b"])).unwrap();
        assert_eq!(storage.load(&key(&["a", "b"])).unwrap(), None);
    }

    #[test]
    fn test_memory_ranges_respect_components() {
        let storage = InMemoryStorage::new();
        storage.save(&key(&["doc", "snapshot"]), b"1").unwrap();
        storage.save(&key(&["doc", "incremental", "x"]), b"2").unwrap();
        storage.save(&key(&["doc2", "snapshot"]), b"3").unwrap();

        let range = storage.load_range(&key(&["doc"])).unwrap();
        assert_eq!(range.len(), 2);

        storage.remove_range(&key(&["doc"])).unwrap();
        assert_eq!(storage.len(), 1);
        assert!(storage.load(&key(&["doc2", "snapshot"])).unwrap().is_some());
    }

    #[test]
    fn test_memory_clones_share_data() {
        let a = InMemoryStorage::new();
        let b = a.clone();
        a.save(&key(&["k"]), b"v").unwrap();
        assert_eq!(b.load(&key(&["k"])).unwrap(), Some(b"v".to_vec()));
    }

    // ========================================================================
    // DocStorage
    // ========================================================================

    #[test]
    fn test_load_missing_doc() {
        let storage = DocStorage::new(Arc::new(InMemoryStorage::new()));
        assert!(storage.load_doc(&doc_id("nope")).unwrap().is_none());
    }

    #[test]
    fn test_incremental_saves_reload() {
        let backend = InMemoryStorage::new();
        let storage = DocStorage::new(Arc::new(backend.clone()));
        let id = doc_id("doc");
        let doc = Document::new();

        for n in 1..=3i64 {
            let since = doc.version();
            doc.change(|d| d.set("counter", n)).unwrap();
            storage.save_doc(&id, &doc, &since).unwrap();
        }
        assert_eq!(storage.pending_count(&id), 3);
        assert_eq!(backend.len(), 3);

        let fresh = DocStorage::new(Arc::new(backend));
        let loaded = fresh.load_doc(&id).unwrap().unwrap();
        assert_eq!(loaded.to_json(), json!({"counter": 3}));
        assert_eq!(fresh.pending_count(&id), 3);
    }

    #[test]
    fn test_compaction_leaves_single_snapshot() {
        let backend = InMemoryStorage::new();
        let storage = DocStorage::new(Arc::new(backend.clone()));
        let id = doc_id("doc");
        let doc = Document::new();

        for n in 1..=COMPACTION_THRESHOLD as i64 {
            let since = doc.version();
            doc.change(|d| d.set("counter", n)).unwrap();
            storage.save_doc(&id, &doc, &since).unwrap();
        }

        let keys = backend.keys(&[]).unwrap();
        assert_eq!(keys, vec![key(&["doc", "snapshot"])]);
        assert_eq!(storage.pending_count(&id), 0);

        let loaded = storage.load_doc(&id).unwrap().unwrap();
        assert_eq!(loaded.to_json(), json!({"counter": COMPACTION_THRESHOLD}));
    }

    #[test]
    fn test_id_components_are_path_safe() {
        assert_eq!(id_component(&doc_id("doc-1_a")), "doc-1_a");
        assert_eq!(id_component(&doc_id("doc.1")), "doc%2E1");
        assert_eq!(id_component(&doc_id("../x")), "%2E%2E%2Fx");
        assert_eq!(id_component(&doc_id("a b")), "a%20b");
        assert_eq!(id_component(&doc_id("doc%201")), "doc%25201");

        for raw in ["doc.1", "../x", "a b", "doc%201", "ünï"] {
            let id = doc_id(raw);
            assert_eq!(parse_id_component(&id_component(&id)), Some(id));
        }
        assert_eq!(parse_id_component("not valid!"), None);
        assert_eq!(parse_id_component("doc.1"), None);
    }

    #[test]
    fn test_punctuated_id_round_trips_through_storage() {
        let backend = InMemoryStorage::new();
        let storage = DocStorage::new(Arc::new(backend.clone()));
        let doc = Document::new();
        doc.change(|d| d.set("x", 1i64)).unwrap();

        let id = doc_id(".hidden/../doc.1");
        storage.save_doc(&id, &doc, &Default::default()).unwrap();

        let keys = backend.keys(&[]).unwrap();
        assert!(keys.iter().all(|k| !k[0].starts_with('.') && !k[0].contains('/')));
        assert_eq!(storage.list_documents().unwrap(), vec![id.clone()]);
        let loaded = storage.load_doc(&id).unwrap().unwrap();
        assert_eq!(loaded.to_json(), json!({"x": 1}));
    }

    #[test]
    fn test_remove_and_list_documents() {
        let backend = InMemoryStorage::new();
        let storage = DocStorage::new(Arc::new(backend.clone()));
        let doc = Document::new();
        doc.change(|d| d.set("x", 1i64)).unwrap();

        storage.compact(&doc_id("b"), &doc).unwrap();
        storage.compact(&doc_id("a"), &doc).unwrap();
        backend.save(&key(&["not valid!", "snapshot"]), b"junk").unwrap();

        assert_eq!(storage.list_documents().unwrap(), vec![doc_id("a"), doc_id("b")]);

        storage.remove_doc(&doc_id("a")).unwrap();
        assert_eq!(storage.list_documents().unwrap(), vec![doc_id("b")]);
    }
}
