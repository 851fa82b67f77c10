//! Sled-based storage implementation for collaborative documents.
//!
//! Three trees are used:
//! - `updates`: one serialized update log per document
//! - `metadata`: bincode [`DocumentMetadata`] per document
//! - `sync_states`: last state vector each replica reported, keyed
//!   `document_id:replica_id`

use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::{DocumentMetadata, StorageConfig};
use crate::sync::clock::{ReplicaId, StateVector};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Tree names for different data types
const TREE_UPDATES: &str = "updates";
const TREE_METADATA: &str = "metadata";
const TREE_SYNC_STATES: &str = "sync_states";

/// Sled-based document store
#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<Db>,
    updates: Tree,
    metadata: Tree,
    sync_states: Tree,
}

impl DocumentStore {
    /// Open or create a document store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let updates = db.open_tree(TREE_UPDATES)?;
        let metadata = db.open_tree(TREE_METADATA)?;
        let sync_states = db.open_tree(TREE_SYNC_STATES)?;

        Ok(Self {
            db: Arc::new(db),
            updates,
            metadata,
            sync_states,
        })
    }

    /// Store the serialized update log of a document
    pub fn save_updates(&self, document_id: &str, log: &[u8]) -> StorageResult<()> {
        self.updates.insert(document_id.as_bytes(), log)?;
        Ok(())
    }

    /// Load the serialized update log of a document
    pub fn load_updates(&self, document_id: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.updates.get(document_id.as_bytes())?.map(|data| data.to_vec()))
    }

    /// A document exists once its metadata record has been written
    pub fn document_exists(&self, document_id: &str) -> StorageResult<bool> {
        Ok(self.metadata.contains_key(document_id.as_bytes())?)
    }

    /// Delete a document and all associated data
    pub fn delete_document(&self, document_id: &str) -> StorageResult<bool> {
        let key = document_id.as_bytes();
        let existed = self.metadata.remove(key)?.is_some();
        self.updates.remove(key)?;

        let prefix = sync_prefix(document_id);
        let mut to_remove = Vec::new();
        for item in self.sync_states.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            to_remove.push(key);
        }
        for key in to_remove {
            self.sync_states.remove(key)?;
        }

        Ok(existed)
    }

    /// Save document metadata
    pub fn save_metadata(&self, meta: &DocumentMetadata) -> StorageResult<()> {
        let bytes = bincode::serialize(meta)?;
        self.metadata.insert(meta.document_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Load document metadata
    pub fn get_metadata(&self, document_id: &str) -> StorageResult<Option<DocumentMetadata>> {
        match self.metadata.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all documents, most recently modified first
    pub fn list_documents(&self) -> StorageResult<Vec<DocumentMetadata>> {
        let mut docs = Vec::new();
        for item in self.metadata.iter() {
            let (_, value) = item?;
            let meta: DocumentMetadata = bincode::deserialize(&value)?;
            docs.push(meta);
        }
        docs.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(docs)
    }

    /// Apply `f` to a document's metadata and store the result
    pub fn update_metadata(
        &self,
        document_id: &str,
        f: impl FnOnce(&mut DocumentMetadata),
    ) -> StorageResult<DocumentMetadata> {
        let mut meta = self
            .get_metadata(document_id)?
            .ok_or_else(|| StorageError::NotFound(document_id.to_string()))?;
        f(&mut meta);
        self.save_metadata(&meta)?;
        Ok(meta)
    }

    /// Record that an edit was accepted
    pub fn touch_document(&self, document_id: &str) -> StorageResult<DocumentMetadata> {
        self.update_metadata(document_id, DocumentMetadata::touch)
    }

    pub fn set_active_sessions(&self, document_id: &str, count: u32) -> StorageResult<DocumentMetadata> {
        self.update_metadata(document_id, |meta| meta.active_session_count = count)
    }

    /// Remember the state vector a replica reported for a document
    pub fn save_sync_state(
        &self,
        document_id: &str,
        replica: ReplicaId,
        vector: &StateVector,
    ) -> StorageResult<()> {
        let key = format!("{}{}", sync_prefix(document_id), replica);
        self.sync_states.insert(key.as_bytes(), vector.encode()?)?;
        Ok(())
    }

    /// All replica state vectors recorded for a document
    pub fn load_sync_states(&self, document_id: &str) -> StorageResult<Vec<(ReplicaId, StateVector)>> {
        let prefix = sync_prefix(document_id);
        let mut states = Vec::new();
        for item in self.sync_states.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let replica = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            match u64::from_str_radix(&replica, 16) {
                Ok(id) => states.push((ReplicaId(id), StateVector::decode(&value)?)),
                Err(_) => tracing::warn!("Skipping sync state with bad key {}", replica),
            }
        }
        Ok(states)
    }

    /// Forget a replica that will never reconnect
    pub fn remove_sync_state(&self, document_id: &str, replica: ReplicaId) -> StorageResult<()> {
        let key = format!("{}{}", sync_prefix(document_id), replica);
        self.sync_states.remove(key.as_bytes())?;
        Ok(())
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            document_count: self.metadata.len(),
            update_log_count: self.updates.len(),
            sync_state_count: self.sync_states.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

fn sync_prefix(document_id: &str) -> String {
    format!("{}:", document_id)
}

/// Statistics about the storage
#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageStats {
    pub document_count: usize,
    pub update_log_count: usize,
    pub sync_state_count: usize,
    pub total_size_bytes: u64,
}

impl Drop for DocumentStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn test_store() -> (TempDir, DocumentStore) {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        let store = DocumentStore::open(config).unwrap();
        (dir, store)
    }

    #[test]
    fn test_update_log_save_load() {
        let (_dir, store) = test_store();
        store.save_updates("doc-1", b"update log bytes").unwrap();

        assert_eq!(store.load_updates("doc-1").unwrap().unwrap(), b"update log bytes");
        assert!(store.load_updates("missing").unwrap().is_none());
    }

    #[test]
    fn test_metadata_lifecycle() {
        let (_dir, store) = test_store();
        store.save_metadata(&DocumentMetadata::new("doc-1", "Draft")).unwrap();
        assert!(store.document_exists("doc-1").unwrap());

        let meta = store.update_metadata("doc-1", |m| m.title = "Final".into()).unwrap();
        assert_eq!(meta.title, "Final");

        let meta = store.set_active_sessions("doc-1", 3).unwrap();
        assert_eq!(meta.active_session_count, 3);
        assert_eq!(store.get_metadata("doc-1").unwrap().unwrap().title, "Final");

        assert!(matches!(
            store.touch_document("missing"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_sorted_by_last_modified() {
        let (_dir, store) = test_store();
        let mut old = DocumentMetadata::new("old", "Old");
        old.last_modified = 10;
        let mut new = DocumentMetadata::new("new", "New");
        new.last_modified = 20;
        store.save_metadata(&old).unwrap();
        store.save_metadata(&new).unwrap();

        let ids: Vec<String> = store
            .list_documents()
            .unwrap()
            .into_iter()
            .map(|m| m.document_id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
    }

    #[test]
    fn test_sync_states_per_document() {
        let (_dir, store) = test_store();
        let sv: StateVector = [(ReplicaId(1), 4), (ReplicaId(2), 9)].into_iter().collect();

        store.save_sync_state("doc-1", ReplicaId(0xabc), &sv).unwrap();
        store.save_sync_state("doc-1", ReplicaId(0xdef), &StateVector::new()).unwrap();
        store.save_sync_state("doc-10", ReplicaId(0xabc), &sv).unwrap();

        let states = store.load_sync_states("doc-1").unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.contains(&(ReplicaId(0xabc), sv)));

        store.remove_sync_state("doc-1", ReplicaId(0xdef)).unwrap();
        assert_eq!(store.load_sync_states("doc-1").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_document() {
        let (_dir, store) = test_store();
        store.save_updates("gone", b"data").unwrap();
        store.save_metadata(&DocumentMetadata::new("gone", "Test")).unwrap();
        store.save_sync_state("gone", ReplicaId(1), &StateVector::new()).unwrap();

        assert!(store.delete_document("gone").unwrap());
        assert!(!store.document_exists("gone").unwrap());
        assert!(store.load_updates("gone").unwrap().is_none());
        assert!(store.load_sync_states("gone").unwrap().is_empty());
        assert!(!store.delete_document("gone").unwrap());
    }
}
