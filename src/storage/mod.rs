//! Storage module for persistent document state using Sled.
//!
//! Each document is stored as one update-log blob (the serialized replica
//! history) plus a small metadata record. The state vectors that client
//! replicas report during reconciliation are kept alongside so tombstone
//! compaction knows what every replica has already seen.

mod sled_store;

pub use sled_store::{DocumentStore, StorageError, StorageResult, StorageStats};

use serde::{Deserialize, Serialize};

/// Metadata stored alongside each document's update log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Unique document identifier
    pub document_id: String,
    /// Human-readable title
    pub title: String,
    /// Creation time (milliseconds since epoch)
    pub created_at: i64,
    /// Last accepted edit or rename (milliseconds since epoch)
    pub last_modified: i64,
    /// Sessions currently connected to the document
    pub active_session_count: u32,
}

impl DocumentMetadata {
    pub fn new(document_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            document_id: document_id.into(),
            title: title.into(),
            created_at: now,
            last_modified: now,
            active_session_count: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_modified = chrono::Utc::now().timestamp_millis().max(self.last_modified);
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only explicit flushes)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/docsync.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval_ms(mut self, interval: u64) -> Self {
        self.flush_interval_ms = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_creation() {
        let meta = DocumentMetadata::new("doc-123", "Meeting notes");

        assert_eq!(meta.document_id, "doc-123");
        assert_eq!(meta.title, "Meeting notes");
        assert_eq!(meta.active_session_count, 0);
        assert!(meta.created_at > 0);
        assert_eq!(meta.created_at, meta.last_modified);
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let mut meta = DocumentMetadata::new("doc", "t");
        meta.last_modified = i64::MAX;
        meta.touch();
        assert_eq!(meta.last_modified, i64::MAX);
    }

    #[test]
    fn test_storage_config_builder() {
        let config = StorageConfig::new("/tmp/x.sled")
            .with_cache_size(1024)
            .with_flush_interval_ms(0);
        assert_eq!(config.path, "/tmp/x.sled");
        assert_eq!(config.cache_size, 1024);
        assert_eq!(config.flush_interval_ms, 0);
    }
}
