//! Synchronization module for CRDT-based real-time collaboration.
//!
//! The replicated core lives in [`clock`], [`sequence`], [`update`] and
//! [`document`]: a sequence CRDT with a formatting overlay whose updates can
//! be applied in any order, any number of times. [`presence`] carries the
//! ephemeral per-session state, [`protocol`] the wire format and [`server`]
//! the document rooms that connect sessions to a server-side replica.

pub mod clock;
pub mod document;
pub mod presence;
pub mod protocol;
pub mod sequence;
pub mod server;
pub mod update;

pub use document::{ApplyOutcome, CollabDocument, DocumentError};
pub use server::{SyncServer, SyncServerConfig};

use protocol::ErrorCode;

/// Unique identifier for a document
pub type DocumentId = String;

/// Unique identifier for a connected session
pub type SessionId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session {0} has not joined a document")]
    NotJoined(SessionId),

    #[error("Document {0} has reached its session limit")]
    DocumentFull(DocumentId),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Presence(#[from] presence::PresenceError),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

impl SyncError {
    /// Code reported to the client in a `ServerMessage::Error`
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SyncError::DocumentNotFound(_) => ErrorCode::DocumentNotFound,
            SyncError::SessionNotFound(_) | SyncError::NotJoined(_) => ErrorCode::NotJoined,
            SyncError::DocumentFull(_) => ErrorCode::DocumentFull,
            SyncError::Document(DocumentError::MalformedRecord(_))
            | SyncError::Presence(presence::PresenceError::MalformedRecord(_)) => {
                ErrorCode::MalformedRecord
            }
            SyncError::Presence(_) => ErrorCode::InvalidMessage,
            SyncError::ConnectionError(_) | SyncError::Document(_) | SyncError::Storage(_) => {
                ErrorCode::ServerError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::DocumentNotFound("test-123".to_string());
        assert_eq!(err.to_string(), "Document not found: test-123");
    }

    #[test]
    fn test_malformed_records_map_to_error_code() {
        let err: SyncError = DocumentError::MalformedRecord("truncated".into()).into();
        assert_eq!(err.error_code(), ErrorCode::MalformedRecord);
        assert_eq!(err.to_string(), "Malformed record: truncated");
        assert_eq!(
            SyncError::DocumentFull("d".into()).error_code(),
            ErrorCode::DocumentFull
        );
    }
}
