use serde::Serialize;
use thiserror::Error;

/// Unified error type for linkmark operations.
///
/// A duplicate operation is deliberately *not* represented here: re-submitting
/// an operation whose content hash is already in the log resolves to success
/// (see [`crate::oplog::AppendOutcome::Duplicate`]).
#[derive(Debug, Error)]
pub enum SyncError {
    /// An actor skipped ahead (or reused) a sequence number. The device must
    /// re-handshake; the gap is never silently healed.
    #[error("sequence gap for actor '{actor_id}': expected {expected}, got {got}")]
    SequenceGap {
        actor_id: String,
        expected: u64,
        got: u64,
    },

    /// The operation payload failed structural validation and was rejected
    /// before it reached the log.
    #[error("malformed operation: {0}")]
    MalformedOperation(String),

    /// Durable storage is unavailable or misbehaving. Retryable by the
    /// caller; an already-queued client operation is safe to resubmit thanks
    /// to hash deduplication.
    #[error("storage error: {0}")]
    Storage(String),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Snapshot materialization failed. Logged and skipped; live operation
    /// acceptance continues and catch-up degrades to full-log replay.
    #[error("snapshot materialization failed: {0}")]
    SnapshotMaterialization(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Network/transport failure in a sync client or session.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for linkmark operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// A serializable representation of SyncError for surfacing over IPC or wire
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&SyncError> for SerializableError {
    fn from(err: &SyncError) -> Self {
        let kind = match err {
            SyncError::SequenceGap { .. } => "SequenceGap",
            SyncError::MalformedOperation(_) => "MalformedOperation",
            SyncError::Storage(_) => "Storage",
            #[cfg(feature = "sqlite")]
            SyncError::Database(_) => "Database",
            SyncError::SnapshotMaterialization(_) => "SnapshotMaterialization",
            SyncError::Encoding(_) => "Encoding",
            SyncError::Transport(_) => "Transport",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl SyncError {
    /// Whether the caller may retry the failed request as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Storage(_) | SyncError::Transport(_) => true,
            #[cfg(feature = "sqlite")]
            SyncError::Database(_) => true,
            _ => false,
        }
    }

    /// Convert to a serializable representation
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}
