//! Storage abstraction for the operation log, snapshots and sync cursors.
//!
//! This module defines the [`SyncStorage`] trait which abstracts over
//! durable backends (SQLite, in-memory) for the three persisted record
//! kinds: append-only operations, materialized snapshots, and per-device
//! sync-state cursors. All records are keyed by account.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use crate::error::SyncError;
use crate::op::{Operation, OperationId};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, SyncError>;

/// A persisted operation: the immutable record plus its server-assigned
/// acceptance id (the log's total order within an account).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOperation {
    /// Acceptance id, monotonic per account.
    pub id: OperationId,
    pub account_id: String,
    pub operation: Operation,
    /// Server wall-clock acceptance time (unix millis).
    pub accepted_at: i64,
}

/// A persisted snapshot: materialized document bytes plus the id of the
/// last operation folded in.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub id: i64,
    pub account_id: String,
    pub last_operation_id: OperationId,
    /// Canonical document bytes ([`crate::model::Document::to_bytes`]).
    pub data: Vec<u8>,
    pub entity_count: u64,
    pub size_bytes: u64,
    pub created_at: i64,
}

/// Per-(account, device) sync cursor: the last operation id known to have
/// been applied by that device.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCursor {
    pub account_id: String,
    pub device_id: String,
    pub last_operation_id: OperationId,
    pub updated_at: i64,
}

/// Trait for sync engine storage backends.
///
/// Implementations persist three record kinds per account:
/// 1. **Operations**: the append-only, content-addressed ledger
/// 2. **Snapshots**: compacted document state bounding replay cost
/// 3. **Cursors**: per-device catch-up positions
///
/// Dedup and gap *policy* live in [`crate::oplog::OperationLog`]; the
/// backend only supplies the primitive queries the policy needs.
pub trait SyncStorage: Send + Sync {
    // ===== Operations =====

    /// Acceptance id for a content hash already in the log, if any.
    fn operation_id_for_hash(
        &self,
        account_id: &str,
        content_hash: &str,
    ) -> StorageResult<Option<OperationId>>;

    /// Highest sequence number accepted for an actor, if any.
    fn last_sequence(&self, account_id: &str, actor_id: &str) -> StorageResult<Option<u64>>;

    /// Append an operation, assigning the next acceptance id.
    ///
    /// The caller ([`crate::oplog::OperationLog`]) has already checked for
    /// duplicates and gaps.
    fn insert_operation(&self, account_id: &str, op: &Operation) -> StorageResult<StoredOperation>;

    /// Operations with id greater than `after`, in acceptance order.
    fn operations_since(
        &self,
        account_id: &str,
        after: OperationId,
    ) -> StorageResult<Vec<StoredOperation>>;

    /// Smallest retained acceptance id, or None when the log tail is empty.
    fn oldest_operation_id(&self, account_id: &str) -> StorageResult<Option<OperationId>>;

    /// Greatest acceptance id, or 0 when no operation was ever accepted.
    fn latest_operation_id(&self, account_id: &str) -> StorageResult<OperationId>;

    /// Number of retained operations with id greater than `after`.
    fn operation_count_since(&self, account_id: &str, after: OperationId) -> StorageResult<u64>;

    /// Archive (drop from the live log) operations with id ≤ `up_to`.
    /// Only called for ranges already folded into a snapshot and below
    /// every device cursor. Returns the number of archived operations.
    fn archive_operations_up_to(
        &self,
        account_id: &str,
        up_to: OperationId,
    ) -> StorageResult<u64>;

    // ===== Snapshots =====

    /// Persist a snapshot, returning its id.
    fn save_snapshot(
        &self,
        account_id: &str,
        last_operation_id: OperationId,
        data: &[u8],
        entity_count: u64,
        created_at: i64,
    ) -> StorageResult<i64>;

    /// Most recent snapshot for an account.
    fn latest_snapshot(&self, account_id: &str) -> StorageResult<Option<SnapshotRecord>>;

    /// All snapshots for an account, newest first.
    fn snapshots(&self, account_id: &str) -> StorageResult<Vec<SnapshotRecord>>;

    fn delete_snapshot(&self, account_id: &str, snapshot_id: i64) -> StorageResult<()>;

    // ===== Sync cursors =====

    /// Cursor for a device, if it ever synced.
    fn load_cursor(&self, account_id: &str, device_id: &str) -> StorageResult<Option<SyncCursor>>;

    /// Upsert a device cursor. Implementations must never move a cursor
    /// backwards; stale writes (smaller `last_operation_id`) are ignored.
    fn save_cursor(
        &self,
        account_id: &str,
        device_id: &str,
        last_operation_id: OperationId,
    ) -> StorageResult<()>;

    /// All device cursors for an account.
    fn cursors(&self, account_id: &str) -> StorageResult<Vec<SyncCursor>>;

    /// Accounts with at least one persisted operation or snapshot.
    fn account_ids(&self) -> StorageResult<Vec<String>>;
}
