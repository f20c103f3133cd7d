#![doc = include_str!("../README.md")]

/// Error (common error types)
pub mod error;

/// Conflict-free document model (bookmarks, folders, tags)
pub mod model;

/// Operation model: hashed, schema-validated mutation records
pub mod op;

/// Operation log: dedup, gap detection, catch-up plans
pub mod oplog;

/// Merge engine: acceptance-ordered replay and materialization
pub mod merge;

/// Snapshot manager: threshold-triggered compaction with retention
pub mod snapshot;

/// Storage backends for operations, snapshots and sync cursors
pub mod storage;

/// Sync protocol: wire messages, client session, retry policy
pub mod sync;
