//! Snapshot manager: bounds the cost of bringing a stale replica up to date.
//!
//! Snapshots are created after a threshold of accepted operations, pruned
//! under a retention cap, and never deleted while an active device cursor
//! still depends on one; catch-up degrades to full operation replay
//! instead.

use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::merge;
use crate::oplog::OperationLog;
use crate::storage::{SnapshotRecord, SyncStorage};

/// Tuning for snapshot creation and retention.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Create a snapshot after this many accepted operations since the
    /// previous one.
    pub threshold: u64,
    /// Keep at most this many snapshots per account.
    pub retention: usize,
    /// Tombstones older than this are purged at materialization time
    /// (they have outlived any plausible concurrent revive).
    pub tombstone_retention_ms: i64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            threshold: 2000,
            retention: 3,
            tombstone_retention_ms: 30 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Periodic materialization of the document for one account.
#[derive(Clone)]
pub struct SnapshotManager {
    storage: Arc<dyn SyncStorage>,
    account_id: String,
    config: SnapshotConfig,
}

impl SnapshotManager {
    pub fn new(
        storage: Arc<dyn SyncStorage>,
        account_id: impl Into<String>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            storage,
            account_id: account_id.into(),
            config,
        }
    }

    /// Snapshot if the operation count since the last snapshot crossed the
    /// threshold; then prune old snapshots and archive folded operations.
    ///
    /// A failure here never blocks live operation acceptance: the caller
    /// logs it and catch-up degrades to full-log replay until the next
    /// successful attempt.
    pub fn maybe_snapshot(&self, log: &OperationLog) -> Result<Option<SnapshotRecord>> {
        let base = self.storage.latest_snapshot(&self.account_id)?;
        let since = base.as_ref().map(|s| s.last_operation_id).unwrap_or(0);
        let pending = log.count_since(since)?;
        if pending < self.config.threshold {
            return Ok(None);
        }

        let snapshot = self.materialize(log)?;
        self.prune()?;
        self.archive_folded(&snapshot)?;
        Ok(Some(snapshot))
    }

    /// Materialize and persist a snapshot from the latest snapshot plus the
    /// operation tail.
    ///
    /// Idempotent: re-running for the same log range produces byte-identical
    /// `snapshot_data` (deterministic merge over canonical document bytes),
    /// which verification and tests rely on.
    pub fn materialize(&self, log: &OperationLog) -> Result<SnapshotRecord> {
        let base = self.storage.latest_snapshot(&self.account_id)?;
        let since = base.as_ref().map(|s| s.last_operation_id).unwrap_or(0);
        let tail = log.operations_since(since)?;

        let last_operation_id = tail.last().map(|op| op.id).unwrap_or(since);
        let mut doc = merge::materialize(base.as_ref(), &tail)?;

        let now = chrono::Utc::now().timestamp_millis();
        doc.purge_tombstones(now - self.config.tombstone_retention_ms);

        let data = doc
            .to_bytes()
            .map_err(|e| SyncError::SnapshotMaterialization(e.to_string()))?;
        let entity_count = doc.entity_count();

        let id = self.storage.save_snapshot(
            &self.account_id,
            last_operation_id,
            &data,
            entity_count,
            now,
        )?;

        Ok(SnapshotRecord {
            id,
            account_id: self.account_id.clone(),
            last_operation_id,
            size_bytes: data.len() as u64,
            data,
            entity_count,
            created_at: now,
        })
    }

    /// Delete snapshots beyond the retention cap, oldest first.
    ///
    /// A snapshot is kept, cap notwithstanding, while some device cursor
    /// sits below it *and* the operations that would serve that cursor are
    /// no longer retained; deleting it would strand the device entirely.
    fn prune(&self) -> Result<()> {
        let snapshots = self.storage.snapshots(&self.account_id)?; // newest first
        if snapshots.len() <= self.config.retention {
            return Ok(());
        }

        let cursors = self.storage.cursors(&self.account_id)?;
        let oldest_retained_op = self.storage.oldest_operation_id(&self.account_id)?;

        for snap in &snapshots[self.config.retention..] {
            let still_required = cursors.iter().any(|cursor| {
                cursor.last_operation_id < snap.last_operation_id
                    && match oldest_retained_op {
                        Some(oldest) => cursor.last_operation_id < oldest - 1,
                        None => true,
                    }
            });
            if still_required {
                log::debug!(
                    "keeping snapshot {} past retention: an active cursor still needs it",
                    snap.id
                );
                continue;
            }
            self.storage.delete_snapshot(&self.account_id, snap.id)?;
        }
        Ok(())
    }

    /// Archive operations folded into the new snapshot, but never past any
    /// device cursor: a device resuming catch-up replays from its last
    /// applied operation, which must still exist.
    fn archive_folded(&self, snapshot: &SnapshotRecord) -> Result<()> {
        let cursors = self.storage.cursors(&self.account_id)?;
        let min_cursor = cursors
            .iter()
            .map(|c| c.last_operation_id)
            .min()
            .unwrap_or(snapshot.last_operation_id);

        let up_to = snapshot.last_operation_id.min(min_cursor);
        if up_to > 0 {
            let archived = self
                .storage
                .archive_operations_up_to(&self.account_id, up_to)?;
            if archived > 0 {
                log::debug!(
                    "archived {} operations up to {} for account {}",
                    archived,
                    up_to,
                    self.account_id
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Document;
    use crate::op::{EntitySeed, FieldMutation, Operation};
    use crate::storage::MemoryStore;

    fn create_op(seq: u64) -> Operation {
        Operation::new(
            "dev-a",
            seq,
            FieldMutation::Create {
                entity_id: format!("b{}", seq),
                seed: EntitySeed::Bookmark {
                    url: format!("https://example.com/{}", seq),
                    title: format!("Bookmark {}", seq),
                    description: None,
                    notes: None,
                    folder_id: None,
                    favicon: None,
                    pinned: false,
                    tags: vec![],
                },
                logical_ts: seq,
            },
            seq as i64,
        )
    }

    fn setup(threshold: u64, retention: usize) -> (Arc<MemoryStore>, OperationLog, SnapshotManager) {
        let storage = Arc::new(MemoryStore::new());
        let log = OperationLog::new(storage.clone(), "acct");
        let manager = SnapshotManager::new(
            storage.clone(),
            "acct",
            SnapshotConfig {
                threshold,
                retention,
                ..Default::default()
            },
        );
        (storage, log, manager)
    }

    #[test]
    fn test_no_snapshot_below_threshold() {
        let (_, log, manager) = setup(5, 3);
        for seq in 1..=4 {
            log.append(&create_op(seq)).unwrap();
        }
        assert!(manager.maybe_snapshot(&log).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_at_threshold_covers_log() {
        let (_, log, manager) = setup(5, 3);
        for seq in 1..=5 {
            log.append(&create_op(seq)).unwrap();
        }
        let snap = manager.maybe_snapshot(&log).unwrap().unwrap();
        assert_eq!(snap.last_operation_id, 5);
        assert_eq!(snap.entity_count, 5);

        let doc = Document::from_bytes(&snap.data).unwrap();
        assert_eq!(doc.live_bookmarks().count(), 5);
    }

    #[test]
    fn test_materialize_is_byte_identical_when_rerun() {
        let (storage, log, manager) = setup(1, 10);
        for seq in 1..=3 {
            log.append(&create_op(seq)).unwrap();
        }
        let first = manager.materialize(&log).unwrap();
        // drop the record so the second run covers the same range
        storage.delete_snapshot("acct", first.id).unwrap();
        let second = manager.materialize(&log).unwrap();
        assert_eq!(first.data, second.data);
        assert_eq!(first.last_operation_id, second.last_operation_id);
    }

    #[test]
    fn test_snapshot_equivalence_from_base_or_empty() {
        let (storage, log, manager) = setup(3, 10);
        for seq in 1..=3 {
            log.append(&create_op(seq)).unwrap();
        }
        manager.maybe_snapshot(&log).unwrap().unwrap();
        for seq in 4..=6 {
            log.append(&create_op(seq)).unwrap();
        }

        // materialize(latestSnapshot, opsSinceSnapshot)
        let incremental = manager.materialize(&log).unwrap();

        // materialize(emptyDocument, allOperations): no device cursors exist,
        // so ops were archived only up to the snapshot; rebuild "all ops" by
        // replaying the first snapshot's state plus the retained tail.
        let all_ops_doc = {
            let base = storage.snapshots("acct").unwrap();
            let oldest = base.last().unwrap();
            let tail = storage.operations_since("acct", oldest.last_operation_id).unwrap();
            merge::materialize(Some(oldest), &tail).unwrap()
        };

        assert_eq!(
            Document::from_bytes(&incremental.data).unwrap(),
            all_ops_doc
        );
    }

    #[test]
    fn test_retention_prunes_oldest() {
        let (storage, log, manager) = setup(1, 2);
        for seq in 1..=5 {
            log.append(&create_op(seq)).unwrap();
            manager.maybe_snapshot(&log).unwrap();
        }
        let snapshots = storage.snapshots("acct").unwrap();
        assert!(snapshots.len() <= 2, "got {} snapshots", snapshots.len());
    }

    #[test]
    fn test_archive_never_passes_device_cursor() {
        let (storage, log, manager) = setup(3, 3);
        for seq in 1..=3 {
            log.append(&create_op(seq)).unwrap();
        }
        // a device paused mid-catch-up at operation 1
        storage.save_cursor("acct", "slow-device", 1).unwrap();

        manager.maybe_snapshot(&log).unwrap().unwrap();

        // operations after the cursor must survive for resumption
        let remaining = storage.operations_since("acct", 1).unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn test_materialization_failure_surfaces_but_log_lives_on() {
        let (storage, log, manager) = setup(1, 3);
        log.append(&create_op(1)).unwrap();
        // corrupt the latest snapshot so the next materialization fails
        storage.save_snapshot("acct", 0, b"corrupt", 0, 0).unwrap();

        assert!(matches!(
            manager.maybe_snapshot(&log),
            Err(SyncError::SnapshotMaterialization(_))
        ));
        // acceptance is unaffected
        log.append(&create_op(2)).unwrap();
        assert_eq!(log.latest_operation_id().unwrap(), 2);
    }
}
