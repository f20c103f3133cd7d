//! The operation log: durable, ordered, deduplicated ledger of all
//! accepted mutations for one account.
//!
//! Policy lives here (hash deduplication, per-actor gap detection,
//! acceptance ordering) while the [`SyncStorage`] backend supplies the
//! primitive queries.

use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::op::{Operation, OperationId};
use crate::storage::{SnapshotRecord, StoredOperation, SyncStorage};

/// Outcome of an append. `Duplicate` is success: the operation (same
/// content hash) is already in the log and callers must treat the submit
/// as accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Accepted(StoredOperation),
    Duplicate(OperationId),
}

impl AppendOutcome {
    /// Acceptance id of the operation, whether fresh or already present.
    pub fn operation_id(&self) -> OperationId {
        match self {
            AppendOutcome::Accepted(stored) => stored.id,
            AppendOutcome::Duplicate(id) => *id,
        }
    }
}

/// Everything a stale device needs to catch up: an optional snapshot
/// bootstrap (when its cursor predates the retained operation tail)
/// followed by acceptance-ordered operations.
#[derive(Debug, Clone)]
pub struct CatchupPlan {
    pub snapshot: Option<SnapshotRecord>,
    pub operations: Vec<StoredOperation>,
}

impl CatchupPlan {
    /// Number of operations the device will receive.
    pub fn estimated_count(&self) -> u64 {
        self.operations.len() as u64
    }
}

/// Append-only operation ledger for one account.
#[derive(Clone)]
pub struct OperationLog {
    storage: Arc<dyn SyncStorage>,
    account_id: String,
}

impl OperationLog {
    pub fn new(storage: Arc<dyn SyncStorage>, account_id: impl Into<String>) -> Self {
        Self {
            storage,
            account_id: account_id.into(),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn storage(&self) -> &Arc<dyn SyncStorage> {
        &self.storage
    }

    /// Append an operation to the log.
    ///
    /// - Re-submitting a known content hash returns [`AppendOutcome::Duplicate`]
    ///   (idempotent replay, not an error).
    /// - An actor skipping ahead of its expected sequence number, or reusing
    ///   a sequence number with different content, yields
    ///   [`SyncError::SequenceGap`]: the device must resync; the log is never
    ///   silently "healed" by guessing.
    pub fn append(&self, op: &Operation) -> Result<AppendOutcome> {
        op.validate()?;

        if let Some(id) = self
            .storage
            .operation_id_for_hash(&self.account_id, &op.content_hash)?
        {
            return Ok(AppendOutcome::Duplicate(id));
        }

        let expected = self
            .storage
            .last_sequence(&self.account_id, &op.actor_id)?
            .map_or(1, |last| last + 1);
        if op.sequence_number != expected {
            // Ahead: the device lost operations we never saw. Behind with a
            // new hash: a sequence number is being reused with different
            // content. Either way the actor's history is corrupt.
            return Err(SyncError::SequenceGap {
                actor_id: op.actor_id.clone(),
                expected,
                got: op.sequence_number,
            });
        }

        let stored = self.storage.insert_operation(&self.account_id, op)?;
        Ok(AppendOutcome::Accepted(stored))
    }

    /// Operations accepted after `cursor`, in acceptance order (the log's
    /// global order, never actor-local sequence order).
    pub fn operations_since(&self, cursor: OperationId) -> Result<Vec<StoredOperation>> {
        self.storage.operations_since(&self.account_id, cursor)
    }

    /// Greatest acceptance id, 0 when the log is empty.
    pub fn latest_operation_id(&self) -> Result<OperationId> {
        self.storage.latest_operation_id(&self.account_id)
    }

    /// Retained operations accepted after `cursor`.
    pub fn count_since(&self, cursor: OperationId) -> Result<u64> {
        self.storage.operation_count_since(&self.account_id, cursor)
    }

    /// Compute the catch-up set for a device cursor (`0` for a first run).
    ///
    /// Normally this is just the operation tail after the cursor. When
    /// operations the device would need have been archived (folded into a
    /// snapshot), the plan bootstraps from the nearest snapshot and replays
    /// the tail accepted after it.
    pub fn catchup_plan(&self, cursor: OperationId) -> Result<CatchupPlan> {
        let oldest_retained = self.storage.oldest_operation_id(&self.account_id)?;
        let snapshot = self.storage.latest_snapshot(&self.account_id)?;

        let tail_is_complete = match oldest_retained {
            // empty tail: complete only if nothing was ever archived past the cursor
            None => snapshot
                .as_ref()
                .map_or(true, |snap| snap.last_operation_id <= cursor),
            Some(oldest) => cursor >= oldest - 1,
        };

        if !tail_is_complete {
            if let Some(snap) = snapshot {
                if snap.last_operation_id >= cursor {
                    let operations = self.operations_since(snap.last_operation_id)?;
                    return Ok(CatchupPlan {
                        snapshot: Some(snap),
                        operations,
                    });
                }
            }
            // No snapshot can bridge the archived range. Retention never
            // archives operations a known cursor still needs, so this is a
            // cursor from another lifetime; surface it as a gap so the
            // device performs a full resync.
            return Err(SyncError::SequenceGap {
                actor_id: String::new(),
                expected: oldest_retained.unwrap_or(0) as u64,
                got: cursor as u64,
            });
        }

        Ok(CatchupPlan {
            snapshot: None,
            operations: self.operations_since(cursor)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{EntityKind, FieldMutation, FieldName, FieldValue};
    use crate::storage::MemoryStore;

    fn log() -> OperationLog {
        OperationLog::new(Arc::new(MemoryStore::new()), "acct")
    }

    fn op(actor: &str, seq: u64) -> Operation {
        Operation::new(
            actor,
            seq,
            FieldMutation::SetField {
                entity_kind: EntityKind::Bookmark,
                entity_id: "b1".into(),
                field: FieldName::Title,
                value: FieldValue::Text(format!("{}:{}", actor, seq)),
                logical_ts: seq,
            },
            seq as i64,
        )
    }

    #[test]
    fn test_append_accepts_in_sequence() {
        let log = log();
        let a = log.append(&op("dev-a", 1)).unwrap();
        let b = log.append(&op("dev-a", 2)).unwrap();
        assert!(matches!(a, AppendOutcome::Accepted(_)));
        assert!(a.operation_id() < b.operation_id());
    }

    #[test]
    fn test_duplicate_hash_is_success() {
        let log = log();
        let first = log.append(&op("dev-a", 1)).unwrap();
        let again = log.append(&op("dev-a", 1)).unwrap();
        assert_eq!(again, AppendOutcome::Duplicate(first.operation_id()));
        assert_eq!(log.operations_since(0).unwrap().len(), 1);
    }

    #[test]
    fn test_sequence_gap_is_rejected() {
        let log = log();
        log.append(&op("dev-a", 1)).unwrap();
        let err = log.append(&op("dev-a", 3)).unwrap_err();
        match err {
            SyncError::SequenceGap {
                expected, got, ..
            } => {
                assert_eq!(expected, 2);
                assert_eq!(got, 3);
            }
            other => panic!("expected SequenceGap, got {:?}", other),
        }
        // the gap was not silently accepted
        assert_eq!(log.operations_since(0).unwrap().len(), 1);
    }

    #[test]
    fn test_sequence_reuse_with_new_content_is_rejected() {
        let log = log();
        log.append(&op("dev-a", 1)).unwrap();
        // same (actor, seq) but different payload, so a different hash
        let conflicting = Operation::new(
            "dev-a",
            1,
            FieldMutation::SetField {
                entity_kind: EntityKind::Bookmark,
                entity_id: "b1".into(),
                field: FieldName::Title,
                value: FieldValue::Text("other".into()),
                logical_ts: 99,
            },
            99,
        );
        assert!(matches!(
            log.append(&conflicting),
            Err(SyncError::SequenceGap { .. })
        ));
    }

    #[test]
    fn test_actors_sequence_independently() {
        let log = log();
        log.append(&op("dev-a", 1)).unwrap();
        log.append(&op("dev-b", 1)).unwrap();
        log.append(&op("dev-a", 2)).unwrap();
        assert_eq!(log.operations_since(0).unwrap().len(), 3);
    }

    #[test]
    fn test_malformed_operation_never_appended() {
        let log = log();
        let mut bad = op("dev-a", 1);
        bad.content_hash = "tampered".into();
        assert!(matches!(
            log.append(&bad),
            Err(SyncError::MalformedOperation(_))
        ));
        assert_eq!(log.latest_operation_id().unwrap(), 0);
    }

    #[test]
    fn test_operations_since_is_restartable() {
        let log = log();
        for seq in 1..=5 {
            log.append(&op("dev-a", seq)).unwrap();
        }
        let first_half = log.operations_since(0).unwrap();
        let resumed = log.operations_since(first_half[2].id).unwrap();
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[0].id, first_half[3].id);
    }

    #[test]
    fn test_catchup_plan_plain_tail() {
        let log = log();
        for seq in 1..=3 {
            log.append(&op("dev-a", seq)).unwrap();
        }
        let plan = log.catchup_plan(1).unwrap();
        assert!(plan.snapshot.is_none());
        assert_eq!(plan.estimated_count(), 2);
    }

    #[test]
    fn test_catchup_plan_bootstraps_from_snapshot_after_archive() {
        let log = log();
        for seq in 1..=4 {
            log.append(&op("dev-a", seq)).unwrap();
        }
        // ops 1..=3 folded into a snapshot and archived
        log.storage()
            .save_snapshot("acct", 3, b"{}", 1, 0)
            .unwrap();
        log.storage().archive_operations_up_to("acct", 3).unwrap();

        let plan = log.catchup_plan(0).unwrap();
        let snap = plan.snapshot.expect("fresh device needs the snapshot");
        assert_eq!(snap.last_operation_id, 3);
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.operations[0].id, 4);

        // a device already past the snapshot replays the tail only
        let plan = log.catchup_plan(3).unwrap();
        assert!(plan.snapshot.is_none());
        assert_eq!(plan.operations.len(), 1);
    }
}
