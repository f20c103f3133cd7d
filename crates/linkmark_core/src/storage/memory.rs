//! In-memory storage implementation for testing.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{SnapshotRecord, StorageResult, StoredOperation, SyncCursor, SyncStorage};
use crate::op::{Operation, OperationId};

#[derive(Debug, Default)]
struct AccountState {
    operations: Vec<StoredOperation>,
    next_operation_id: OperationId,
    snapshots: Vec<SnapshotRecord>,
    next_snapshot_id: i64,
    cursors: HashMap<String, SyncCursor>,
}

/// In-memory sync storage for unit tests and development.
///
/// Thread-safe via `RwLock`; all data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<String, AccountState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_account<T>(
        &self,
        account_id: &str,
        f: impl FnOnce(&mut AccountState) -> T,
    ) -> T {
        let mut accounts = self.accounts.write().unwrap();
        let state = accounts.entry(account_id.to_string()).or_default();
        f(state)
    }

    fn read_account<T>(
        &self,
        account_id: &str,
        f: impl FnOnce(Option<&AccountState>) -> T,
    ) -> T {
        let accounts = self.accounts.read().unwrap();
        f(accounts.get(account_id))
    }
}

impl SyncStorage for MemoryStore {
    fn operation_id_for_hash(
        &self,
        account_id: &str,
        content_hash: &str,
    ) -> StorageResult<Option<OperationId>> {
        Ok(self.read_account(account_id, |state| {
            state.and_then(|s| {
                s.operations
                    .iter()
                    .find(|op| op.operation.content_hash == content_hash)
                    .map(|op| op.id)
            })
        }))
    }

    fn last_sequence(&self, account_id: &str, actor_id: &str) -> StorageResult<Option<u64>> {
        Ok(self.read_account(account_id, |state| {
            state.and_then(|s| {
                s.operations
                    .iter()
                    .filter(|op| op.operation.actor_id == actor_id)
                    .map(|op| op.operation.sequence_number)
                    .max()
            })
        }))
    }

    fn insert_operation(&self, account_id: &str, op: &Operation) -> StorageResult<StoredOperation> {
        Ok(self.with_account(account_id, |state| {
            state.next_operation_id += 1;
            let stored = StoredOperation {
                id: state.next_operation_id,
                account_id: account_id.to_string(),
                operation: op.clone(),
                accepted_at: chrono::Utc::now().timestamp_millis(),
            };
            state.operations.push(stored.clone());
            stored
        }))
    }

    fn operations_since(
        &self,
        account_id: &str,
        after: OperationId,
    ) -> StorageResult<Vec<StoredOperation>> {
        Ok(self.read_account(account_id, |state| {
            state
                .map(|s| {
                    s.operations
                        .iter()
                        .filter(|op| op.id > after)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    fn oldest_operation_id(&self, account_id: &str) -> StorageResult<Option<OperationId>> {
        Ok(self.read_account(account_id, |state| {
            state.and_then(|s| s.operations.first().map(|op| op.id))
        }))
    }

    fn latest_operation_id(&self, account_id: &str) -> StorageResult<OperationId> {
        Ok(self.read_account(account_id, |state| {
            state.map(|s| s.next_operation_id).unwrap_or(0)
        }))
    }

    fn operation_count_since(&self, account_id: &str, after: OperationId) -> StorageResult<u64> {
        Ok(self.read_account(account_id, |state| {
            state
                .map(|s| s.operations.iter().filter(|op| op.id > after).count() as u64)
                .unwrap_or(0)
        }))
    }

    fn archive_operations_up_to(
        &self,
        account_id: &str,
        up_to: OperationId,
    ) -> StorageResult<u64> {
        Ok(self.with_account(account_id, |state| {
            let before = state.operations.len();
            state.operations.retain(|op| op.id > up_to);
            (before - state.operations.len()) as u64
        }))
    }

    fn save_snapshot(
        &self,
        account_id: &str,
        last_operation_id: OperationId,
        data: &[u8],
        entity_count: u64,
        created_at: i64,
    ) -> StorageResult<i64> {
        Ok(self.with_account(account_id, |state| {
            state.next_snapshot_id += 1;
            state.snapshots.push(SnapshotRecord {
                id: state.next_snapshot_id,
                account_id: account_id.to_string(),
                last_operation_id,
                data: data.to_vec(),
                entity_count,
                size_bytes: data.len() as u64,
                created_at,
            });
            state.next_snapshot_id
        }))
    }

    fn latest_snapshot(&self, account_id: &str) -> StorageResult<Option<SnapshotRecord>> {
        Ok(self.read_account(account_id, |state| {
            state.and_then(|s| {
                s.snapshots
                    .iter()
                    .max_by_key(|snap| (snap.last_operation_id, snap.id))
                    .cloned()
            })
        }))
    }

    fn snapshots(&self, account_id: &str) -> StorageResult<Vec<SnapshotRecord>> {
        Ok(self.read_account(account_id, |state| {
            state
                .map(|s| {
                    let mut snaps = s.snapshots.clone();
                    snaps.sort_by_key(|snap| std::cmp::Reverse((snap.last_operation_id, snap.id)));
                    snaps
                })
                .unwrap_or_default()
        }))
    }

    fn delete_snapshot(&self, account_id: &str, snapshot_id: i64) -> StorageResult<()> {
        self.with_account(account_id, |state| {
            state.snapshots.retain(|snap| snap.id != snapshot_id);
        });
        Ok(())
    }

    fn load_cursor(&self, account_id: &str, device_id: &str) -> StorageResult<Option<SyncCursor>> {
        Ok(self.read_account(account_id, |state| {
            state.and_then(|s| s.cursors.get(device_id).cloned())
        }))
    }

    fn save_cursor(
        &self,
        account_id: &str,
        device_id: &str,
        last_operation_id: OperationId,
    ) -> StorageResult<()> {
        self.with_account(account_id, |state| {
            let now = chrono::Utc::now().timestamp_millis();
            let cursor = state
                .cursors
                .entry(device_id.to_string())
                .or_insert_with(|| SyncCursor {
                    account_id: account_id.to_string(),
                    device_id: device_id.to_string(),
                    last_operation_id: 0,
                    updated_at: now,
                });
            if last_operation_id >= cursor.last_operation_id {
                cursor.last_operation_id = last_operation_id;
                cursor.updated_at = now;
            }
        });
        Ok(())
    }

    fn cursors(&self, account_id: &str) -> StorageResult<Vec<SyncCursor>> {
        Ok(self.read_account(account_id, |state| {
            state
                .map(|s| {
                    let mut cursors: Vec<_> = s.cursors.values().cloned().collect();
                    cursors.sort_by(|a, b| a.device_id.cmp(&b.device_id));
                    cursors
                })
                .unwrap_or_default()
        }))
    }

    fn account_ids(&self) -> StorageResult<Vec<String>> {
        let accounts = self.accounts.read().unwrap();
        let mut ids: Vec<_> = accounts
            .iter()
            .filter(|(_, s)| !s.operations.is_empty() || !s.snapshots.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
