//! SQLite-backed storage implementation.
//!
//! Persists the three record kinds (operations, snapshots, sync cursors)
//! in a single database; every table carries the account id, so one server
//! process serves many accounts from one file.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::{SnapshotRecord, StorageResult, StoredOperation, SyncCursor, SyncStorage};
use crate::error::SyncError;
use crate::op::{FieldMutation, Operation, OperationId};

/// SQLite-backed sync storage.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    ///
    /// Creates the necessary tables if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database for testing.
    ///
    /// Data is lost when the store is dropped.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Append-only operation ledger. AUTOINCREMENT keeps acceptance
            -- ids monotonic even after old rows are archived.
            CREATE TABLE IF NOT EXISTS operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                accepted_at INTEGER NOT NULL
            );

            -- Idempotent replay: one hash, one row
            CREATE UNIQUE INDEX IF NOT EXISTS idx_operations_hash
                ON operations(account_id, content_hash);

            -- (actor, sequence) uniqueness within an account
            CREATE UNIQUE INDEX IF NOT EXISTS idx_operations_actor_seq
                ON operations(account_id, actor_id, sequence_number);

            -- Catch-up queries scan (account, id) ranges
            CREATE INDEX IF NOT EXISTS idx_operations_account
                ON operations(account_id, id);

            -- Materialized document snapshots
            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                snapshot_data BLOB NOT NULL,
                last_operation_id INTEGER NOT NULL,
                entity_count INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_snapshots_account
                ON snapshots(account_id, last_operation_id);

            -- Per-(account, device) sync cursors
            CREATE TABLE IF NOT EXISTS sync_state (
                account_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                last_operation_id INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, device_id)
            );
            "#,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

/// Raw columns of one operations row, before payload decoding.
type RawOperationRow = (OperationId, String, u64, String, Vec<u8>, i64, i64);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawOperationRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get::<_, i64>(2)? as u64,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_stored(
    account_id: &str,
    (id, actor_id, sequence_number, content_hash, payload, created_at, accepted_at): RawOperationRow,
) -> StorageResult<StoredOperation> {
    let payload: FieldMutation = serde_json::from_slice(&payload)?;
    Ok(StoredOperation {
        id,
        account_id: account_id.to_string(),
        operation: Operation {
            actor_id,
            sequence_number,
            content_hash,
            payload,
            created_at,
        },
        accepted_at,
    })
}

impl SyncStorage for SqliteStore {
    fn operation_id_for_hash(
        &self,
        account_id: &str,
        content_hash: &str,
    ) -> StorageResult<Option<OperationId>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id FROM operations WHERE account_id = ? AND content_hash = ?",
            params![account_id, content_hash],
            |row| row.get(0),
        )
        .optional()
        .map_err(SyncError::from)
    }

    fn last_sequence(&self, account_id: &str, actor_id: &str) -> StorageResult<Option<u64>> {
        let conn = self.conn.lock().unwrap();
        let result: Option<i64> = conn
            .query_row(
                "SELECT MAX(sequence_number) FROM operations
                 WHERE account_id = ? AND actor_id = ?",
                params![account_id, actor_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(result.map(|seq| seq as u64))
    }

    fn insert_operation(&self, account_id: &str, op: &Operation) -> StorageResult<StoredOperation> {
        let conn = self.conn.lock().unwrap();
        let accepted_at = chrono::Utc::now().timestamp_millis();
        let payload = serde_json::to_vec(&op.payload)?;

        conn.execute(
            "INSERT INTO operations
                 (account_id, actor_id, sequence_number, content_hash, payload, created_at, accepted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                account_id,
                op.actor_id,
                op.sequence_number as i64,
                op.content_hash,
                payload,
                op.created_at,
                accepted_at
            ],
        )?;

        Ok(StoredOperation {
            id: conn.last_insert_rowid(),
            account_id: account_id.to_string(),
            operation: op.clone(),
            accepted_at,
        })
    }

    fn operations_since(
        &self,
        account_id: &str,
        after: OperationId,
    ) -> StorageResult<Vec<StoredOperation>> {
        let raw = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, actor_id, sequence_number, content_hash, payload, created_at, accepted_at
                 FROM operations
                 WHERE account_id = ? AND id > ?
                 ORDER BY id ASC",
            )?;
            let rows: Vec<_> = stmt
                .query_map(params![account_id, after], row_to_raw)?
                .collect::<rusqlite::Result<_>>()?;
            rows
        };

        raw.into_iter()
            .map(|tuple| decode_stored(account_id, tuple))
            .collect()
    }

    fn oldest_operation_id(&self, account_id: &str) -> StorageResult<Option<OperationId>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT MIN(id) FROM operations WHERE account_id = ?",
            params![account_id],
            |row| row.get(0),
        )
        .map_err(SyncError::from)
    }

    fn latest_operation_id(&self, account_id: &str) -> StorageResult<OperationId> {
        let conn = self.conn.lock().unwrap();
        let result: Option<i64> = conn.query_row(
            "SELECT MAX(id) FROM operations WHERE account_id = ?",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(result.unwrap_or(0))
    }

    fn operation_count_since(&self, account_id: &str, after: OperationId) -> StorageResult<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operations WHERE account_id = ? AND id > ?",
            params![account_id, after],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn archive_operations_up_to(
        &self,
        account_id: &str,
        up_to: OperationId,
    ) -> StorageResult<u64> {
        let conn = self.conn.lock().unwrap();
        let archived = conn.execute(
            "DELETE FROM operations WHERE account_id = ? AND id <= ?",
            params![account_id, up_to],
        )?;
        Ok(archived as u64)
    }

    fn save_snapshot(
        &self,
        account_id: &str,
        last_operation_id: OperationId,
        data: &[u8],
        entity_count: u64,
        created_at: i64,
    ) -> StorageResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO snapshots
                 (account_id, snapshot_data, last_operation_id, entity_count, size_bytes, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                account_id,
                data,
                last_operation_id,
                entity_count as i64,
                data.len() as i64,
                created_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn latest_snapshot(&self, account_id: &str) -> StorageResult<Option<SnapshotRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, snapshot_data, last_operation_id, entity_count, size_bytes, created_at
             FROM snapshots WHERE account_id = ?
             ORDER BY last_operation_id DESC, id DESC LIMIT 1",
            params![account_id],
            |row| {
                Ok(SnapshotRecord {
                    id: row.get(0)?,
                    account_id: account_id.to_string(),
                    data: row.get(1)?,
                    last_operation_id: row.get(2)?,
                    entity_count: row.get::<_, i64>(3)? as u64,
                    size_bytes: row.get::<_, i64>(4)? as u64,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(SyncError::from)
    }

    fn snapshots(&self, account_id: &str) -> StorageResult<Vec<SnapshotRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, snapshot_data, last_operation_id, entity_count, size_bytes, created_at
             FROM snapshots WHERE account_id = ?
             ORDER BY last_operation_id DESC, id DESC",
        )?;
        let snapshots = stmt
            .query_map(params![account_id], |row| {
                Ok(SnapshotRecord {
                    id: row.get(0)?,
                    account_id: account_id.to_string(),
                    data: row.get(1)?,
                    last_operation_id: row.get(2)?,
                    entity_count: row.get::<_, i64>(3)? as u64,
                    size_bytes: row.get::<_, i64>(4)? as u64,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(snapshots)
    }

    fn delete_snapshot(&self, account_id: &str, snapshot_id: i64) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM snapshots WHERE account_id = ? AND id = ?",
            params![account_id, snapshot_id],
        )?;
        Ok(())
    }

    fn load_cursor(&self, account_id: &str, device_id: &str) -> StorageResult<Option<SyncCursor>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT last_operation_id, updated_at FROM sync_state
             WHERE account_id = ? AND device_id = ?",
            params![account_id, device_id],
            |row| {
                Ok(SyncCursor {
                    account_id: account_id.to_string(),
                    device_id: device_id.to_string(),
                    last_operation_id: row.get(0)?,
                    updated_at: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(SyncError::from)
    }

    fn save_cursor(
        &self,
        account_id: &str,
        device_id: &str,
        last_operation_id: OperationId,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO sync_state (account_id, device_id, last_operation_id, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account_id, device_id) DO UPDATE SET
                 last_operation_id = excluded.last_operation_id,
                 updated_at = excluded.updated_at
             WHERE excluded.last_operation_id >= sync_state.last_operation_id",
            params![account_id, device_id, last_operation_id, now],
        )?;
        Ok(())
    }

    fn cursors(&self, account_id: &str) -> StorageResult<Vec<SyncCursor>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT device_id, last_operation_id, updated_at FROM sync_state
             WHERE account_id = ? ORDER BY device_id",
        )?;
        let cursors = stmt
            .query_map(params![account_id], |row| {
                Ok(SyncCursor {
                    account_id: account_id.to_string(),
                    device_id: row.get(0)?,
                    last_operation_id: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(cursors)
    }

    fn account_ids(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT account_id FROM operations
             UNION SELECT DISTINCT account_id FROM snapshots
             ORDER BY account_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }
}
