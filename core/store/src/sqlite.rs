//! SQLite-backed store for records and pending operations.
//!
//! Each commit runs as a single SQLite transaction, so a record write and the
//! queue entry that accompanies it land together or not at all.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use shelfsync_common::{Error, OperationId, RecordId, Result};

use crate::backend::StoreBackend;
use crate::queue::{OperationKind, PendingOperation};
use crate::record::{Record, SyncState};
use crate::snapshot::{Snapshot, WriteBatch};

const NEXT_SEQUENCE_KEY: &str = "next_sequence";

/// SQLite store backend.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema initialization failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                fields TEXT NOT NULL,
                sync_state TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_operations (
                op_id TEXT PRIMARY KEY,
                record_id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                revision INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT
            );

            CREATE TABLE IF NOT EXISTS id_aliases (
                temp_id TEXT PRIMARY KEY,
                permanent_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pending_sequence ON pending_operations(sequence);
            "#,
        )
        .map_err(db_err)?;

        info!("Local store database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))
    }
}

impl StoreBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn load(&self) -> Result<Snapshot> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare("SELECT id, fields, sync_state FROM records")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, fields, sync_state) = row.map_err(db_err)?;
            records.push(Record {
                id: decode_id(&id)?,
                fields: serde_json::from_str(&fields)?,
                sync_state: serde_json::from_str::<SyncState>(&sync_state)?,
            });
        }

        let mut stmt = conn
            .prepare(
                r#"
                SELECT op_id, record_id, payload, created_at, sequence, revision, attempts, last_error
                FROM pending_operations ORDER BY sequence
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(OperationRow {
                    op_id: row.get(0)?,
                    record_id: row.get(1)?,
                    payload: row.get(2)?,
                    created_at: row.get(3)?,
                    sequence: row.get(4)?,
                    revision: row.get(5)?,
                    attempts: row.get(6)?,
                    last_error: row.get(7)?,
                })
            })
            .map_err(db_err)?;

        let mut operations = Vec::new();
        for row in rows {
            operations.push(row.map_err(db_err)?.into_operation()?);
        }

        let mut stmt = conn
            .prepare("SELECT temp_id, permanent_id FROM id_aliases")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err)?;

        let mut aliases = Vec::new();
        for row in rows {
            let (temp, permanent) = row.map_err(db_err)?;
            aliases.push((decode_id(&temp)?, decode_id(&permanent)?));
        }

        let next_sequence: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                [NEXT_SEQUENCE_KEY],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let next_sequence = next_sequence
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| Error::Storage(format!("Invalid sequence counter: {}", e)))?
            .unwrap_or(0);

        debug!(
            "Loaded {} records and {} pending operations",
            records.len(),
            operations.len()
        );
        Ok(Snapshot::from_parts(records, operations, aliases, next_sequence))
    }

    fn commit(&self, batch: &WriteBatch, _state: &Snapshot) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        for (id, record) in &batch.records {
            let key = encode_id(id)?;
            match record {
                Some(record) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO records (id, fields, sync_state) VALUES (?1, ?2, ?3)",
                        params![
                            key,
                            serde_json::to_string(&record.fields)?,
                            serde_json::to_string(&record.sync_state)?,
                        ],
                    )
                    .map_err(db_err)?;
                }
                None => {
                    tx.execute("DELETE FROM records WHERE id = ?1", [key])
                        .map_err(db_err)?;
                }
            }
        }

        // Deletions first: a re-keyed or replaced operation may reuse a record id.
        for (op_id, op) in &batch.operations {
            if op.is_none() {
                tx.execute(
                    "DELETE FROM pending_operations WHERE op_id = ?1",
                    [op_id.to_string()],
                )
                .map_err(db_err)?;
            }
        }
        for op in batch.operations.values().flatten() {
            tx.execute(
                r#"
                INSERT OR REPLACE INTO pending_operations
                (op_id, record_id, kind, payload, created_at, sequence, revision, attempts, last_error)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    op.id.to_string(),
                    encode_id(&op.record_id)?,
                    op.kind.label(),
                    serde_json::to_string(&op.kind)?,
                    op.created_at.to_rfc3339(),
                    op.sequence as i64,
                    op.revision,
                    op.attempts,
                    op.last_error,
                ],
            )
            .map_err(db_err)?;
        }

        for (temp, permanent) in &batch.aliases {
            match permanent {
                Some(permanent) => tx.execute(
                    "INSERT OR REPLACE INTO id_aliases (temp_id, permanent_id) VALUES (?1, ?2)",
                    params![encode_id(temp)?, encode_id(permanent)?],
                ),
                None => tx.execute(
                    "DELETE FROM id_aliases WHERE temp_id = ?1",
                    params![encode_id(temp)?],
                ),
            }
            .map_err(db_err)?;
        }

        if let Some(next_sequence) = batch.next_sequence {
            tx.execute(
                "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
                params![NEXT_SEQUENCE_KEY, next_sequence.to_string()],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)
    }
}

/// Raw row of the pending_operations table.
struct OperationRow {
    op_id: String,
    record_id: String,
    payload: String,
    created_at: String,
    sequence: i64,
    revision: u32,
    attempts: u32,
    last_error: Option<String>,
}

impl OperationRow {
    fn into_operation(self) -> Result<PendingOperation> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| Error::Storage(format!("Invalid timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(PendingOperation {
            id: self.op_id.parse::<OperationId>()?,
            record_id: decode_id(&self.record_id)?,
            kind: serde_json::from_str::<OperationKind>(&self.payload)?,
            created_at,
            sequence: self.sequence as u64,
            revision: self.revision,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

/// Record ids are stored as their tagged JSON form, so the namespace survives.
fn encode_id(id: &RecordId) -> Result<String> {
    Ok(serde_json::to_string(id)?)
}

fn decode_id(raw: &str) -> Result<RecordId> {
    Ok(serde_json::from_str(raw)?)
}

fn db_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}
