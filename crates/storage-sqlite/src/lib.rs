//! Durable sqlite-backed stores for the engine-owned synchronization
//! state: the operations queue and the synchronization-set metadata
//! (delta tokens). Both tables live alongside the application's data;
//! the application must never write them.

use std::path::Path;
use std::sync::Mutex;

use log::debug;
use rusqlite::{params, Connection, OptionalExtension};

use tablesync_core::entity::{epoch, format_timestamp, parse_timestamp};
use tablesync_core::{
    DeltaTokenStore, Error, OperationsQueueStore, QueuedOperation, Result,
};

fn enum_to_db<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{value}\""))?)
}

const OPERATION_COLUMNS: &str = "id, table_name, item_id, kind, state, entity_version, item, \
                                 sequence, version, last_attempt, http_status_code";

/// Row image of a queued operation before enum/JSON decoding.
struct RawOperation {
    id: String,
    table_name: String,
    item_id: String,
    kind: String,
    state: String,
    entity_version: Option<String>,
    item: Option<String>,
    sequence: i64,
    version: i64,
    last_attempt: Option<String>,
    http_status_code: Option<i64>,
}

impl RawOperation {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            table_name: row.get(1)?,
            item_id: row.get(2)?,
            kind: row.get(3)?,
            state: row.get(4)?,
            entity_version: row.get(5)?,
            item: row.get(6)?,
            sequence: row.get(7)?,
            version: row.get(8)?,
            last_attempt: row.get(9)?,
            http_status_code: row.get(10)?,
        })
    }

    fn decode(self) -> Result<QueuedOperation> {
        Ok(QueuedOperation {
            id: self.id,
            table_name: self.table_name,
            item_id: self.item_id,
            kind: enum_from_db(&self.kind)?,
            state: enum_from_db(&self.state)?,
            entity_version: self.entity_version,
            item: self
                .item
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            sequence: self.sequence,
            version: self.version,
            last_attempt: self
                .last_attempt
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            http_status_code: self.http_status_code.map(|code| code as u16),
        })
    }
}

/// Sqlite-backed [`OperationsQueueStore`] + [`DeltaTokenStore`].
pub struct SqliteSyncStore {
    conn: Mutex<Connection>,
}

impl SqliteSyncStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(Error::storage)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store. The contents die with the handle.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::storage)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("sqlite connection mutex poisoned".into()))
    }
}

/// Create the engine-owned tables. Safe to call repeatedly.
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS sync_operations (
    id TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    item_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('add','replace','delete')),
    state TEXT NOT NULL CHECK(state IN ('pending','attempted','failed','completed')),
    entity_version TEXT,
    item TEXT,
    sequence INTEGER NOT NULL,
    version INTEGER NOT NULL,
    last_attempt TEXT,
    http_status_code INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sync_operations_entity
ON sync_operations(table_name, item_id);

CREATE INDEX IF NOT EXISTS idx_sync_operations_state
ON sync_operations(state, sequence);

CREATE TABLE IF NOT EXISTS sync_set_metadata (
    query_id TEXT PRIMARY KEY,
    delta_token TEXT NOT NULL
);
"#,
    )
    .map_err(Error::storage)?;
    debug!("sqlite sync schema ready");
    Ok(())
}

impl OperationsQueueStore for SqliteSyncStore {
    fn find(&self, table: &str, item_id: &str) -> Result<Option<QueuedOperation>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {OPERATION_COLUMNS} FROM sync_operations \
                     WHERE table_name = ?1 AND item_id = ?2 AND state != 'completed'"
                ),
                params![table, item_id],
                RawOperation::from_row,
            )
            .optional()
            .map_err(Error::storage)?;
        raw.map(RawOperation::decode).transpose()
    }

    fn upsert(&self, operation: &QueuedOperation) -> Result<()> {
        let item = operation
            .item
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let last_attempt = operation.last_attempt.as_ref().map(format_timestamp);
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO sync_operations \
             (id, table_name, item_id, kind, state, entity_version, item, \
              sequence, version, last_attempt, http_status_code) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                operation.id,
                operation.table_name,
                operation.item_id,
                enum_to_db(&operation.kind)?,
                enum_to_db(&operation.state)?,
                operation.entity_version,
                item,
                operation.sequence,
                operation.version,
                last_attempt,
                operation.http_status_code.map(i64::from),
            ],
        )
        .map_err(Error::storage)?;
        Ok(())
    }

    fn remove(&self, operation_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM sync_operations WHERE id = ?1",
            params![operation_id],
        )
        .map_err(Error::storage)?;
        Ok(())
    }

    fn list(&self, tables: &[String]) -> Result<Vec<QueuedOperation>> {
        let conn = self.lock()?;
        let mut statement = conn
            .prepare(&format!(
                "SELECT {OPERATION_COLUMNS} FROM sync_operations \
                 WHERE state != 'completed' ORDER BY sequence"
            ))
            .map_err(Error::storage)?;
        let rows = statement
            .query_map([], RawOperation::from_row)
            .map_err(Error::storage)?;

        let mut operations = Vec::new();
        for raw in rows {
            let operation = raw.map_err(Error::storage)?.decode()?;
            if tables.is_empty() || tables.contains(&operation.table_name) {
                operations.push(operation);
            }
        }
        Ok(operations)
    }

    fn max_sequence(&self) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM sync_operations",
            [],
            |row| row.get(0),
        )
        .map_err(Error::storage)
    }
}

impl DeltaTokenStore for SqliteSyncStore {
    fn get(&self, query_id: &str) -> Result<chrono::DateTime<chrono::FixedOffset>> {
        let conn = self.lock()?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT delta_token FROM sync_set_metadata WHERE query_id = ?1",
                params![query_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::storage)?;
        match stored {
            Some(raw) => parse_timestamp(&raw),
            None => Ok(epoch()),
        }
    }

    fn set(&self, query_id: &str, value: chrono::DateTime<chrono::FixedOffset>) -> Result<bool> {
        // Read-then-write set-max; the engine serializes delta writes
        // through its database-update worker.
        let current = self.get(query_id)?;
        if value <= current {
            return Ok(false);
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_set_metadata (query_id, delta_token) VALUES (?1, ?2) \
             ON CONFLICT(query_id) DO UPDATE SET delta_token = excluded.delta_token",
            params![query_id, format_timestamp(&value)],
        )
        .map_err(Error::storage)?;
        Ok(true)
    }

    fn reset(&self, query_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM sync_set_metadata WHERE query_id = ?1",
            params![query_id],
        )
        .map_err(Error::storage)?;
        Ok(())
    }
}
