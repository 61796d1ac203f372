//! SQLite storage backend.
//!
//! Persists blocks, events and the cursor to a single SQLite file using
//! `sqlx`, with WAL mode for concurrent read throughput. This is the
//! reference adapter for the persistence port: one transaction covers
//! `(block upsert + events insert + cursor update)`, event inserts ignore
//! primary-key conflicts, and `delete_from` removes blocks and events
//! atomically.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, Sqlite, SqlitePool, TypeInfo};

use starkindex_core::{
    BlockHeader, BlockStatus, Cursor, Event, Storage, StorageError, StorageTxn,
};

/// SQLite-backed storage.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`. The path may be a plain
    /// file path (`"./index.db"`) or a full SQLite URL.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(classify)?;
        Ok(Self { pool })
    }

    /// Open an in-memory database. Single-connection so every handle sees
    /// the same data; ideal for tests.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(classify)?;
        Ok(Self { pool })
    }
}

/// Map sqlx failures onto the port's transient/fatal split.
fn classify(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => StorageError::Transient(e.to_string()),
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            if msg.contains("locked") || msg.contains("busy") {
                StorageError::Transient(e.to_string())
            } else {
                StorageError::Fatal(e.to_string())
            }
        }
        _ => StorageError::Fatal(e.to_string()),
    }
}

fn status_str(status: BlockStatus) -> &'static str {
    match status {
        BlockStatus::Accepted => "accepted",
        BlockStatus::Pending => "pending",
    }
}

fn status_from_str(s: &str) -> BlockStatus {
    match s {
        "pending" => BlockStatus::Pending,
        _ => BlockStatus::Accepted,
    }
}

fn header_from_row(row: &SqliteRow) -> Result<BlockHeader, StorageError> {
    Ok(BlockHeader {
        number: row.try_get::<i64, _>("block_number").map_err(classify)? as u64,
        hash: row.try_get("block_hash").map_err(classify)?,
        parent_hash: row.try_get("parent_hash").map_err(classify)?,
        timestamp: row.try_get::<i64, _>("timestamp").map_err(classify)? as u64,
        status: status_from_str(&row.try_get::<String, _>("status").map_err(classify)?),
    })
}

fn event_from_row(row: &SqliteRow) -> Result<Event, StorageError> {
    let keys: String = row.try_get("keys").map_err(classify)?;
    let data: String = row.try_get("data").map_err(classify)?;
    let decoded: Option<String> = row.try_get("decoded").map_err(classify)?;
    Ok(Event {
        block_hash: row.try_get("block_hash").map_err(classify)?,
        tx_hash: row.try_get("tx_hash").map_err(classify)?,
        event_index: row.try_get::<i64, _>("event_index").map_err(classify)? as u32,
        contract_address: row.try_get("contract_address").map_err(classify)?,
        keys: serde_json::from_str(&keys).map_err(|e| StorageError::Fatal(e.to_string()))?,
        data: serde_json::from_str(&data).map_err(|e| StorageError::Fatal(e.to_string()))?,
        decoded: decoded
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .map_err(|e| StorageError::Fatal(e.to_string()))?,
        block_number: row.try_get::<i64, _>("block_number").map_err(classify)? as u64,
    })
}

// ─── Transaction ──────────────────────────────────────────────────────────────

struct SqliteTxn {
    tx: sqlx::Transaction<'static, Sqlite>,
}

#[async_trait]
impl StorageTxn for SqliteTxn {
    async fn upsert_block(&mut self, block: &BlockHeader) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO blocks (block_number, block_hash, parent_hash, timestamp, status)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(block_number) DO UPDATE SET
                 block_hash = excluded.block_hash,
                 parent_hash = excluded.parent_hash,
                 timestamp = excluded.timestamp,
                 status = excluded.status",
        )
        .bind(block.number as i64)
        .bind(&block.hash)
        .bind(&block.parent_hash)
        .bind(block.timestamp as i64)
        .bind(status_str(block.status))
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn insert_events(&mut self, events: &[Event]) -> Result<(), StorageError> {
        for event in events {
            let keys =
                serde_json::to_string(&event.keys).map_err(|e| StorageError::Fatal(e.to_string()))?;
            let data =
                serde_json::to_string(&event.data).map_err(|e| StorageError::Fatal(e.to_string()))?;
            let decoded = event
                .decoded
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| StorageError::Fatal(e.to_string()))?;
            sqlx::query(
                "INSERT INTO events
                     (block_hash, tx_hash, event_index, contract_address,
                      keys, data, decoded, block_number)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(block_hash, tx_hash, event_index) DO NOTHING",
            )
            .bind(&event.block_hash)
            .bind(&event.tx_hash)
            .bind(event.event_index as i64)
            .bind(&event.contract_address)
            .bind(keys)
            .bind(data)
            .bind(decoded)
            .bind(event.block_number as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        }
        Ok(())
    }

    async fn delete_from(&mut self, block_number: u64) -> Result<u64, StorageError> {
        sqlx::query("DELETE FROM events WHERE block_number >= ?")
            .bind(block_number as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        let result = sqlx::query("DELETE FROM blocks WHERE block_number >= ?")
            .bind(block_number as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn set_cursor(&mut self, cursor: &Cursor) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO cursor (id, block_number, block_hash) VALUES (0, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 block_number = excluded.block_number,
                 block_hash = excluded.block_hash",
        )
        .bind(cursor.block_number as i64)
        .bind(&cursor.block_hash)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(classify)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await.map_err(classify)
    }
}

// ─── Storage impl ─────────────────────────────────────────────────────────────

#[async_trait]
impl Storage for SqliteStorage {
    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                block_number INTEGER PRIMARY KEY,
                block_hash   TEXT    NOT NULL,
                parent_hash  TEXT    NOT NULL,
                timestamp    INTEGER NOT NULL,
                status       TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                block_hash       TEXT    NOT NULL,
                tx_hash          TEXT    NOT NULL,
                event_index      INTEGER NOT NULL,
                contract_address TEXT    NOT NULL,
                keys             TEXT    NOT NULL,
                data             TEXT    NOT NULL,
                decoded          TEXT,
                block_number     INTEGER NOT NULL,
                PRIMARY KEY (block_hash, tx_hash, event_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_block_number
                 ON events (block_number);",
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cursor (
                id           INTEGER PRIMARY KEY CHECK (id = 0),
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        tracing::debug!("sqlite schema ready");
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StorageTxn>, StorageError> {
        let tx = self.pool.begin().await.map_err(classify)?;
        Ok(Box::new(SqliteTxn { tx }))
    }

    async fn cursor(&self) -> Result<Option<Cursor>, StorageError> {
        let row = sqlx::query("SELECT block_number, block_hash FROM cursor WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;
        row.map(|r| {
            Ok(Cursor {
                block_number: r.try_get::<i64, _>("block_number").map_err(classify)? as u64,
                block_hash: r.try_get("block_hash").map_err(classify)?,
            })
        })
        .transpose()
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockHeader>, StorageError> {
        let row = sqlx::query(
            "SELECT block_number, block_hash, parent_hash, timestamp, status
             FROM blocks WHERE block_number = ?",
        )
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        row.map(|r| header_from_row(&r)).transpose()
    }

    async fn recent_blocks(&self, limit: usize) -> Result<Vec<BlockHeader>, StorageError> {
        let rows = sqlx::query(
            "SELECT block_number, block_hash, parent_hash, timestamp, status
             FROM blocks ORDER BY block_number DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        let mut headers = rows
            .iter()
            .map(header_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        headers.reverse();
        Ok(headers)
    }

    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<Event>, StorageError> {
        let rows = sqlx::query(
            "SELECT block_hash, tx_hash, event_index, contract_address,
                    keys, data, decoded, block_number
             FROM events WHERE block_number BETWEEN ? AND ?
             ORDER BY block_number, event_index",
        )
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn event_count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(row.try_get::<i64, _>("cnt").map_err(classify)? as u64)
    }

    async fn block_count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(row.try_get::<i64, _>("cnt").map_err(classify)? as u64)
    }

    async fn query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Value>, StorageError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = match param {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(*b as i64),
                Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
                Value::Number(n) if n.is_u64() => query.bind(n.as_u64().map(|v| v as i64)),
                Value::Number(n) => query.bind(n.as_f64()),
                Value::String(s) => query.bind(s.clone()),
                other => query.bind(other.to_string()),
            };
        }
        let rows = query.fetch_all(&self.pool).await.map_err(classify)?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}

/// Render a row as a JSON object keyed by column name. Only SQLite's storage
/// classes need handling: INTEGER, REAL, TEXT, BLOB and NULL.
fn row_to_json(row: &SqliteRow) -> Value {
    let mut object = serde_json::Map::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value = match column.type_info().name() {
            "INTEGER" => row
                .try_get::<Option<i64>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            "REAL" => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            "BLOB" => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|bytes| Value::String(format!("0x{}", hex_encode(&bytes)))),
            _ => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(Value::String),
        };
        object.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    Value::Object(object)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(number: u64) -> BlockHeader {
        BlockHeader {
            number,
            hash: format!("0x{number:x}a"),
            parent_hash: format!("0x{:x}a", number - 1),
            timestamp: number,
            status: BlockStatus::Accepted,
        }
    }

    fn event(number: u64, index: u32) -> Event {
        let mut decoded = serde_json::Map::new();
        decoded.insert("amount".into(), Value::String("0x64".into()));
        Event {
            block_hash: format!("0x{number:x}a"),
            tx_hash: format!("0xt{number:x}"),
            event_index: index,
            contract_address: "0xaaa".into(),
            keys: vec!["0x99cd".into(), "0x1".into()],
            data: vec!["0x64".into(), "0x0".into()],
            decoded: Some(decoded),
            block_number: number,
        }
    }

    async fn store() -> SqliteStorage {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn block_event_cursor_roundtrip() {
        let store = store().await;
        let mut txn = store.begin().await.unwrap();
        txn.upsert_block(&header(100)).await.unwrap();
        txn.insert_events(&[event(100, 0), event(100, 1)]).await.unwrap();
        txn.set_cursor(&Cursor::new(100, "0x64a")).await.unwrap();
        txn.commit().await.unwrap();

        let cursor = store.cursor().await.unwrap().unwrap();
        assert_eq!(cursor.block_number, 100);
        assert_eq!(cursor.block_hash, "0x64a");

        let block = store.block_by_number(100).await.unwrap().unwrap();
        assert_eq!(block.hash, "0x64a");
        assert_eq!(block.status, BlockStatus::Accepted);

        let events = store.events_in_range(100, 100).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].keys, vec!["0x99cd", "0x1"]);
        assert_eq!(
            events[0].decoded.as_ref().unwrap()["amount"],
            Value::String("0x64".into())
        );
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = store().await;
        let mut txn = store.begin().await.unwrap();
        txn.upsert_block(&header(100)).await.unwrap();
        txn.rollback().await.unwrap();
        assert_eq!(store.block_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn event_conflicts_ignored_on_reprocess() {
        let store = store().await;
        let mut txn = store.begin().await.unwrap();
        txn.upsert_block(&header(100)).await.unwrap();
        txn.insert_events(&[event(100, 0)]).await.unwrap();
        txn.commit().await.unwrap();

        // Same block processed again after a crash before cursor update.
        let mut txn = store.begin().await.unwrap();
        txn.upsert_block(&header(100)).await.unwrap();
        txn.insert_events(&[event(100, 0), event(100, 1)]).await.unwrap();
        txn.set_cursor(&Cursor::new(100, "0x64a")).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(store.event_count().await.unwrap(), 2);
        assert_eq!(store.block_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_from_is_atomic_and_idempotent() {
        let store = store().await;
        for n in 100..=105 {
            let mut txn = store.begin().await.unwrap();
            txn.upsert_block(&header(n)).await.unwrap();
            txn.insert_events(&[event(n, 0)]).await.unwrap();
            txn.commit().await.unwrap();
        }

        let mut txn = store.begin().await.unwrap();
        assert_eq!(txn.delete_from(103).await.unwrap(), 3);
        txn.set_cursor(&Cursor::new(102, "0x66a")).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(store.block_count().await.unwrap(), 3);
        assert_eq!(store.event_count().await.unwrap(), 3);

        let mut txn = store.begin().await.unwrap();
        assert_eq!(txn.delete_from(103).await.unwrap(), 0);
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn recent_blocks_window() {
        let store = store().await;
        for n in 100..=110 {
            let mut txn = store.begin().await.unwrap();
            txn.upsert_block(&header(n)).await.unwrap();
            txn.commit().await.unwrap();
        }
        let recent = store.recent_blocks(4).await.unwrap();
        let numbers: Vec<_> = recent.iter().map(|h| h.number).collect();
        assert_eq!(numbers, vec![107, 108, 109, 110]);
    }

    #[tokio::test]
    async fn raw_query_returns_json_rows() {
        let store = store().await;
        let mut txn = store.begin().await.unwrap();
        txn.upsert_block(&header(100)).await.unwrap();
        txn.commit().await.unwrap();

        let rows = store
            .query(
                "SELECT block_number, block_hash FROM blocks WHERE block_number = ?",
                &[Value::from(100)],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["block_number"], Value::from(100));
        assert_eq!(rows[0]["block_hash"], Value::String("0x64a".into()));
    }
}
