//! The persistence port — the abstract contract any relational store must
//! satisfy to back the indexer.
//!
//! Concrete adapters live in `starkindex-storage` (in-memory, SQLite). A
//! conforming adapter must honor:
//! - atomicity of `(block upsert + events insert + cursor update)` within one
//!   [`StorageTxn`];
//! - `delete_from(n)` atomic and idempotent;
//! - unique `(block_number)` on blocks and a composite primary key
//!   `(block_hash, tx_hash, event_index)` on events, with inserts tolerating
//!   re-processing after a crash (conflict → no-op).

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{BlockHeader, Cursor, Event};

/// Storage failures, split by whether the caller may retry.
///
/// The port itself never retries; retry policy is owned by the orchestrator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Retryable: connection loss, pool exhaustion, lock contention.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Not retryable: constraint breakage, corrupted schema, closed pool.
    /// The caller must abort and preserve the cursor.
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A scoped write transaction over blocks, events and the cursor.
///
/// All writes staged on the transaction become visible atomically on
/// [`commit`](StorageTxn::commit); dropping without commit discards them.
#[async_trait]
pub trait StorageTxn: Send {
    /// Insert or replace the block header row.
    async fn upsert_block(&mut self, block: &BlockHeader) -> Result<(), StorageError>;

    /// Insert event rows. Rows whose `(block_hash, tx_hash, event_index)`
    /// already exist are skipped, so re-processing a block after a crash is
    /// safe.
    async fn insert_events(&mut self, events: &[Event]) -> Result<(), StorageError>;

    /// Delete all blocks and events with `block_number >= block_number`.
    /// Returns the number of block rows removed. Idempotent.
    async fn delete_from(&mut self, block_number: u64) -> Result<u64, StorageError>;

    /// Update the singleton cursor row. Committed together with the block
    /// that produced it — the cursor is derived state, never independent.
    async fn set_cursor(&mut self, cursor: &Cursor) -> Result<(), StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// The persistence port.
///
/// Read methods run outside any indexer transaction and are safe to call
/// from user handlers; `begin()` opens a fresh transaction the caller owns.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create or migrate the schema. Called once from `start()`.
    async fn migrate(&self) -> Result<(), StorageError>;

    /// Open a write transaction with serializable-or-stricter semantics over
    /// the block/event row ranges.
    async fn begin(&self) -> Result<Box<dyn StorageTxn>, StorageError>;

    /// Read the committed cursor, if any.
    async fn cursor(&self) -> Result<Option<Cursor>, StorageError>;

    /// Look up a committed block header by number.
    async fn block_by_number(&self, number: u64) -> Result<Option<BlockHeader>, StorageError>;

    /// The most recent `limit` committed block headers, ascending by number.
    /// Used to rebuild the canonical tail on restart.
    async fn recent_blocks(&self, limit: usize) -> Result<Vec<BlockHeader>, StorageError>;

    /// Committed events with `from <= block_number <= to`, ordered by
    /// `(block_number, event_index)`.
    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<Event>, StorageError>;

    /// Total number of committed event rows.
    async fn event_count(&self) -> Result<u64, StorageError>;

    /// Total number of committed block rows.
    async fn block_count(&self) -> Result<u64, StorageError>;

    /// Escape hatch for user handlers: run raw SQL against the adapter on a
    /// connection separate from the indexer's own commits. Rows come back as
    /// JSON objects keyed by column name. Adapters without a SQL surface
    /// return [`StorageError::Fatal`].
    async fn query(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, StorageError>;
}
