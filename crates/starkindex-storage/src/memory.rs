//! In-memory storage backend.
//!
//! Mirrors the transactional semantics of the SQLite adapter — staged writes
//! become visible atomically on commit, event inserts ignore primary-key
//! conflicts — so the pipeline behaves identically under test. All data is
//! lost when the last handle is dropped.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use starkindex_core::{BlockHeader, Cursor, Event, Storage, StorageError, StorageTxn};

#[derive(Default)]
struct MemInner {
    blocks: BTreeMap<u64, BlockHeader>,
    events: Vec<Event>,
    event_keys: HashSet<(String, String, u32)>,
    cursor: Option<Cursor>,
}

/// In-memory indexer storage. Clones share the same underlying state.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemInner>>,
    /// When non-zero, the next commits fail with a transient error. Used to
    /// exercise the orchestrator's retry path in tests.
    fail_commits: Arc<AtomicU32>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with `StorageError::Transient`.
    pub fn fail_next_commits(&self, count: u32) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        // A poisoned lock means a panic mid-update in this process; treating
        // the data as gone matches what a crashed embedded DB would do.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct Staged {
    blocks: Vec<BlockHeader>,
    events: Vec<Event>,
    delete_from: Option<u64>,
    cursor: Option<Cursor>,
}

struct MemoryTxn {
    storage: MemoryStorage,
    staged: Staged,
}

#[async_trait]
impl StorageTxn for MemoryTxn {
    async fn upsert_block(&mut self, block: &BlockHeader) -> Result<(), StorageError> {
        self.staged.blocks.push(block.clone());
        Ok(())
    }

    async fn insert_events(&mut self, events: &[Event]) -> Result<(), StorageError> {
        self.staged.events.extend_from_slice(events);
        Ok(())
    }

    async fn delete_from(&mut self, block_number: u64) -> Result<u64, StorageError> {
        self.staged.delete_from = Some(block_number);
        let inner = self.storage.lock();
        Ok(inner.blocks.range(block_number..).count() as u64)
    }

    async fn set_cursor(&mut self, cursor: &Cursor) -> Result<(), StorageError> {
        self.staged.cursor = Some(cursor.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        if self.storage.fail_commits.load(Ordering::SeqCst) > 0 {
            self.storage.fail_commits.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::Transient("injected commit failure".into()));
        }

        let mut inner = self.storage.lock();
        if let Some(from) = self.staged.delete_from {
            inner.blocks.retain(|n, _| *n < from);
            inner.events.retain(|e| e.block_number < from);
            let events = std::mem::take(&mut inner.events);
            inner.event_keys = events
                .iter()
                .map(|e| (e.block_hash.clone(), e.tx_hash.clone(), e.event_index))
                .collect();
            inner.events = events;
        }
        for block in self.staged.blocks {
            inner.blocks.insert(block.number, block);
        }
        for event in self.staged.events {
            let key = (
                event.block_hash.clone(),
                event.tx_hash.clone(),
                event.event_index,
            );
            // Primary-key conflict → no-op, as in the SQL adapters.
            if inner.event_keys.insert(key) {
                inner.events.push(event);
            }
        }
        if let Some(cursor) = self.staged.cursor {
            inner.cursor = Some(cursor);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn migrate(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StorageTxn>, StorageError> {
        Ok(Box::new(MemoryTxn {
            storage: self.clone(),
            staged: Staged::default(),
        }))
    }

    async fn cursor(&self) -> Result<Option<Cursor>, StorageError> {
        Ok(self.lock().cursor.clone())
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockHeader>, StorageError> {
        Ok(self.lock().blocks.get(&number).cloned())
    }

    async fn recent_blocks(&self, limit: usize) -> Result<Vec<BlockHeader>, StorageError> {
        let inner = self.lock();
        let mut headers: Vec<_> = inner.blocks.values().rev().take(limit).cloned().collect();
        headers.reverse();
        Ok(headers)
    }

    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<Event>, StorageError> {
        let mut events: Vec<_> = self
            .lock()
            .events
            .iter()
            .filter(|e| e.block_number >= from && e.block_number <= to)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.block_number, e.event_index));
        Ok(events)
    }

    async fn event_count(&self) -> Result<u64, StorageError> {
        Ok(self.lock().events.len() as u64)
    }

    async fn block_count(&self) -> Result<u64, StorageError> {
        Ok(self.lock().blocks.len() as u64)
    }

    async fn query(
        &self,
        _sql: &str,
        _params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, StorageError> {
        Err(StorageError::Fatal(
            "the in-memory adapter has no SQL surface".into(),
        ))
    }
}
