//! Per-block processing: filter, decode, persist.

use std::sync::Arc;

use starkindex_core::{
    abi, AbiRegistry, BlockCandidate, BlockHeader, Cursor, Event, Storage, StorageError,
};

/// Turns accepted candidates into committed rows, and rolls them back again
/// on reorg. Every write happens inside a single storage transaction.
pub struct BlockProcessor {
    storage: Arc<dyn Storage>,
    registry: Arc<AbiRegistry>,
}

impl BlockProcessor {
    pub fn new(storage: Arc<dyn Storage>, registry: Arc<AbiRegistry>) -> Self {
        Self { storage, registry }
    }

    /// Filter the candidate's events down to subscribed ones and decode
    /// them. Events from unsubscribed contracts are dropped before
    /// persistence; a decode failure keeps the event raw (`decoded: None`)
    /// and logs a warning.
    pub fn prepare(&self, candidate: &BlockCandidate) -> Vec<Event> {
        let header = &candidate.header;
        let mut events = Vec::new();

        for emitted in &candidate.events {
            let Some(selector) = emitted.selector() else {
                continue;
            };
            let Some(registered) = self.registry.lookup(&emitted.from_address, &selector) else {
                continue;
            };

            let decoded = match abi::decode_event(registered, &emitted.keys, &emitted.data) {
                Ok(fields) => Some(fields),
                Err(e) => {
                    tracing::warn!(
                        block = header.number,
                        tx = %emitted.tx_hash,
                        event_index = emitted.event_index,
                        event = %registered.event_name,
                        error = %e,
                        "event kept raw: decode failed"
                    );
                    None
                }
            };

            events.push(Event {
                block_hash: header.hash.clone(),
                tx_hash: emitted.tx_hash.clone(),
                event_index: emitted.event_index,
                contract_address: emitted.from_address.clone(),
                keys: emitted.keys.clone(),
                data: emitted.data.clone(),
                decoded,
                block_number: header.number,
            });
        }
        events
    }

    /// Persist a block, its events and the advanced cursor in one
    /// transaction. Returns the new cursor.
    pub async fn commit_block(
        &self,
        header: &BlockHeader,
        events: &[Event],
    ) -> Result<Cursor, StorageError> {
        let cursor = Cursor::new(header.number, header.hash.clone());
        let mut txn = self.storage.begin().await?;
        txn.upsert_block(header).await?;
        txn.insert_events(events).await?;
        txn.set_cursor(&cursor).await?;
        txn.commit().await?;

        tracing::debug!(
            block = header.number,
            hash = %header.hash,
            events = events.len(),
            "block committed"
        );
        Ok(cursor)
    }

    /// Remove every row with `number >= from_block` and rewind the cursor,
    /// atomically. Returns the number of blocks rolled back.
    pub async fn rollback_from(
        &self,
        from_block: u64,
        new_cursor: &Cursor,
    ) -> Result<u64, StorageError> {
        let mut txn = self.storage.begin().await?;
        let removed = txn.delete_from(from_block).await?;
        txn.set_cursor(new_cursor).await?;
        txn.commit().await?;

        tracing::warn!(
            from_block,
            removed,
            new_tip = new_cursor.block_number,
            "rolled back to fork point"
        );
        Ok(removed)
    }
}
