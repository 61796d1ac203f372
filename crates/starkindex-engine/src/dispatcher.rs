//! Post-commit handler dispatch.
//!
//! Handlers run strictly after the block's transaction has committed, on the
//! same task that committed it: handlers for block N all complete before any
//! handler for block N+1 starts, and within a block they run in
//! `event_index` order. A handler failure is logged with its event context
//! and the pipeline proceeds — committed state is never rolled back on
//! handler errors.

use std::sync::Arc;

use starkindex_core::{
    AbiRegistry, BlockHeader, Cursor, Event, HandlerContext, IndexerStatus, ReorgHandler, Storage,
};

pub struct HandlerDispatcher {
    registry: Arc<AbiRegistry>,
    reorg_handler: Option<Arc<dyn ReorgHandler>>,
    storage: Arc<dyn Storage>,
}

impl HandlerDispatcher {
    pub fn new(
        registry: Arc<AbiRegistry>,
        reorg_handler: Option<Arc<dyn ReorgHandler>>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            registry,
            reorg_handler,
            storage,
        }
    }

    /// Invoke the matching handler for every decoded event of a committed
    /// block. Events without a decoded payload are skipped: there is no
    /// typed payload to hand over.
    pub async fn dispatch_block(
        &self,
        header: &BlockHeader,
        events: &[Event],
        cursor: &Cursor,
        status: IndexerStatus,
    ) {
        let ctx = HandlerContext {
            block: header.clone(),
            cursor: cursor.clone(),
            status,
            db: Arc::clone(&self.storage),
        };

        for event in events {
            if event.decoded.is_none() {
                continue;
            }
            let Some(selector) = event.keys.first() else {
                continue;
            };
            let Some(registered) = self.registry.lookup(&event.contract_address, selector) else {
                continue;
            };
            if let Err(e) = registered.handler.on_event(event, &ctx).await {
                tracing::error!(
                    block = event.block_number,
                    tx = %event.tx_hash,
                    event_index = event.event_index,
                    event = %registered.event_name,
                    error = %e,
                    "event handler failed, continuing"
                );
            }
        }
    }

    /// Invoke the reorg handler once, after the rollback has committed.
    /// `forked_block` is the first rolled-back block; `tip` is the new chain
    /// tip the cursor was rewound to.
    pub async fn dispatch_reorg(&self, forked_block: u64, tip: &BlockHeader, cursor: &Cursor) {
        let Some(handler) = &self.reorg_handler else {
            return;
        };
        let ctx = HandlerContext {
            block: tip.clone(),
            cursor: cursor.clone(),
            status: IndexerStatus::ReorgRecovery,
            db: Arc::clone(&self.storage),
        };
        if let Err(e) = handler.on_reorg(forked_block, &ctx).await {
            tracing::error!(
                forked_block,
                error = %e,
                "reorg handler failed, continuing"
            );
        }
    }
}
