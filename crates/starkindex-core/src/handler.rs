//! User-facing handler traits and the context they receive.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::HandlerError;
use crate::status::IndexerStatus;
use crate::storage::{Storage, StorageError, StorageTxn};
use crate::types::{BlockHeader, Cursor, Event};

/// Context passed to handlers on every invocation.
///
/// The storage handle is separate from the indexer's own commit path: a
/// handler that opens a transaction owns it entirely, and its failures never
/// roll back the indexer's committed state.
#[derive(Clone)]
pub struct HandlerContext {
    /// The block the triggering event (or reorg) belongs to.
    pub block: BlockHeader,
    /// The committed cursor at invocation time.
    pub cursor: Cursor,
    /// Pipeline phase, for introspection. Handlers must not drive lifecycle.
    pub status: IndexerStatus,
    /// Storage access for handler-owned reads and writes.
    pub db: Arc<dyn Storage>,
}

impl HandlerContext {
    /// Open a transaction the handler owns.
    pub async fn begin(&self) -> Result<Box<dyn StorageTxn>, StorageError> {
        self.db.begin().await
    }
}

/// Invoked for each decoded event matching a subscription, after the block's
/// transaction has committed. At-least-once: a crash between commit and
/// dispatch means the handler is not replayed on restart unless the operator
/// rewinds the cursor, and idempotency is the handler's responsibility. The
/// `(block_hash, tx_hash, event_index)` triple is the idempotency key.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: &Event, ctx: &HandlerContext) -> Result<(), HandlerError>;
}

/// Invoked once per detected reorganization, after the rollback transaction
/// has committed. `forked_block` is the first rolled-back block number.
#[async_trait]
pub trait ReorgHandler: Send + Sync {
    async fn on_reorg(&self, forked_block: u64, ctx: &HandlerContext) -> Result<(), HandlerError>;
}

// ─── Typed adapter ────────────────────────────────────────────────────────────

/// A handler that receives the decoded payload deserialized into `T` instead
/// of the raw field map.
#[async_trait]
pub trait TypedHandler<T>: Send + Sync
where
    T: DeserializeOwned + Send,
{
    async fn on_decoded(
        &self,
        payload: T,
        event: &Event,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError>;
}

/// Adapter turning a [`TypedHandler`] into an [`EventHandler`], binding the
/// subscription to the ABI event's schema through `T`.
pub struct Typed<T, H> {
    inner: H,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> Typed<T, H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> EventHandler for Typed<T, H>
where
    T: DeserializeOwned + Send + Sync,
    H: TypedHandler<T>,
{
    async fn on_event(&self, event: &Event, ctx: &HandlerContext) -> Result<(), HandlerError> {
        let Some(fields) = &event.decoded else {
            return Err(HandlerError::new("event carries no decoded payload"));
        };
        let payload: T = serde_json::from_value(serde_json::Value::Object(fields.clone()))?;
        self.inner.on_decoded(payload, event, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockStatus;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullStorage;

    #[async_trait]
    impl Storage for NullStorage {
        async fn migrate(&self) -> Result<(), StorageError> {
            Ok(())
        }
        async fn begin(&self) -> Result<Box<dyn StorageTxn>, StorageError> {
            Err(StorageError::Fatal("no transactions".into()))
        }
        async fn cursor(&self) -> Result<Option<Cursor>, StorageError> {
            Ok(None)
        }
        async fn block_by_number(&self, _: u64) -> Result<Option<BlockHeader>, StorageError> {
            Ok(None)
        }
        async fn recent_blocks(&self, _: usize) -> Result<Vec<BlockHeader>, StorageError> {
            Ok(vec![])
        }
        async fn events_in_range(&self, _: u64, _: u64) -> Result<Vec<Event>, StorageError> {
            Ok(vec![])
        }
        async fn event_count(&self) -> Result<u64, StorageError> {
            Ok(0)
        }
        async fn block_count(&self) -> Result<u64, StorageError> {
            Ok(0)
        }
        async fn query(
            &self,
            _: &str,
            _: &[serde_json::Value],
        ) -> Result<Vec<serde_json::Value>, StorageError> {
            Ok(vec![])
        }
    }

    fn ctx() -> HandlerContext {
        HandlerContext {
            block: BlockHeader {
                number: 100,
                hash: "0xa".into(),
                parent_hash: "0x0".into(),
                timestamp: 0,
                status: BlockStatus::Accepted,
            },
            cursor: Cursor::new(100, "0xa"),
            status: IndexerStatus::Live,
            db: Arc::new(NullStorage),
        }
    }

    fn event(decoded: Option<serde_json::Map<String, serde_json::Value>>) -> Event {
        Event {
            block_hash: "0xa".into(),
            tx_hash: "0x1".into(),
            event_index: 0,
            contract_address: "0xaaa".into(),
            keys: vec!["0x99cd".into()],
            data: vec![],
            decoded,
            block_number: 100,
        }
    }

    #[derive(Deserialize)]
    struct TransferPayload {
        from: String,
        to: String,
        amount: String,
    }

    struct CountingTransfer(AtomicU32);

    #[async_trait]
    impl TypedHandler<TransferPayload> for CountingTransfer {
        async fn on_decoded(
            &self,
            payload: TransferPayload,
            _event: &Event,
            _ctx: &HandlerContext,
        ) -> Result<(), HandlerError> {
            assert_eq!(payload.from, "0x1");
            assert_eq!(payload.to, "0x2");
            assert_eq!(payload.amount, "0x64");
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn typed_adapter_deserializes_payload() {
        let mut fields = serde_json::Map::new();
        fields.insert("from".into(), "0x1".into());
        fields.insert("to".into(), "0x2".into());
        fields.insert("amount".into(), "0x64".into());

        let handler = Typed::new(CountingTransfer(AtomicU32::new(0)));
        handler.on_event(&event(Some(fields)), &ctx()).await.unwrap();
        assert_eq!(handler.inner.0.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn typed_adapter_rejects_undecoded_event() {
        let handler = Typed::new(CountingTransfer(AtomicU32::new(0)));
        let result = handler.on_event(&event(None), &ctx()).await;
        assert!(result.is_err());
        assert_eq!(handler.inner.0.load(Ordering::Relaxed), 0);
    }
}
