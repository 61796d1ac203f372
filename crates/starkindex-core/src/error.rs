//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur while decoding a single event against an ABI.
///
/// Decode failures never kill the pipeline: the event is persisted raw with
/// an empty decoded payload and a warning is logged.
#[derive(Debug, Error)]
pub enum AbiDecodeError {
    #[error("event '{name}' not found in ABI")]
    EventNotFound { name: String },

    #[error("event '{name}' has unsupported kind '{kind}'")]
    UnsupportedEventKind { name: String, kind: String },

    #[error("field '{field}' has unsupported type '{ty}'")]
    UnsupportedType { field: String, ty: String },

    #[error("payload exhausted decoding field '{field}' from {section}")]
    PayloadExhausted {
        field: String,
        /// `"keys"` or `"data"`.
        section: &'static str,
    },

    #[error("trailing payload after decoding: {keys_left} key felt(s), {data_left} data felt(s)")]
    TrailingPayload { keys_left: usize, data_left: usize },

    #[error("invalid felt '{value}': {reason}")]
    InvalidFelt { value: String, reason: String },
}

/// Errors raised by user handlers.
///
/// Caught and logged by the dispatcher; the pipeline proceeds. Handlers own
/// their idempotency and retries.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Top-level errors surfaced by the orchestrator.
///
/// The orchestrator is the only component allowed to halt the pipeline; every
/// other component reports upward through these tagged values.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Required options missing, a subscription registered after `start()`,
    /// or an ABI that does not contain the subscribed event.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// RPC or WebSocket failure that survived the transport retry budget.
    #[error("rpc error: {0}")]
    Rpc(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A fork diverged deeper than the reorg window can resolve. Fatal:
    /// requires operator intervention (larger window or a cursor rewind).
    #[error("reorg at block {at_block} exceeds the {window}-block window")]
    DeepReorg { at_block: u64, window: usize },

    #[error("handler '{handler}' failed: {reason}")]
    Handler { handler: String, reason: String },

    #[error("indexer aborted: {reason}")]
    Aborted { reason: String },
}

impl IndexerError {
    /// Returns `true` if the underlying condition may clear on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_transient())
    }
}
