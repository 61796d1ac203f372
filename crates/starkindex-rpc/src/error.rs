//! Transport-level error types.

use thiserror::Error;

use starkindex_core::IndexerError;

use crate::request::JsonRpcError;

/// Errors that can occur during an RPC or WebSocket operation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, 5xx, timeout at the socket).
    #[error("http error: {0}")]
    Http(String),

    /// WebSocket connect/send/receive error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("rpc error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out after the configured duration.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The node answered, but the payload does not match the expected shape.
    /// Never retried: the same request would yield the same malformed body.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl TransportError {
    /// Returns `true` if this is a transient network failure worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::WebSocket(_) | Self::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedResponse(e.to_string())
    }
}

impl From<TransportError> for IndexerError {
    fn from(e: TransportError) -> Self {
        IndexerError::Rpc(e.to_string())
    }
}
