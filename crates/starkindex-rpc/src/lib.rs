//! starkindex-rpc — network transports for the StarkIndex engine.
//!
//! Two transports, one typed facade:
//! - [`http::HttpRpcClient`] — JSON-RPC over HTTPS with capped-backoff retry
//!   for transient failures.
//! - [`ws::WsRpcClient`] — JSON-RPC over WebSocket with indefinite reconnect;
//!   subscriptions end on disconnect so the consumer can gap-fill first.
//! - [`provider::JsonRpcProvider`] — the `starknet_*` method surface the
//!   engine consumes through the [`provider::StarknetProvider`] trait.

pub mod error;
pub mod http;
pub mod provider;
pub mod request;
pub mod retry;
pub mod ws;

pub use error::TransportError;
pub use http::{HttpClientConfig, HttpRpcClient};
pub use provider::{HeadStream, JsonRpcProvider, StarknetProvider};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use retry::{RetryConfig, RetryPolicy};
pub use ws::{WsClientConfig, WsRpcClient};
