//! The `StarknetProvider` trait and its JSON-RPC implementation.
//!
//! The trait is the seam between the engine and the network: the engine is
//! generic over it, so tests drive the pipeline with a scripted in-memory
//! chain while production uses [`JsonRpcProvider`] over HTTP + WebSocket.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;

use starkindex_core::{BlockCandidate, BlockHeader, BlockStatus, EmittedEvent};

use crate::error::TransportError;
use crate::http::{HttpClientConfig, HttpRpcClient};
use crate::ws::{WsClientConfig, WsRpcClient};

/// A stream of new-head announcements from the node. Ends when the
/// underlying connection drops; the consumer gap-fills and re-subscribes.
pub type HeadStream = Pin<Box<dyn Stream<Item = BlockHeader> + Send>>;

/// Read access to a Starknet chain.
#[async_trait]
pub trait StarknetProvider: Send + Sync + 'static {
    /// Current head block number.
    async fn block_number(&self) -> Result<u64, TransportError>;

    /// Fetch a block with its receipts, flattened into a candidate.
    async fn block_with_receipts(&self, number: u64) -> Result<BlockCandidate, TransportError>;

    /// Fetch a block header by number (no receipts).
    async fn block_header(&self, number: u64) -> Result<BlockHeader, TransportError>;

    /// Subscribe to new heads over the WebSocket endpoint.
    async fn subscribe_new_heads(&self) -> Result<HeadStream, TransportError>;
}

// ─── Wire model ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BlockWire {
    block_number: u64,
    block_hash: String,
    parent_hash: String,
    timestamp: u64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    transactions: Vec<TransactionWire>,
}

#[derive(Debug, Deserialize)]
struct TransactionWire {
    receipt: ReceiptWire,
}

#[derive(Debug, Deserialize)]
struct ReceiptWire {
    transaction_hash: String,
    #[serde(default)]
    events: Vec<EventWire>,
}

#[derive(Debug, Deserialize)]
struct EventWire {
    from_address: String,
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    data: Vec<String>,
}

fn status_from_wire(status: Option<&str>) -> BlockStatus {
    match status {
        Some("PENDING") | Some("PRE_CONFIRMED") => BlockStatus::Pending,
        _ => BlockStatus::Accepted,
    }
}

fn header_from_wire(block: &BlockWire) -> BlockHeader {
    BlockHeader {
        number: block.block_number,
        hash: block.block_hash.clone(),
        parent_hash: block.parent_hash.clone(),
        timestamp: block.timestamp,
        status: status_from_wire(block.status.as_deref()),
    }
}

/// Flatten a block-with-receipts payload into a candidate, numbering events
/// block-wide in emission order.
fn candidate_from_wire(block: BlockWire) -> BlockCandidate {
    let header = header_from_wire(&block);
    let mut events = Vec::new();
    let mut event_index = 0u32;
    for tx in block.transactions {
        for ev in tx.receipt.events {
            events.push(EmittedEvent {
                from_address: ev.from_address,
                tx_hash: tx.receipt.transaction_hash.clone(),
                event_index,
                keys: ev.keys,
                data: ev.data,
            });
            event_index += 1;
        }
    }
    BlockCandidate { header, events }
}

#[derive(Debug, Deserialize)]
struct NewHeadWire {
    block_number: u64,
    block_hash: String,
    parent_hash: String,
    timestamp: u64,
}

// ─── JSON-RPC provider ────────────────────────────────────────────────────────

/// Production provider: `starknet_*` methods over HTTPS, `newHeads` over
/// WebSocket. Requires a node speaking Starknet JSON-RPC >= 0.8 for the
/// receipts shape.
pub struct JsonRpcProvider {
    http: HttpRpcClient,
    ws: WsRpcClient,
}

impl JsonRpcProvider {
    pub fn new(
        rpc_url: impl Into<String>,
        ws_url: impl Into<String>,
        http_config: HttpClientConfig,
        ws_config: WsClientConfig,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            http: HttpRpcClient::new(rpc_url, http_config)?,
            ws: WsRpcClient::connect(ws_url, ws_config),
        })
    }

    pub fn with_defaults(
        rpc_url: impl Into<String>,
        ws_url: impl Into<String>,
    ) -> Result<Self, TransportError> {
        Self::new(
            rpc_url,
            ws_url,
            HttpClientConfig::default(),
            WsClientConfig::default(),
        )
    }
}

#[async_trait]
impl StarknetProvider for JsonRpcProvider {
    async fn block_number(&self) -> Result<u64, TransportError> {
        self.http.call("starknet_blockNumber", vec![]).await
    }

    async fn block_with_receipts(&self, number: u64) -> Result<BlockCandidate, TransportError> {
        let block: BlockWire = self
            .http
            .call(
                "starknet_getBlockWithReceipts",
                vec![json!({ "block_number": number })],
            )
            .await?;
        Ok(candidate_from_wire(block))
    }

    async fn block_header(&self, number: u64) -> Result<BlockHeader, TransportError> {
        let block: BlockWire = self
            .http
            .call(
                "starknet_getBlockByNumber",
                vec![json!({ "block_number": number })],
            )
            .await?;
        Ok(header_from_wire(&block))
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream, TransportError> {
        let (sub_id, receiver) = self
            .ws
            .subscribe("starknet_subscribeNewHeads", vec![])
            .await?;
        tracing::debug!(subscription = %sub_id, "new-heads subscription open");

        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            loop {
                let payload = rx.recv().await?;
                match serde_json::from_value::<NewHeadWire>(payload) {
                    Ok(head) => {
                        let header = BlockHeader {
                            number: head.block_number,
                            hash: head.block_hash,
                            parent_hash: head.parent_hash,
                            timestamp: head.timestamp,
                            status: BlockStatus::Accepted,
                        };
                        return Some((header, rx));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed head notification");
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_flattens_receipts_with_block_wide_indexes() {
        let wire: BlockWire = serde_json::from_value(json!({
            "block_number": 100,
            "block_hash": "0x64a",
            "parent_hash": "0x63a",
            "timestamp": 1_700_000_000,
            "status": "ACCEPTED_ON_L2",
            "transactions": [
                {"receipt": {"transaction_hash": "0xt1", "events": [
                    {"from_address": "0xaaa", "keys": ["0x1"], "data": ["0x2"]},
                    {"from_address": "0xbbb", "keys": ["0x3"], "data": []}
                ]}},
                {"receipt": {"transaction_hash": "0xt2", "events": [
                    {"from_address": "0xaaa", "keys": ["0x4"], "data": []}
                ]}}
            ]
        }))
        .unwrap();

        let candidate = candidate_from_wire(wire);
        assert_eq!(candidate.header.number, 100);
        assert_eq!(candidate.header.status, BlockStatus::Accepted);
        assert_eq!(candidate.events.len(), 3);
        assert_eq!(candidate.events[0].event_index, 0);
        assert_eq!(candidate.events[1].event_index, 1);
        assert_eq!(candidate.events[2].event_index, 2);
        assert_eq!(candidate.events[2].tx_hash, "0xt2");
    }

    #[test]
    fn pending_status_mapped() {
        assert_eq!(status_from_wire(Some("PENDING")), BlockStatus::Pending);
        assert_eq!(status_from_wire(Some("ACCEPTED_ON_L1")), BlockStatus::Accepted);
        assert_eq!(status_from_wire(None), BlockStatus::Accepted);
    }

    #[test]
    fn missing_header_field_is_malformed() {
        let result: Result<BlockWire, _> = serde_json::from_value(json!({
            "block_number": 100,
            "parent_hash": "0x63a",
            "timestamp": 0
        }));
        assert!(result.is_err());
    }
}
