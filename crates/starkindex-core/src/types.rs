//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

use crate::selector::normalize_hex;

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// Finality status of a block as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    /// Accepted on L2 (or already proven on L1).
    Accepted,
    /// Pre-confirmation block without a final hash.
    Pending,
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

/// A block header — enough for the pipeline to track canonicity and progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…` felt).
    pub hash: String,
    /// Parent block hash (`0x…` felt).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: u64,
    /// Finality status.
    pub status: BlockStatus,
}

impl BlockHeader {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── Events ───────────────────────────────────────────────────────────────────

/// A raw event lifted out of a transaction receipt, before any filtering.
///
/// `event_index` is the block-wide position of the event in emission order,
/// counted across all transactions of the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmittedEvent {
    /// Contract address that emitted the event (`0x…` felt).
    pub from_address: String,
    /// Transaction hash the event belongs to.
    pub tx_hash: String,
    /// Position of the event within the block.
    pub event_index: u32,
    /// Event keys; `keys[0]` is the event selector.
    pub keys: Vec<String>,
    /// Non-key payload felts.
    pub data: Vec<String>,
}

impl EmittedEvent {
    /// Returns the normalized event selector (`keys[0]`), if present.
    pub fn selector(&self) -> Option<String> {
        self.keys.first().map(|k| normalize_hex(k))
    }
}

/// An event as persisted: the raw payload is always kept, the decoded field
/// map is present only when a registered ABI matched and decoding succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hash of the block the event was emitted in.
    pub block_hash: String,
    /// Transaction hash.
    pub tx_hash: String,
    /// Position of the event within the block.
    pub event_index: u32,
    /// Emitting contract address.
    pub contract_address: String,
    /// Raw event keys (`keys[0]` is the selector).
    pub keys: Vec<String>,
    /// Raw event data felts.
    pub data: Vec<String>,
    /// Decoded field map, `None` when no ABI matched or decoding failed.
    pub decoded: Option<serde_json::Map<String, serde_json::Value>>,
    /// Block number, denormalized for range queries.
    pub block_number: u64,
}

// ─── BlockCandidate ───────────────────────────────────────────────────────────

/// A block as produced by the chain source: header plus every event emitted
/// in the block, in emission order. Filtering against subscriptions happens
/// downstream in the block processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCandidate {
    pub header: BlockHeader,
    pub events: Vec<EmittedEvent>,
}

// ─── Cursor ───────────────────────────────────────────────────────────────────

/// The committed high-water mark of processed blocks.
///
/// Invariant: rows exist on disk for every block up to and including
/// `block_number`, and for no block above it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last committed block number.
    pub block_number: u64,
    /// Last committed block hash.
    pub block_hash: String,
}

impl Cursor {
    pub fn new(block_number: u64, block_hash: impl Into<String>) -> Self {
        Self {
            block_number,
            block_hash: block_hash.into(),
        }
    }

    /// Returns the next block to process (cursor + 1).
    pub fn next_block(&self) -> u64 {
        self.block_number + 1
    }
}
