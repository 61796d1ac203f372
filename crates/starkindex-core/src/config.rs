//! Indexer configuration.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Where to start when no cursor has been committed yet.
///
/// Serialized as either a block number or the literal string `"latest"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartBlock {
    /// A concrete starting block number.
    Number(u64),
    /// Start at the live head observed at `start()`.
    #[default]
    Latest,
}

impl Serialize for StartBlock {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(n) => serializer.serialize_u64(*n),
            Self::Latest => serializer.serialize_str("latest"),
        }
    }
}

impl<'de> Deserialize<'de> for StartBlock {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Literal(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self::Number(n)),
            Raw::Literal(s) if s == "latest" => Ok(Self::Latest),
            Raw::Literal(s) => Err(serde::de::Error::custom(format!(
                "expected a block number or \"latest\", got \"{s}\""
            ))),
        }
    }
}

/// Log verbosity, mapped onto a tracing filter directive by the binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Database adapter selection for binaries that build storage from config.
/// Library users inject a `Storage` implementation directly instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Adapter-specific connection string (e.g. a SQLite path or URL).
    pub url: String,
}

/// Configuration for an indexer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// HTTPS JSON-RPC endpoint (required).
    pub rpc_node_url: String,
    /// WebSocket endpoint for new-head subscriptions (required).
    pub ws_node_url: String,
    /// Database adapter config; consulted by binaries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
    /// Consulted only when no cursor exists.
    #[serde(default)]
    pub starting_block: StartBlock,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Worker-pool size `W` for historical paging.
    #[serde(default = "default_historical_concurrency")]
    pub historical_concurrency: usize,
    /// Canonical-tail length `K`; must exceed the chain's expected max reorg
    /// depth.
    #[serde(default = "default_reorg_window")]
    pub reorg_window: usize,
    /// Per-call RPC timeout in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// WebSocket subscribe handshake timeout in milliseconds.
    #[serde(default = "default_ws_handshake_timeout_ms")]
    pub ws_handshake_timeout_ms: u64,
}

fn default_historical_concurrency() -> usize {
    8
}

fn default_reorg_window() -> usize {
    64
}

fn default_rpc_timeout_ms() -> u64 {
    15_000
}

fn default_ws_handshake_timeout_ms() -> u64 {
    10_000
}

impl IndexerConfig {
    /// Minimal config for the given endpoints, everything else defaulted.
    pub fn new(rpc_node_url: impl Into<String>, ws_node_url: impl Into<String>) -> Self {
        Self {
            rpc_node_url: rpc_node_url.into(),
            ws_node_url: ws_node_url.into(),
            database: None,
            starting_block: StartBlock::default(),
            log_level: LogLevel::default(),
            historical_concurrency: default_historical_concurrency(),
            reorg_window: default_reorg_window(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            ws_handshake_timeout_ms: default_ws_handshake_timeout_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.rpc_node_url.is_empty() {
            return Err(IndexerError::Configuration("rpc_node_url is required".into()));
        }
        if self.ws_node_url.is_empty() {
            return Err(IndexerError::Configuration("ws_node_url is required".into()));
        }
        if self.historical_concurrency == 0 {
            return Err(IndexerError::Configuration(
                "historical_concurrency must be at least 1".into(),
            ));
        }
        if self.reorg_window == 0 {
            return Err(IndexerError::Configuration(
                "reorg_window must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
