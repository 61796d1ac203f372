//! Runtime status of the indexer, published over a watch channel.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the pipeline.
///
/// Fatal conditions surface as [`IndexerStatus::Failed`] with the reason;
/// the orchestrator is the only component that transitions into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerStatus {
    /// Not yet started.
    Idle,
    /// Draining the historical range up to the head observed at start.
    Backfilling,
    /// Following new heads in real time.
    Live,
    /// Rolling back and replaying after a detected fork.
    ReorgRecovery,
    /// Shutdown requested; the in-flight block is finishing.
    Stopping,
    /// Terminated cleanly.
    Stopped,
    /// Halted on an unrecoverable error.
    Failed(String),
}

impl IndexerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }
}

impl std::fmt::Display for IndexerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Backfilling => write!(f, "backfilling"),
            Self::Live => write!(f, "live"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(IndexerStatus::Stopped.is_terminal());
        assert!(IndexerStatus::Failed("boom".into()).is_terminal());
        assert!(!IndexerStatus::Live.is_terminal());
    }
}
