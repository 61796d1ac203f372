//! Liveness tracking for the three external dependencies.

use std::sync::atomic::{AtomicI64, Ordering};

/// Result of a health check: each dependency is live if it was successfully
/// interacted with inside the observation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    pub ws: bool,
    pub rpc: bool,
    pub database: bool,
}

/// Records the unix timestamp of the last successful interaction per
/// dependency. Written from the pipeline tasks, read by `health_check()`.
#[derive(Debug, Default)]
pub struct HealthTracker {
    ws: AtomicI64,
    rpc: AtomicI64,
    database: AtomicI64,
}

/// Liveness window in seconds.
const WINDOW_SECS: i64 = 30;

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ws(&self) {
        self.ws.store(now(), Ordering::Relaxed);
    }

    pub fn record_rpc(&self) {
        self.rpc.store(now(), Ordering::Relaxed);
    }

    pub fn record_database(&self) {
        self.database.store(now(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Health {
        let cutoff = now() - WINDOW_SECS;
        Health {
            ws: self.ws.load(Ordering::Relaxed) > cutoff,
            rpc: self.rpc.load(Ordering::Relaxed) > cutoff,
            database: self.database.load(Ordering::Relaxed) > cutoff,
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
