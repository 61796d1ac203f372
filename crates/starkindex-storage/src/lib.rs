//! starkindex-storage — adapters for the StarkIndex persistence port.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//!
//! The port itself (`Storage`/`StorageTxn`) lives in `starkindex-core`; any
//! relational store can be plugged in by implementing it elsewhere.

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
