//! starkindex-core — foundation for the reorg-safe Starknet ingestion engine.
//!
//! # Architecture
//!
//! ```text
//! Indexer (starkindex-engine)
//!     ├── ChainSource       (historical paging + live heads, starkindex-rpc)
//!     ├── ReorgDetector     (canonical tail, fork-point location)
//!     ├── AbiRegistry       (selector → event descriptor, payload decoding)
//!     ├── Storage port      (adapters in starkindex-storage)
//!     └── Handler traits    (user event / reorg hooks)
//! ```
//!
//! This crate holds everything the other crates agree on: the data model,
//! the persistence port, the ABI registry, reorg detection and the error
//! taxonomy. It performs no I/O.

pub mod abi;
pub mod config;
pub mod error;
pub mod handler;
pub mod reorg;
pub mod selector;
pub mod status;
pub mod storage;
pub mod types;

pub use abi::{AbiRegistry, EventSubscription};
pub use config::{IndexerConfig, StartBlock};
pub use error::{AbiDecodeError, HandlerError, IndexerError};
pub use handler::{EventHandler, HandlerContext, ReorgHandler};
pub use reorg::{Directive, ReorgDetector};
pub use status::IndexerStatus;
pub use storage::{Storage, StorageError, StorageTxn};
pub use types::{BlockCandidate, BlockHeader, BlockStatus, Cursor, EmittedEvent, Event};
