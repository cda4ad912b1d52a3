// src/lib.rs - Jolt node library
//!
//! A full node for the Jolt proof-of-work chain: crypto and address
//! derivation, Merkle trees, transactions, blocks, a RocksDB-backed
//! store, the chain engine that admits blocks and transactions, and
//! the sync/mining loops and HTTP API that sit on top of it.

pub mod api;
pub mod block;
pub mod canonical;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod merkle;
pub mod mining;
pub mod store;
pub mod sync;
pub mod transaction;

pub use block::Block;
pub use config::NodeConfig;
pub use engine::{Engine, Policy};
pub use error::{NodeError, Result};
pub use store::{RocksDbStore, Store};
pub use transaction::Transaction;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialise logging for the node binary.
pub fn init_logging(level: &str) {
    let level = level.parse().unwrap_or(log::LevelFilter::Info);
    env_logger::Builder::from_default_env().filter_level(level).init();
}
