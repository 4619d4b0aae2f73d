//! # RocksDB storage
//!
//! Production [`lodestone_storage::RawKvStore`] backend.
//!
//! A restarting node opens this store and rehydrates its world state by
//! pointing trie readers at the roots recorded in the latest block header;
//! nothing beyond the node bytes themselves needs recovering.

#![warn(missing_docs)]

mod storage;

pub use storage::{CompressionKind, RocksDbConfig, RocksDbKvStore};
