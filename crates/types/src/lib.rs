//! Core types shared across the lodestone world-state engine.
//!
//! Everything here has a canonical [`lodestone_codec::Codec`] encoding,
//! because these types end up inside trie leaves where byte-exactness is
//! consensus-critical.

#![warn(missing_docs)]

mod contract;
mod hash;
mod output;

pub use contract::{CodeRecord, ContractId, ContractState, FieldValue};
pub use hash::{Hash, HexError};
pub use output::{AssetOutput, ContractOutput, TxOutput, TxOutputRef};
