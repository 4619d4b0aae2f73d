//! Sparse Merkle trie over a content-addressed byte store.
//!
//! The authenticated map underpinning lodestone's world state. Keys are
//! positioned by the 64-nibble path of their digest; nodes are stored at
//! their own content hash, so the node store is append-only and any root
//! ever produced stays readable until offline compaction. See
//! [`SparseMerkleTrie`] for the public contract.

#![warn(missing_docs)]

mod nibbles;
mod node;
mod trie;

pub use nibbles::{Nibbles, DIGEST_NIBBLES};
pub use node::{Node, NO_CHILDREN};
pub use trie::{SparseMerkleTrie, EMPTY_ROOT};
