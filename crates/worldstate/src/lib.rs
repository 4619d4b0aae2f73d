//! Layered world state for the lodestone chain.
//!
//! Three authenticated trees (outputs, contract states, code records)
//! over one content-addressed node store, wrapped in a three-layer
//! mutation stack:
//!
//! - **Persisted** ([`WorldState`]) — immutable, roots in the block
//!   header, safe to share with readers.
//! - **Cached** ([`CachedWorldState`]) — one per block being validated;
//!   buffers every mutation in memory until [`CachedWorldState::persist`].
//! - **Staging** ([`StagingWorldState`]) — one per transaction; commits
//!   into the cache on success, rolls back on failure.
//!
//! The layers share their read surface through [`WorldStateView`] and
//! their domain mutations through [`WorldStateMut`].

#![warn(missing_docs)]

mod cached;
mod staging;
mod view;
mod world;

pub use cached::{CachedTrie, Pending};
pub use staging::StagingTrie;
pub use view::{WorldStateMut, WorldStateView};
pub use world::{CachedWorldState, StagingWorldState, WorldState, WorldStateRoots};
