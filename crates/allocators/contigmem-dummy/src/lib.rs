//! Simulated chunk allocators.
//!
//! These allocators implement [`contigmem_core::allocator::ChunkAllocator`] without
//! touching real memory. Physical addresses are `slot * chunk_size` and virtual
//! addresses are synthetic, so they must never be dereferenced. Both allocators
//! track every chunk they hand out, which makes leaks visible in tests.
//!
//! - [`ScriptedChunks`] - hands out slots in a fixed, per-node order
//! - [`ShuffledChunks`] - hands out a fragmented pool in seeded random order

#![warn(missing_docs)]

mod ledger;
mod scripted;
mod shuffled;

use contigmem_core::topology::NodeId;
use thiserror::Error;

pub use scripted::ScriptedChunks;
pub use shuffled::ShuffledChunks;

/// Errors of the simulated allocators.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimError {
    /// The node has no chunk left
    #[error("no simulated chunk left at node {0}")]
    Exhausted(NodeId),
    /// Mapping regions of this node was configured to fail
    #[error("cannot map simulated region at node {0}")]
    Unmappable(NodeId),
}
