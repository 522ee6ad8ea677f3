//! Chunk allocator selection for the `reserve` binary.
//!
//! To add a chunk source, implement [`ChunkAllocator`] for it and add a variant to
//! [`ChunkSource`].

use clap::ValueEnum;
use contigmem_core::allocator::ChunkAllocator;
use contigmem_core::topology::Topology;
use contigmem_dummy::ShuffledChunks;
use contigmem_hugepage::HugetlbChunks;
use serde::Serialize;

/// Where chunks come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSource {
    /// HugeTLB pages of the running kernel
    Hugetlb,
    /// A fragmented, shuffled pool of simulated chunks
    Simulated,
}

/// Pool size of the simulated allocator, per node, as a multiple of the target.
const SIMULATED_POOL_FACTOR: usize = 4;

/// Builds a simulated allocator with a shuffled pool on every online node.
///
/// With `hole_every = Some(n)` every n-th slot is missing, so no region longer than
/// `n - 1` chunks can form and the reservation falls back to virtual memory.
pub fn simulated(
    topology: &Topology,
    chunks_per_node: usize,
    seed: u64,
    hole_every: Option<usize>,
) -> ShuffledChunks {
    let pool = chunks_per_node * SIMULATED_POOL_FACTOR;
    topology
        .online()
        .iter()
        .fold(ShuffledChunks::new(seed), |chunks, &node| {
            let first = 1 + node.index() * (pool + 1);
            chunks.fragmented(node, first, pool, |slot| {
                hole_every.is_some_and(|n| n > 0 && slot % n == 0)
            })
        })
}

/// Opens the HugeTLB allocator.
///
/// # Errors
///
/// Returns an error if HugeTLB pages or the page map are unavailable.
pub fn hugetlb() -> anyhow::Result<HugetlbChunks> {
    let chunks = HugetlbChunks::new()?;
    info!("HugeTLB chunk size: {}", chunks.chunk_size());
    Ok(chunks)
}
