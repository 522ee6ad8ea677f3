use std::collections::HashMap;

use contigmem_core::allocator::{Chunk, ChunkAllocator};
use contigmem_core::memory::PhysAddr;
use contigmem_core::region::Region;
use contigmem_core::topology::NodeId;
use contigmem_core::util::Size;
use rand::SeedableRng;
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;

use crate::SimError;
use crate::ledger::Ledger;

/// Allocator that hands out a fragmented pool in random order.
///
/// Every node owns a pool of slot indices which is shuffled once with a seeded
/// generator, so a run is reproducible from its seed. Freed chunks do not return
/// to the pool.
#[derive(Debug)]
pub struct ShuffledChunks {
    seed: u64,
    chunk_size: Size,
    pools: HashMap<NodeId, Vec<usize>>,
    ledger: Ledger,
}

impl ShuffledChunks {
    /// Creates an allocator with 2 MB chunks and no pools.
    pub fn new(seed: u64) -> Self {
        ShuffledChunks {
            seed,
            chunk_size: Size::MB(2),
            pools: HashMap::new(),
            ledger: Ledger::default(),
        }
    }

    /// Gives `node` a pool of `slots`, shuffled.
    pub fn pool(mut self, node: NodeId, slots: impl IntoIterator<Item = usize>) -> Self {
        let mut rng = StdRng::seed_from_u64(self.seed ^ node.index() as u64);
        let mut slots: Vec<usize> = slots.into_iter().collect();
        slots.shuffle(&mut rng);
        // Allocation pops from the back.
        slots.reverse();
        self.pools.insert(node, slots);
        self
    }

    /// Gives `node` a pool of every slot in `[first, first + count)` except those
    /// for which `hole` returns true.
    pub fn fragmented(
        self,
        node: NodeId,
        first: usize,
        count: usize,
        hole: impl Fn(usize) -> bool,
    ) -> Self {
        self.pool(node, (first..first + count).filter(|&s| !hole(s)))
    }

    /// Makes [`ChunkAllocator::map_region`] fail for regions on `node`.
    pub fn fail_map(mut self, node: NodeId) -> Self {
        self.ledger.fail_map(node);
        self
    }

    /// Number of chunks currently held by callers.
    pub fn held(&self) -> usize {
        self.ledger.held()
    }

    /// Total number of successful allocations.
    pub fn allocations(&self) -> usize {
        self.ledger.allocations()
    }
}

impl ChunkAllocator for ShuffledChunks {
    type Error = SimError;

    fn chunk_size(&self) -> Size {
        self.chunk_size
    }

    fn allocate_chunk(&mut self, node: NodeId) -> Result<Chunk, SimError> {
        let slot = self
            .pools
            .get_mut(&node)
            .and_then(Vec::pop)
            .ok_or(SimError::Exhausted(node))?;
        let phys = PhysAddr::new(slot * self.chunk_size.bytes());
        Ok(self.ledger.hand_out(node, phys))
    }

    fn free_chunk(&mut self, chunk: Chunk) {
        self.ledger.take_back(&chunk);
    }

    fn map_region(&mut self, region: &mut Region) -> Result<*mut u8, SimError> {
        self.ledger.map(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contigmem_core::region::build_region;

    #[test]
    fn test_same_seed_same_order() {
        let mut a = ShuffledChunks::new(7).pool(NodeId(0), 1..100);
        let mut b = ShuffledChunks::new(7).pool(NodeId(0), 1..100);
        for _ in 0..99 {
            let (ca, cb) = (
                a.allocate_chunk(NodeId(0)).expect("pool a"),
                b.allocate_chunk(NodeId(0)).expect("pool b"),
            );
            assert_eq!(ca.phys(), cb.phys());
        }
        assert_eq!(a.allocate_chunk(NodeId(0)), Err(SimError::Exhausted(NodeId(0))));
    }

    #[test]
    fn test_builds_from_fragmented_pool() -> anyhow::Result<()> {
        // Every 8th slot missing: runs of at most 7.
        let mut chunks = ShuffledChunks::new(42).fragmented(NodeId(0), 1, 512, |s| s % 8 == 0);
        let region = build_region(&mut chunks, NodeId(0), 7)?;
        assert_eq!(region.len(), 7);
        assert_eq!(chunks.held(), 7);
        let first = region.base_phys().map(|p| p.as_usize() / Size::MB(2).bytes());
        assert_eq!(first.map(|s| s % 8), Some(1));

        let err = build_region(&mut chunks, NodeId(0), 8);
        assert!(err.is_err());
        assert_eq!(chunks.held(), 7);
        chunks.free_region(region);
        assert_eq!(chunks.held(), 0);
        Ok(())
    }
}
