use std::collections::{HashMap, VecDeque};

use contigmem_core::allocator::{Chunk, ChunkAllocator};
use contigmem_core::memory::PhysAddr;
use contigmem_core::region::Region;
use contigmem_core::topology::NodeId;
use contigmem_core::util::Size;
use log::trace;

use crate::SimError;
use crate::ledger::Ledger;

/// Allocator that hands out chunks at pre-scripted slot indices.
///
/// Chunk `i` of a node's script lives at physical address `slot * chunk_size`.
/// Once a node's script is used up, allocation on it fails.
///
/// # Examples
///
/// ```
/// use contigmem_core::region::build_region;
/// use contigmem_core::topology::NodeId;
/// use contigmem_dummy::ScriptedChunks;
///
/// let mut chunks = ScriptedChunks::default().script(NodeId(0), [5, 9, 7, 6, 8]);
/// let region = build_region(&mut chunks, NodeId(0), 4).unwrap();
/// assert_eq!(chunks.held(), 4);
/// assert_eq!(chunks.slot_of(&region.chunks()[0]), 6);
/// ```
#[derive(Debug)]
pub struct ScriptedChunks {
    chunk_size: Size,
    scripts: HashMap<NodeId, VecDeque<usize>>,
    ledger: Ledger,
}

impl Default for ScriptedChunks {
    fn default() -> Self {
        ScriptedChunks::new(Size::MB(2))
    }
}

impl ScriptedChunks {
    /// Creates an allocator without scripts and the given chunk size.
    pub fn new(chunk_size: Size) -> Self {
        ScriptedChunks {
            chunk_size,
            scripts: HashMap::new(),
            ledger: Ledger::default(),
        }
    }

    /// Appends `slots` to the script of `node`.
    pub fn script(mut self, node: NodeId, slots: impl IntoIterator<Item = usize>) -> Self {
        self.scripts.entry(node).or_default().extend(slots);
        self
    }

    /// Makes [`ChunkAllocator::map_region`] fail for regions on `node`.
    pub fn fail_map(mut self, node: NodeId) -> Self {
        self.ledger.fail_map(node);
        self
    }

    /// Slot index of a chunk handed out by this allocator.
    pub fn slot_of(&self, chunk: &Chunk) -> usize {
        chunk.phys().as_usize() / self.chunk_size.bytes()
    }

    /// Number of chunks currently held by callers.
    pub fn held(&self) -> usize {
        self.ledger.held()
    }

    /// Slot indices of the chunks currently held, ascending.
    pub fn held_slots(&self) -> Vec<usize> {
        self.ledger
            .held_addrs()
            .map(|p| p.as_usize() / self.chunk_size.bytes())
            .collect()
    }

    /// Total number of successful allocations.
    pub fn allocations(&self) -> usize {
        self.ledger.allocations()
    }

    /// Slots still scripted for `node`.
    pub fn remaining(&self, node: NodeId) -> usize {
        self.scripts.get(&node).map_or(0, VecDeque::len)
    }
}

impl ChunkAllocator for ScriptedChunks {
    type Error = SimError;

    fn chunk_size(&self) -> Size {
        self.chunk_size
    }

    fn allocate_chunk(&mut self, node: NodeId) -> Result<Chunk, SimError> {
        let slot = self
            .scripts
            .get_mut(&node)
            .and_then(VecDeque::pop_front)
            .ok_or(SimError::Exhausted(node))?;
        trace!("scripted chunk at slot {} for node {}", slot, node);
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
    use contigmem_core::ReserveError;
    use contigmem_core::region::build_region;

    #[test]
    fn test_forward_growth_with_gap() -> anyhow::Result<()> {
        let mut chunks = ScriptedChunks::default().script(NodeId(0), [5, 6, 8, 7]);
        let region = build_region(&mut chunks, NodeId(0), 4)?;
        assert_eq!(chunks.held_slots(), vec![5, 6, 7, 8]);
        assert_eq!(region.base_phys(), Some(PhysAddr::new(5 * Size::MB(2).bytes())));
        Ok(())
    }

    #[test]
    fn test_surplus_released() -> anyhow::Result<()> {
        let mut chunks = ScriptedChunks::default().script(NodeId(0), [5, 9, 7, 6, 8]);
        let region = build_region(&mut chunks, NodeId(0), 4)?;
        assert_eq!(chunks.held_slots(), vec![6, 7, 8, 9]);
        assert_eq!(region.len(), 4);
        assert_eq!(chunks.allocations(), 5);
        Ok(())
    }

    #[test]
    fn test_exhaustion_releases_everything() {
        let mut chunks = ScriptedChunks::default().script(NodeId(1), [3, 5, 7, 9]);
        let err = build_region(&mut chunks, NodeId(1), 2).expect_err("no run");
        assert!(matches!(err, ReserveError::Exhausted { chunks: 2, .. }));
        assert_eq!(chunks.held(), 0);
        assert_eq!(chunks.remaining(NodeId(1)), 0);
    }

    #[test]
    fn test_unmappable() -> anyhow::Result<()> {
        let mut chunks = ScriptedChunks::default()
            .script(NodeId(0), [1, 2])
            .fail_map(NodeId(0));
        let mut region = build_region(&mut chunks, NodeId(0), 2)?;
        assert_eq!(
            chunks.map_region(&mut region),
            Err(SimError::Unmappable(NodeId(0)))
        );
        chunks.free_region(region);
        assert_eq!(chunks.held(), 0);
        Ok(())
    }
}
