use std::collections::BTreeSet;

use contigmem_core::allocator::Chunk;
use contigmem_core::memory::PhysAddr;
use contigmem_core::region::Region;
use contigmem_core::topology::NodeId;
use log::error;

use crate::SimError;

/// Bookkeeping of chunks handed out by a simulated allocator.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    held: BTreeSet<PhysAddr>,
    allocations: usize,
    unmappable: BTreeSet<NodeId>,
}

impl Ledger {
    pub(crate) fn hand_out(&mut self, node: NodeId, phys: PhysAddr) -> Chunk {
        self.allocations += 1;
        self.held.insert(phys);
        // Synthetic address: never dereferenced.
        Chunk::new(node, phys, phys.as_usize() as *mut u8)
    }

    pub(crate) fn take_back(&mut self, chunk: &Chunk) {
        if !self.held.remove(&chunk.phys()) {
            error!("freeing chunk {:p} that is not held", chunk.phys());
        }
    }

    pub(crate) fn map(&self, region: &Region) -> Result<*mut u8, SimError> {
        if self.unmappable.contains(&region.node()) {
            return Err(SimError::Unmappable(region.node()));
        }
        region
            .chunks()
            .first()
            .map(Chunk::ptr)
            .ok_or(SimError::Unmappable(region.node()))
    }

    pub(crate) fn fail_map(&mut self, node: NodeId) {
        self.unmappable.insert(node);
    }

    pub(crate) fn held(&self) -> usize {
        self.held.len()
    }

    pub(crate) fn held_addrs(&self) -> impl Iterator<Item = PhysAddr> + '_ {
        self.held.iter().copied()
    }

    pub(crate) fn allocations(&self) -> usize {
        self.allocations
    }
}
