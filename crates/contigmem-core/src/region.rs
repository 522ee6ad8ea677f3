//! Contiguous region building.
//!
//! [`RegionBuilder`] greedily allocates chunks from a [`ChunkAllocator`] and files
//! them into a sparse table indexed by physical address. As soon as the table
//! holds a run of `target` adjacent slots, the run becomes the [`Region`] and every
//! other chunk is handed back. If the allocator runs dry first, all chunks are
//! handed back.
//!
//! The search keeps a candidate run `[start, end]` and the filled bounds
//! `[min, max]`. A chunk landing right after `end` or right before `start` grows
//! the candidate in place; any other chunk triggers a rescan of the table for the
//! longest run.

use std::collections::BTreeMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, error, trace};

use crate::allocator::{Chunk, ChunkAllocator};
use crate::error::{Fault, ReserveError};
use crate::memory::PhysAddr;
use crate::topology::NodeId;
use crate::util::{DEFAULT_SLOT_LIMIT, NamedProgress};

/// A physically contiguous run of chunks on one node.
///
/// Chunks are stored in ascending physical order.
#[derive(Debug)]
pub struct Region {
    node: NodeId,
    chunks: Vec<Chunk>,
}

impl Region {
    fn new(node: NodeId, chunks: Vec<Chunk>) -> Self {
        Region { node, chunks }
    }

    /// Node the region lives on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Physical address of the first chunk.
    pub fn base_phys(&self) -> Option<PhysAddr> {
        self.chunks.first().map(Chunk::phys)
    }

    /// Number of chunks in the region.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the region holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks in ascending physical order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Mutable access for allocators that relocate chunks while mapping.
    pub fn chunks_mut(&mut self) -> &mut [Chunk] {
        &mut self.chunks
    }

    /// Consumes the region, returning its chunks.
    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }
}

/// Inclusive run of slot indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn single(slot: usize) -> Self {
        Span {
            start: slot,
            end: slot,
        }
    }

    fn len(&self) -> usize {
        self.end - self.start + 1
    }
}

/// Sparse slot table. Slot 0 is reserved and never filled.
struct Slots {
    filled: BTreeMap<usize, Chunk>,
    limit: usize,
}

impl Slots {
    fn new(limit: usize) -> Self {
        Slots {
            filled: BTreeMap::new(),
            limit,
        }
    }

    fn slot_of(&self, phys: PhysAddr, base: PhysAddr, chunk_size: usize) -> Result<usize, Fault> {
        let slot = phys.offset_from(base).ok_or(Fault::ReservedSlot)? / chunk_size;
        if slot == 0 {
            return Err(Fault::ReservedSlot);
        }
        if slot >= self.limit {
            return Err(Fault::SlotOutOfRange {
                slot,
                limit: self.limit,
            });
        }
        Ok(slot)
    }

    fn contains(&self, slot: usize) -> bool {
        self.filled.contains_key(&slot)
    }

    /// Files `chunk` at `slot`, handing it back if the slot is taken.
    fn insert(&mut self, slot: usize, chunk: Chunk) -> Result<(), Chunk> {
        if self.contains(slot) {
            return Err(chunk);
        }
        self.filled.insert(slot, chunk);
        Ok(())
    }

    /// Longest run of filled slots, the earliest one on ties.
    ///
    /// Returns the first `target` slots of a run as soon as one reaches `target`.
    fn longest_run(&self, target: usize) -> Option<Span> {
        let mut best: Option<Span> = None;
        let mut current: Option<Span> = None;
        for &slot in self.filled.keys() {
            let run = match current {
                Some(run) if run.end + 1 == slot => Span {
                    start: run.start,
                    end: slot,
                },
                _ => Span::single(slot),
            };
            if run.len() == target {
                return Some(run);
            }
            if best.is_none_or(|b| run.len() > b.len()) {
                best = Some(run);
            }
            current = Some(run);
        }
        best
    }

    /// Splits the table into the chunks inside `span` and everything else.
    fn split(mut self, span: Span) -> (Vec<Chunk>, Vec<Chunk>) {
        let above = self.filled.split_off(&(span.end + 1));
        let inside = self.filled.split_off(&span.start);
        let outside = self.filled.into_values().chain(above.into_values()).collect();
        (inside.into_values().collect(), outside)
    }

    fn into_chunks(self) -> impl Iterator<Item = Chunk> {
        self.filled.into_values()
    }
}

/// Search cursors: filled bounds and the candidate run.
struct Cursor {
    min: usize,
    max: usize,
    run: Span,
}

impl Cursor {
    fn new(slot: usize) -> Self {
        Cursor {
            min: slot,
            max: slot,
            run: Span::single(slot),
        }
    }

    /// Accounts for a chunk just filed at `slot`.
    ///
    /// Growing the candidate past `target` keeps the edge that grew.
    fn place(&mut self, slots: &Slots, slot: usize, target: usize) {
        self.min = self.min.min(slot);
        self.max = self.max.max(slot);

        if slot == self.run.end + 1 {
            let mut end = slot;
            while end < self.max && slots.contains(end + 1) {
                end += 1;
            }
            self.run.end = end;
            if self.run.len() > target {
                self.run.start = end + 1 - target;
            }
        } else if slot + 1 == self.run.start {
            let mut start = slot;
            while start > self.min && slots.contains(start - 1) {
                start -= 1;
            }
            self.run.start = start;
            if self.run.len() > target {
                self.run.end = start + target - 1;
            }
        } else if let Some(run) = slots.longest_run(target) {
            debug!(
                "gap at slot {}, best run now [{}, {}] of {} slots in [{}, {}]",
                slot,
                run.start,
                run.end,
                run.len(),
                self.min,
                self.max
            );
            self.run = run;
        }
    }
}

/// Builds physically contiguous regions from independently allocated chunks.
///
/// # Examples
///
/// ```ignore
/// let mut builder = RegionBuilder::new(&mut allocator);
/// let region = builder.build(NodeId(0), 256)?;
/// assert_eq!(region.len(), 256);
/// ```
pub struct RegionBuilder<A> {
    allocator: A,
    slot_limit: usize,
    progress: Option<MultiProgress>,
}

impl<A: ChunkAllocator> RegionBuilder<A> {
    /// Creates a builder drawing chunks from `allocator`.
    pub fn new(allocator: A) -> Self {
        RegionBuilder {
            allocator,
            slot_limit: DEFAULT_SLOT_LIMIT,
            progress: None,
        }
    }

    /// Sets the number of slots in the address table.
    ///
    /// Chunks that map at or beyond this slot are an internal-consistency fault.
    pub fn slot_limit(mut self, slot_limit: usize) -> Self {
        self.slot_limit = slot_limit;
        self
    }

    /// Shows a per-node progress bar while searching.
    pub fn progress(mut self, progress: Option<MultiProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Allocates chunks on `node` until `target` of them are physically adjacent.
    ///
    /// On success the returned region holds exactly `target` chunks and no other
    /// chunk is held. On any error no chunk is held.
    ///
    /// # Errors
    ///
    /// * [`ReserveError::Exhausted`] if the allocator fails before a run forms.
    /// * [`ReserveError::Fault`] if a chunk maps to slot 0, beyond the slot table,
    ///   or onto a slot that is already filled.
    ///
    /// # Panics
    ///
    /// Panics if `target` is zero.
    pub fn build(&mut self, node: NodeId, target: usize) -> Result<Region, ReserveError> {
        assert!(target > 0, "a region needs at least one chunk");
        let chunk_size = self.allocator.chunk_size().bytes();
        let base = self.allocator.base_offset();
        let bar = self.progress.as_ref().map(|p| {
            p.add(
                ProgressBar::new(target as u64)
                    .with_style(ProgressStyle::named_bar(&format!("Building node {}", node))),
            )
        });

        let mut slots = Slots::new(self.slot_limit);
        let mut cursor: Option<Cursor> = None;
        let mut allocated = 0usize;
        let run = loop {
            let chunk = match self.allocator.allocate_chunk(node) {
                Ok(chunk) => chunk,
                Err(e) => {
                    error!(
                        "cannot allocate {} contiguous chunks at node {} after {} allocations",
                        target, node, allocated
                    );
                    self.release(slots.into_chunks());
                    return Err(ReserveError::Exhausted {
                        node,
                        chunks: target,
                        source: Box::new(e),
                    });
                }
            };
            allocated += 1;

            let slot = match slots.slot_of(chunk.phys(), base, chunk_size) {
                Ok(slot) => slot,
                Err(fault) => {
                    error!("chunk {:p} rejected at node {}: {}", chunk.phys(), node, fault);
                    self.allocator.free_chunk(chunk);
                    self.release(slots.into_chunks());
                    return Err(fault.into());
                }
            };
            trace!("node {}: chunk {:p} -> slot {}", node, chunk.phys(), slot);
            if let Err(chunk) = slots.insert(slot, chunk) {
                error!("slot {} handed out twice at node {}", slot, node);
                self.allocator.free_chunk(chunk);
                self.release(slots.into_chunks());
                return Err(Fault::DuplicateSlot(slot).into());
            }

            let cursor = cursor.get_or_insert_with(|| Cursor::new(slot));
            cursor.place(&slots, slot, target);
            if let Some(bar) = &bar {
                bar.set_position(cursor.run.len() as u64);
            }
            if cursor.run.len() == target {
                break cursor.run;
            }
        };

        let (inside, surplus) = slots.split(run);
        debug!(
            "node {}: run [{}, {}] found after {} allocations, releasing {} surplus chunks",
            node,
            run.start,
            run.end,
            allocated,
            surplus.len()
        );
        self.release(surplus);
        if let Some(bar) = bar {
            bar.finish();
        }
        Ok(Region::new(node, inside))
    }

    fn release(&mut self, chunks: impl IntoIterator<Item = Chunk>) {
        for chunk in chunks {
            self.allocator.free_chunk(chunk);
        }
    }
}

/// Builds one region of `target` chunks on `node`.
///
/// Convenience wrapper around [`RegionBuilder`] with the default slot table.
///
/// # Errors
///
/// See [`RegionBuilder::build`].
pub fn build_region<A: ChunkAllocator>(
    allocator: &mut A,
    node: NodeId,
    target: usize,
) -> Result<Region, ReserveError> {
    RegionBuilder::new(allocator).build(node, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{HPAGE_SIZE, Size};
    use std::collections::VecDeque;

    #[derive(Debug, thiserror::Error)]
    #[error("script exhausted")]
    struct Exhausted;

    /// Hands out chunks at pre-scripted slots.
    struct Script {
        slots: VecDeque<usize>,
        held: usize,
        freed: Vec<usize>,
    }

    impl Script {
        fn new(slots: &[usize]) -> Self {
            Script {
                slots: slots.iter().copied().collect(),
                held: 0,
                freed: vec![],
            }
        }
    }

    impl ChunkAllocator for Script {
        type Error = Exhausted;

        fn chunk_size(&self) -> Size {
            Size::B(HPAGE_SIZE)
        }

        fn allocate_chunk(&mut self, node: NodeId) -> Result<Chunk, Exhausted> {
            let slot = self.slots.pop_front().ok_or(Exhausted)?;
            self.held += 1;
            let phys = PhysAddr::new(slot * HPAGE_SIZE);
            Ok(Chunk::new(node, phys, phys.as_usize() as *mut u8))
        }

        fn free_chunk(&mut self, chunk: Chunk) {
            self.held -= 1;
            self.freed.push(chunk.phys().as_usize() / HPAGE_SIZE);
        }

        fn map_region(&mut self, region: &mut Region) -> Result<*mut u8, Exhausted> {
            Ok(region.chunks()[0].ptr())
        }
    }

    fn slots_of(region: &Region) -> Vec<usize> {
        region
            .chunks()
            .iter()
            .map(|c| c.phys().as_usize() / HPAGE_SIZE)
            .collect()
    }

    #[test]
    fn test_forward_extension_fills_gap() {
        let mut script = Script::new(&[5, 6, 8, 7]);
        let region = build_region(&mut script, NodeId(0), 4).expect("region");
        assert_eq!(slots_of(&region), vec![5, 6, 7, 8]);
        assert_eq!(script.held, 4);
        assert!(script.freed.is_empty());
    }

    #[test]
    fn test_overshoot_keeps_grown_edge() {
        let mut script = Script::new(&[5, 9, 7, 6, 8]);
        let region = build_region(&mut script, NodeId(0), 4).expect("region");
        assert_eq!(slots_of(&region), vec![6, 7, 8, 9]);
        assert_eq!(region.base_phys(), Some(PhysAddr::new(6 * HPAGE_SIZE)));
        assert_eq!(script.freed, vec![5]);
        assert_eq!(script.held, 4);
    }

    #[test]
    fn test_backward_extension() {
        let mut script = Script::new(&[10, 9, 8, 7]);
        let region = build_region(&mut script, NodeId(1), 3).expect("region");
        assert_eq!(slots_of(&region), vec![8, 9, 10]);
        assert_eq!(region.node(), NodeId(1));
        // slot 7 was never requested
        assert_eq!(script.slots, VecDeque::from(vec![7]));
    }

    #[test]
    fn test_backward_overshoot_keeps_low_end() {
        let mut script = Script::new(&[5, 7, 8, 6]);
        let region = build_region(&mut script, NodeId(0), 3).expect("region");
        assert_eq!(slots_of(&region), vec![5, 6, 7]);
        assert_eq!(script.freed, vec![8]);
    }

    #[test]
    fn test_rescan_selects_distant_run() {
        let mut script = Script::new(&[10, 11, 12, 2, 3, 5, 4]);
        let region = build_region(&mut script, NodeId(0), 4).expect("region");
        assert_eq!(slots_of(&region), vec![2, 3, 4, 5]);
        script.freed.sort();
        assert_eq!(script.freed, vec![10, 11, 12]);
        assert_eq!(script.held, 4);
    }

    #[test]
    fn test_single_chunk_target() {
        let mut script = Script::new(&[42, 43]);
        let region = build_region(&mut script, NodeId(0), 1).expect("region");
        assert_eq!(slots_of(&region), vec![42]);
        assert_eq!(script.held, 1);
    }

    #[test]
    fn test_exhaustion_releases_everything() {
        let mut script = Script::new(&[5, 7, 9]);
        let err = build_region(&mut script, NodeId(2), 2).unwrap_err();
        assert!(matches!(
            err,
            ReserveError::Exhausted {
                node: NodeId(2),
                chunks: 2,
                ..
            }
        ));
        assert_eq!(script.held, 0);
        assert_eq!(script.freed.len(), 3);
    }

    #[test]
    fn test_reserved_slot_is_fault() {
        let mut script = Script::new(&[3, 0]);
        let err = build_region(&mut script, NodeId(0), 2).unwrap_err();
        assert_eq!(err.as_fault(), Some(&Fault::ReservedSlot));
        assert_eq!(script.held, 0);
    }

    #[test]
    fn test_slot_out_of_range_is_fault() {
        let mut script = Script::new(&[3, 20]);
        let err = RegionBuilder::new(&mut script)
            .slot_limit(16)
            .build(NodeId(0), 2)
            .unwrap_err();
        assert_eq!(
            err.as_fault(),
            Some(&Fault::SlotOutOfRange {
                slot: 20,
                limit: 16
            })
        );
        assert_eq!(script.held, 0);
    }

    #[test]
    fn test_duplicate_slot_is_fault() {
        let mut script = Script::new(&[3, 5, 3]);
        let err = build_region(&mut script, NodeId(0), 2).unwrap_err();
        assert_eq!(err.as_fault(), Some(&Fault::DuplicateSlot(3)));
        assert_eq!(script.held, 0);
    }

    #[test]
    fn test_longest_run_prefers_earliest() {
        let mut slots = Slots::new(64);
        for slot in [2, 3, 7, 8, 20] {
            let phys = PhysAddr::new(slot * HPAGE_SIZE);
            slots
                .insert(slot, Chunk::new(NodeId(0), phys, std::ptr::null_mut()))
                .expect("free slot");
        }
        assert_eq!(slots.longest_run(4), Some(Span { start: 2, end: 3 }));
        assert_eq!(slots.longest_run(2), Some(Span { start: 2, end: 3 }));
        assert_eq!(slots.longest_run(1), Some(Span::single(2)));
    }
}
