//! Chunk allocation.
//!
//! This module defines the [`ChunkAllocator`] trait, the leaf dependency of the
//! region builder. A chunk is one fixed-size, physically contiguous, zeroed block
//! bound to a node.

use crate::memory::PhysAddr;
use crate::region::Region;
use crate::topology::NodeId;
use crate::util::Size;

/// One fixed-size, physically contiguous block of node-local memory.
///
/// Chunks are identified by their physical base address. The virtual pointer is
/// where the chunk is currently mapped in this process; it may change when a
/// region is made addressable as one range (see [`ChunkAllocator::map_region`]).
#[derive(Debug, PartialEq, Eq)]
pub struct Chunk {
    node: NodeId,
    phys: PhysAddr,
    ptr: *mut u8,
}

unsafe impl Send for Chunk {}

impl Chunk {
    /// Creates a chunk record.
    ///
    /// Allocator implementations call this once per successful allocation.
    pub fn new(node: NodeId, phys: PhysAddr, ptr: *mut u8) -> Self {
        Chunk { node, phys, ptr }
    }

    /// Node the chunk was allocated on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Physical base address.
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Current virtual address.
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Records that the chunk has been moved to a new virtual address.
    pub fn relocate(&mut self, ptr: *mut u8) {
        self.ptr = ptr;
    }
}

/// Trait for node-local allocators of fixed-size physically contiguous chunks.
///
/// Implementors wrap whatever provides physically contiguous memory on a node:
/// HugeTLB pages, a kernel module, or a simulation for tests.
///
/// # Associated Types
///
/// * `Error` - The error type returned by allocation operations.
///
/// # Required Methods
///
/// * [`chunk_size()`](ChunkAllocator::chunk_size) - Size of every chunk
/// * [`allocate_chunk()`](ChunkAllocator::allocate_chunk) - Allocates one chunk
/// * [`free_chunk()`](ChunkAllocator::free_chunk) - Releases one chunk
/// * [`map_region()`](ChunkAllocator::map_region) - Makes a contiguous run addressable
pub trait ChunkAllocator {
    /// The error type returned by allocation operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Size of every chunk handed out by this allocator.
    fn chunk_size(&self) -> Size;

    /// Physical address that corresponds to slot 0 of the region builder's table.
    fn base_offset(&self) -> PhysAddr {
        PhysAddr::new(0)
    }

    /// Allocates one zeroed chunk bound to `node`.
    ///
    /// There are no retries: a failure is reported immediately and is expected
    /// under memory pressure.
    ///
    /// # Errors
    ///
    /// Returns an error if the node has no chunk available.
    fn allocate_chunk(&mut self, node: NodeId) -> Result<Chunk, Self::Error>;

    /// Releases a chunk unconditionally.
    fn free_chunk(&mut self, chunk: Chunk);

    /// Makes the physically contiguous run of `region` addressable as one virtual
    /// range and returns its base pointer.
    ///
    /// Implementations may move chunks and must update them with
    /// [`Chunk::relocate`]. On error, the region must still be releasable with
    /// [`free_region`](ChunkAllocator::free_region).
    ///
    /// # Errors
    ///
    /// Returns an error if a virtually contiguous view cannot be established.
    fn map_region(&mut self, region: &mut Region) -> Result<*mut u8, Self::Error>;

    /// Releases every chunk of `region`.
    fn free_region(&mut self, region: Region) {
        for chunk in region.into_chunks() {
            self.free_chunk(chunk);
        }
    }
}

impl<A: ChunkAllocator + ?Sized> ChunkAllocator for &mut A {
    type Error = A::Error;

    fn chunk_size(&self) -> Size {
        (**self).chunk_size()
    }

    fn base_offset(&self) -> PhysAddr {
        (**self).base_offset()
    }

    fn allocate_chunk(&mut self, node: NodeId) -> Result<Chunk, Self::Error> {
        (**self).allocate_chunk(node)
    }

    fn free_chunk(&mut self, chunk: Chunk) {
        (**self).free_chunk(chunk)
    }

    fn map_region(&mut self, region: &mut Region) -> Result<*mut u8, Self::Error> {
        (**self).map_region(region)
    }

    fn free_region(&mut self, region: Region) {
        (**self).free_region(region)
    }
}
