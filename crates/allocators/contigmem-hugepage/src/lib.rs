//! HugeTLB chunk allocator.
//!
//! This crate provides [`HugetlbChunks`], a [`contigmem_core::allocator::ChunkAllocator`]
//! whose chunks are single HugeTLB pages bound to a NUMA node. Physically adjacent
//! pages are later moved next to each other in virtual memory with `mremap`, so a
//! region is addressable as one range.
//!
//! # Platform Requirements
//!
//! - x86_64 Linux with HugeTLB pages reserved on every node that should be covered
//! - Root, for physical addresses from `/proc/self/pagemap`

#![warn(missing_docs)]

mod buddy;
mod hugetlb;

pub use hugetlb::*;
