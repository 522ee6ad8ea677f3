//! # Contigmem Core
//!
//! `contigmem-core` reserves one large contiguous memory region per NUMA node at
//! startup. It is built around a single allocation trait and a reservation service
//! that owns everything it hands out.
//!
//! ## Architecture Overview
//!
//! - [`allocator::ChunkAllocator`] - Defines how fixed-size, physically contiguous
//!   chunks are obtained from a node. Implementations live in separate crates
//!   (`contigmem-hugepage` for HugeTLB pages, `contigmem-dummy` for simulation).
//!
//! - [`region::RegionBuilder`] - Greedily allocates chunks until a physically
//!   contiguous run of the requested length exists, then gives the surplus back.
//!
//! - [`fallback::VirtualReserver`] - Reserves a virtually contiguous area per node
//!   when physical contiguity could not be achieved on every node.
//!
//! - [`mapping::MappingTable`] - One [`mapping::NodeMapping`] per possible node,
//!   queried by consumers once reservation has finished.
//!
//! - [`Reserver`] - The service object that runs both reservation phases and owns
//!   the resulting memory until [`Reserver::release`].
//!
//! ## Platform Support
//!
//! The real allocators target x86_64 Linux with HugeTLB pages configured and access
//! to `/proc/self/pagemap` (root). Everything in this crate except
//! [`fallback::MmapReserver`] and [`memory::PageMap`] is platform independent and
//! driven by the simulated allocators in tests.

#![warn(missing_docs)]

pub mod allocator;
pub mod config;
mod error;
pub mod fallback;
pub mod mapping;
pub mod memory;
pub mod region;
mod reserve;
pub mod topology;
pub mod util;

pub use crate::error::{Fault, MappingError, ReserveError};
pub use crate::reserve::{Coverage, Reserver};
