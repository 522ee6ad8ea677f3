//! # contigmem
//!
//! Boot-time infrastructure for a network-acceleration subsystem:
//!
//! - per-node reservation of one large contiguous memory region, built greedily
//!   out of physically contiguous chunks with a virtual-memory fallback
//!   ([`Reserver`], re-exported from `contigmem-core`)
//! - a lock-free registry of socket hooks whose removal waits for in-flight
//!   callers ([`hooks::HookRegistry`], from `contigmem-hooks`)
//!
//! Chunk allocators live in their own crates and are enabled by features:
//! `dummy` (simulated, default) and `hugepage` (HugeTLB pages).
//!
//! ```
//! use contigmem::config::{ReservationOrder, ReserveConfig};
//! use contigmem::dummy::ScriptedChunks;
//! use contigmem::fallback::MmapReserver;
//! use contigmem::topology::{NodeId, Topology};
//! use contigmem::{Coverage, Reserver};
//!
//! let config = ReserveConfig {
//!     order: ReservationOrder::new(4),
//!     ..Default::default()
//! };
//! let chunks = ScriptedChunks::default().script(NodeId(0), 1..=16);
//! let mut reserver = Reserver::new(config, Topology::single(), chunks, MmapReserver::default());
//! assert_eq!(reserver.reserve(), Ok(Coverage::Physical));
//! assert_eq!(reserver.get_mapping(NodeId(0)).map(|m| m.pages), Ok(16 * 512));
//! ```

pub use contigmem_core::*;
pub use contigmem_hooks as hooks;

#[cfg(feature = "dummy")]
pub use contigmem_dummy as dummy;
#[cfg(feature = "hugepage")]
pub use contigmem_hugepage as hugepage;
