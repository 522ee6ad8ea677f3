//! Physical address handling.
//!
//! - [`PhysAddr`]: newtype for physical addresses reported by the kernel.
//! - [`PageMap`]: resolves virtual addresses of the current process to physical
//!   addresses through `/proc/self/pagemap`.
mod phys;

pub use self::phys::{PageMap, PageMapError, PhysAddr};
