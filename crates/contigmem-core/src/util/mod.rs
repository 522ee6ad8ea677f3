//! Utility types and helpers shared by the contigmem crates.
//!
//! - [`Size`] - Memory size representation
//! - Constants for page arithmetic ([`PAGE_SIZE`], [`PAGE_SHIFT`], ...)
//! - [`NamedProgress`] - Labelled progress bar styles
//! - [`numa`] - Thin wrappers around the NUMA memory policy syscalls

mod constants;
mod named_progress;
pub mod numa;
mod size;

pub use self::constants::*;
pub use self::named_progress::NamedProgress;
pub use self::size::Size;

/// Converts a byte count into the number of 4 KB pages it spans.
///
/// # Examples
///
/// ```
/// use contigmem_core::util::pages_in;
///
/// assert_eq!(pages_in(8192), 2);
/// assert_eq!(pages_in(8193), 3);
/// ```
pub const fn pages_in(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}
