use std::fmt::{Debug, Formatter};

use crate::util::{PAGE_MASK, PAGE_SHIFT};
use log::warn;
use pagemap2::VirtualMemoryArea;
use serde::Serialize;
use thiserror::Error;

/// Physical memory address.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(usize);

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("PhysAddr(0x{:02x})", self.0))
    }
}

impl std::fmt::Pointer for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl PhysAddr {
    /// Creates a new physical address.
    pub const fn new(addr: usize) -> Self {
        PhysAddr(addr)
    }

    /// Returns the address as a usize.
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    /// Distance in bytes from `base`, or `None` if `self` lies below it.
    pub fn offset_from(&self, base: PhysAddr) -> Option<usize> {
        self.0.checked_sub(base.0)
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> usize {
        addr.0
    }
}

/// Errors that can happen while reading the page map.
#[derive(Debug, Error)]
pub enum PageMapError {
    /// The underlying pagemap reader failed
    #[error(transparent)]
    PageMap(#[from] pagemap2::PageMapError),
    /// The page is not present, or its frame number is hidden from this process
    #[error("no physical frame for virtual address {0:#x} (page not present or not root)")]
    NotPresent(usize),
}

/// Virtual to physical address translator using Linux pagemap.
///
/// Reading frame numbers requires `CAP_SYS_ADMIN`; without it the kernel reports
/// zero, which is surfaced as [`PageMapError::NotPresent`].
pub struct PageMap {
    inner: pagemap2::PageMap,
}

impl PageMap {
    /// Opens the page map of the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if `/proc/self/pagemap` cannot be opened.
    pub fn new() -> Result<Self, PageMapError> {
        Ok(PageMap {
            inner: pagemap2::PageMap::new(std::process::id() as u64)?,
        })
    }

    /// Translates a virtual address to a physical address.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is unmapped, not present, or the frame number
    /// cannot be read.
    pub fn phys(&mut self, virt: usize) -> Result<PhysAddr, PageMapError> {
        let page = (virt & !PAGE_MASK) as u64;
        let area = VirtualMemoryArea::from((page, page + PAGE_MASK as u64));
        let entries = self.inner.pagemap_vma(&area)?;
        let Some(entry) = entries.first() else {
            return Err(PageMapError::NotPresent(virt));
        };
        let pfn = entry.pfn()?;
        if pfn == 0 {
            warn!("Got PFN 0 for virtual address {:#x}. Are we root?", virt);
            return Err(PageMapError::NotPresent(virt));
        }
        Ok(PhysAddr(((pfn as usize) << PAGE_SHIFT) | (virt & PAGE_MASK)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_from() {
        let base = PhysAddr::new(0x1000);
        assert_eq!(PhysAddr::new(0x3000).offset_from(base), Some(0x2000));
        assert_eq!(PhysAddr::new(0x0800).offset_from(base), None);
    }

    #[test]
    #[ignore]
    fn test_pagemap_resolves_stack_page() {
        let value = 42u64;
        let mut pagemap = PageMap::new().expect("open pagemap");
        let phys = pagemap
            .phys(&value as *const u64 as usize)
            .expect("needs root");
        assert_ne!(phys.as_usize(), 0);
    }
}
