//! Virtual fallback reservation.
//!
//! When physical contiguity cannot be reached on every node, each node instead gets
//! one virtually contiguous, zeroed area. [`MmapReserver`] provides it with an
//! anonymous mapping that prefers the node's memory.

use std::io;
use std::ptr::null_mut;

use log::{debug, warn};

use crate::topology::NodeId;
use crate::util::Size;
use crate::util::numa::{MPOL_PREFERRED, mbind};

/// A virtually contiguous area reserved for one node.
#[derive(Debug)]
pub struct VirtualArea {
    node: NodeId,
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for VirtualArea {}

impl VirtualArea {
    /// Wraps an area obtained by a [`VirtualReserver`].
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that the reserver creating this value owns
    /// and will release in [`VirtualReserver::release_virtual`].
    pub unsafe fn from_raw_parts(node: NodeId, ptr: *mut u8, len: usize) -> Self {
        VirtualArea { node, ptr, len }
    }

    /// Node the area prefers.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Base pointer.
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the area has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Reserves virtually contiguous per-node areas.
pub trait VirtualReserver {
    /// The error type returned by reservations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reserves a zeroed area of `size` bytes, preferably backed by `node`.
    ///
    /// # Errors
    ///
    /// Returns an error if no area of that size can be obtained.
    fn reserve_virtual(&mut self, node: NodeId, size: Size) -> Result<VirtualArea, Self::Error>;

    /// Releases an area obtained from this reserver.
    fn release_virtual(&mut self, area: VirtualArea);
}

impl<V: VirtualReserver + ?Sized> VirtualReserver for &mut V {
    type Error = V::Error;

    fn reserve_virtual(&mut self, node: NodeId, size: Size) -> Result<VirtualArea, Self::Error> {
        (**self).reserve_virtual(node, size)
    }

    fn release_virtual(&mut self, area: VirtualArea) {
        (**self).release_virtual(area)
    }
}

/// Virtual reserver backed by anonymous `mmap`.
///
/// The area is bound to its node with `MPOL_PREFERRED` before it is zeroed, so
/// pages land on the node when it has free memory and elsewhere otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapReserver {}

impl VirtualReserver for MmapReserver {
    type Error = io::Error;

    fn reserve_virtual(&mut self, node: NodeId, size: Size) -> Result<VirtualArea, io::Error> {
        let len = size.bytes();
        let p = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        if let Err(e) = mbind(p as *mut u8, len, MPOL_PREFERRED, node) {
            warn!("cannot prefer node {} for {:p}: {}", node, p, e);
        }
        unsafe { libc::memset(p, 0x00, len) };
        debug!("reserved {} at {:p} for node {}", size, p, node);
        Ok(VirtualArea {
            node,
            ptr: p as *mut u8,
            len,
        })
    }

    fn release_virtual(&mut self, area: VirtualArea) {
        let r = unsafe { libc::munmap(area.ptr as *mut libc::c_void, area.len) };
        if r != 0 {
            warn!(
                "munmap({:p}, {}) failed: {}",
                area.ptr,
                area.len,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::PAGE_SIZE;

    #[test]
    fn test_mmap_reserver_zeroed() {
        let mut reserver = MmapReserver::default();
        let area = reserver
            .reserve_virtual(NodeId(0), Size::KB(64))
            .expect("mmap");
        assert_eq!(area.len(), Size::KB(64).bytes());
        assert_eq!(area.node(), NodeId(0));
        let bytes = unsafe { std::slice::from_raw_parts(area.ptr(), area.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(area.ptr() as usize % PAGE_SIZE, 0);
        reserver.release_virtual(area);
    }
}
