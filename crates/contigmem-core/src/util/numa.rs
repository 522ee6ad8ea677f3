//! NUMA memory policy syscalls (`mbind`, `set_mempolicy`, `move_pages`).

use std::io;

use libc::{c_int, c_long, c_ulong};

use crate::topology::NodeId;

/// Restore the default (local) policy
pub const MPOL_DEFAULT: c_int = 0;
/// Prefer the given node, fall back to others
pub const MPOL_PREFERRED: c_int = 1;
/// Allocate strictly from the given node
pub const MPOL_BIND: c_int = 2;

const BITS_PER_WORD: usize = c_ulong::BITS as usize;

/// Builds a kernel nodemask with only `node` set.
pub fn node_mask(node: NodeId) -> Vec<c_ulong> {
    let mut mask = vec![0 as c_ulong; node.index() / BITS_PER_WORD + 1];
    mask[node.index() / BITS_PER_WORD] |= 1 << (node.index() % BITS_PER_WORD);
    mask
}

// The kernel reads `maxnode - 1` bits.
fn maxnode(mask: &[c_ulong]) -> c_ulong {
    (mask.len() * BITS_PER_WORD + 1) as c_ulong
}

fn check(ret: c_long) -> io::Result<()> {
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Applies memory policy `mode` for `node` to the mapping `[ptr, ptr + len)`.
///
/// # Errors
///
/// Returns the OS error if `mbind(2)` fails, e.g. on kernels without NUMA support.
pub fn mbind(ptr: *mut u8, len: usize, mode: c_int, node: NodeId) -> io::Result<()> {
    let mask = node_mask(node);
    check(unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr as *mut libc::c_void,
            len as c_ulong,
            mode,
            mask.as_ptr(),
            maxnode(&mask),
            0 as c_ulong,
        )
    })
}

/// Sets the calling thread's memory policy.
///
/// `None` with [`MPOL_DEFAULT`] restores the default policy.
///
/// # Errors
///
/// Returns the OS error if `set_mempolicy(2)` fails.
pub fn set_mempolicy(mode: c_int, node: Option<NodeId>) -> io::Result<()> {
    match node {
        Some(node) => {
            let mask = node_mask(node);
            check(unsafe {
                libc::syscall(libc::SYS_set_mempolicy, mode, mask.as_ptr(), maxnode(&mask))
            })
        }
        None => check(unsafe {
            libc::syscall(
                libc::SYS_set_mempolicy,
                mode,
                std::ptr::null::<c_ulong>(),
                0 as c_ulong,
            )
        }),
    }
}

/// Returns the node currently backing the page at `ptr`.
///
/// # Errors
///
/// Returns the OS error if `move_pages(2)` fails, or the negated per-page status
/// if the page is not present.
pub fn node_of_page(ptr: *mut u8) -> io::Result<NodeId> {
    let mut pages = [ptr as *mut libc::c_void];
    let mut status: [c_int; 1] = [-1];
    check(unsafe {
        libc::syscall(
            libc::SYS_move_pages,
            0 as c_int,
            1 as c_ulong,
            pages.as_mut_ptr(),
            std::ptr::null::<c_int>(),
            status.as_mut_ptr(),
            0 as c_int,
        )
    })?;
    if status[0] < 0 {
        return Err(io::Error::from_raw_os_error(-status[0]));
    }
    Ok(NodeId(status[0] as usize))
}
