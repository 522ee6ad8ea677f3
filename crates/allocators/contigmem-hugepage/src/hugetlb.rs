use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read};
use std::ptr::null_mut;

use contigmem_core::allocator::{Chunk, ChunkAllocator};
use contigmem_core::memory::{PageMap, PageMapError};
use contigmem_core::region::Region;
use contigmem_core::topology::NodeId;
use contigmem_core::util::numa::{MPOL_BIND, MPOL_DEFAULT, node_of_page, set_mempolicy};
use contigmem_core::util::{HPAGE_SIZE, Size};
use lazy_static::lazy_static;
use libc::c_void;
use log::{debug, trace, warn};
use thiserror::Error;

use crate::buddy;

// https://www.kernel.org/doc/Documentation/vm/hugetlbpage.txt
//
// The output of "cat /proc/meminfo" will include lines like:
// ...
// HugePages_Total: uuu
// HugePages_Free:  vvv
// Hugepagesize:    yyy kB
const MEMINFO_PATH: &str = "/proc/meminfo";
const TOKEN: &str = "Hugepagesize:";

lazy_static! {
    /// Default HugeTLB page size of the running kernel, if it has one.
    pub static ref HUGEPAGE_SIZE: Option<usize> = {
        let buf = File::open(MEMINFO_PATH).map_or(String::new(), |mut f| {
            let mut s = String::new();
            let _ = f.read_to_string(&mut s);
            s
        });
        parse_hugepage_size(&buf)
    };
}

fn parse_hugepage_size(s: &str) -> Option<usize> {
    let line = s.lines().find(|l| l.starts_with(TOKEN))?;
    let mut parts = line.strip_prefix(TOKEN)?.split_whitespace();
    let size = parts.next()?.parse::<usize>().ok()?;
    let unit = match parts.next() {
        Some("kB") => 1024,
        Some(_) => return None,
        None => 1,
    };
    Some(size * unit).filter(|&s| s > 0)
}

/// Errors of the HugeTLB chunk allocator.
#[derive(Debug, Error)]
pub enum HugetlbError {
    /// The kernel reports no HugeTLB page size
    #[error("HugeTLB pages are not available (no Hugepagesize in /proc/meminfo)")]
    NotConfigured,
    /// The node-bound memory policy could not be set
    #[error("cannot bind memory policy to node {node}")]
    Policy {
        /// Node to bind to
        node: NodeId,
        /// OS error
        #[source]
        source: io::Error,
    },
    /// No free HugeTLB page on the node
    #[error("mmap of a HugeTLB page failed")]
    Mmap(#[source] io::Error),
    /// The page landed on another node
    #[error("HugeTLB page for node {expected} was placed on node {actual}")]
    WrongNode {
        /// Requested node
        expected: NodeId,
        /// Node reported by move_pages
        actual: NodeId,
    },
    /// The placement of the page could not be checked
    #[error("cannot query the node of a HugeTLB page")]
    Placement(#[source] io::Error),
    /// The physical address could not be resolved
    #[error(transparent)]
    PageMap(#[from] PageMapError),
    /// A region could not be moved into one virtual range
    #[error("cannot remap region at node {node}")]
    Remap {
        /// Node of the region
        node: NodeId,
        /// OS error
        #[source]
        source: io::Error,
    },
}

/// Chunk allocator handing out single HugeTLB pages.
///
/// Each chunk is one anonymous `MAP_HUGETLB` page, populated while the calling
/// thread is bound to the target node. Physical addresses come from
/// `/proc/self/pagemap`, so the process must run as root.
///
/// # Platform Requirements
///
/// - HugeTLB pages reserved via `vm.nr_hugepages` or the per-node sysfs knobs
/// - Linux 5.16 or newer for `mremap` of HugeTLB mappings
pub struct HugetlbChunks {
    page_size: usize,
    pagemap: PageMap,
    inspected: BTreeSet<NodeId>,
    held: usize,
}

impl HugetlbChunks {
    /// Creates the allocator for the kernel's default HugeTLB page size.
    ///
    /// # Errors
    ///
    /// * [`HugetlbError::NotConfigured`] if the kernel has no HugeTLB support.
    /// * [`HugetlbError::PageMap`] if the page map cannot be opened.
    pub fn new() -> Result<Self, HugetlbError> {
        let page_size = HUGEPAGE_SIZE.ok_or(HugetlbError::NotConfigured)?;
        if page_size != HPAGE_SIZE {
            warn!(
                "HugeTLB page size is {} bytes, expected {}",
                page_size, HPAGE_SIZE
            );
        }
        Ok(HugetlbChunks {
            page_size,
            pagemap: PageMap::new()?,
            inspected: BTreeSet::new(),
            held: 0,
        })
    }

    /// Number of pages currently held by callers.
    pub fn held(&self) -> usize {
        self.held
    }

    fn map_page(&self, node: NodeId) -> Result<*mut u8, HugetlbError> {
        set_mempolicy(MPOL_BIND, Some(node))
            .map_err(|source| HugetlbError::Policy { node, source })?;
        let p = unsafe {
            libc::mmap(
                null_mut(),
                self.page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        let mmap_error = io::Error::last_os_error();
        if let Err(e) = set_mempolicy(MPOL_DEFAULT, None) {
            warn!("cannot restore default memory policy: {}", e);
        }
        if p == libc::MAP_FAILED {
            return Err(HugetlbError::Mmap(mmap_error));
        }
        Ok(p as *mut u8)
    }

    fn unmap(&self, ptr: *mut u8, len: usize) {
        if len == 0 {
            return;
        }
        if unsafe { libc::munmap(ptr as *mut c_void, len) } != 0 {
            warn!(
                "munmap({:p}, {:#x}) failed: {}",
                ptr,
                len,
                io::Error::last_os_error()
            );
        }
    }
}

impl ChunkAllocator for HugetlbChunks {
    type Error = HugetlbError;

    fn chunk_size(&self) -> Size {
        Size::B(self.page_size)
    }

    fn allocate_chunk(&mut self, node: NodeId) -> Result<Chunk, HugetlbError> {
        if self.inspected.insert(node) {
            buddy::log_free_areas(node);
        }
        let p = self.map_page(node)?;
        match node_of_page(p) {
            Ok(actual) if actual == node => {}
            Ok(actual) => {
                self.unmap(p, self.page_size);
                return Err(HugetlbError::WrongNode {
                    expected: node,
                    actual,
                });
            }
            Err(e) => {
                self.unmap(p, self.page_size);
                return Err(HugetlbError::Placement(e));
            }
        }
        let phys = match self.pagemap.phys(p as usize) {
            Ok(phys) => phys,
            Err(e) => {
                self.unmap(p, self.page_size);
                return Err(e.into());
            }
        };
        trace!("node {}: HugeTLB page {:p} at {:p}", node, p, phys);
        self.held += 1;
        Ok(Chunk::new(node, phys, p))
    }

    fn free_chunk(&mut self, chunk: Chunk) {
        self.unmap(chunk.ptr(), self.page_size);
        self.held -= 1;
    }

    fn map_region(&mut self, region: &mut Region) -> Result<*mut u8, HugetlbError> {
        let node = region.node();
        let total = region.len() * self.page_size;
        // One spare page so the window can be aligned to the page size.
        let window_len = total + self.page_size;
        let window = unsafe {
            libc::mmap(
                null_mut(),
                window_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if window == libc::MAP_FAILED {
            return Err(HugetlbError::Remap {
                node,
                source: io::Error::last_os_error(),
            });
        }
        let window = window as usize;
        let base = window.next_multiple_of(self.page_size);
        let window_end = window + window_len;

        let page_size = self.page_size;
        let mut moved = 0;
        let mut failure = None;
        for chunk in region.chunks_mut() {
            let target = base + moved * page_size;
            let p = unsafe {
                libc::mremap(
                    chunk.ptr() as *mut c_void,
                    page_size,
                    page_size,
                    libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
                    target as *mut c_void,
                )
            };
            if p == libc::MAP_FAILED {
                failure = Some(io::Error::last_os_error());
                break;
            }
            chunk.relocate(p as *mut u8);
            moved += 1;
        }

        self.unmap(window as *mut u8, base - window);
        let used_end = base + moved * page_size;
        self.unmap(used_end as *mut u8, window_end - used_end);
        if let Some(source) = failure {
            return Err(HugetlbError::Remap { node, source });
        }
        debug!(
            "node {}: {} HugeTLB pages remapped to {:#x}",
            node,
            region.len(),
            base
        );
        Ok(base as *mut u8)
    }
}
