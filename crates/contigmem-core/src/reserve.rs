//! The reservation service.
//!
//! [`Reserver`] first tries to give every online node a physically contiguous
//! region. If any node fails, everything reserved so far is released and every
//! node gets a virtually contiguous area instead. Both phases are all-or-none.

use indicatif::MultiProgress;
use log::{error, info, warn};
use serde::Serialize;

use crate::allocator::ChunkAllocator;
use crate::config::ReserveConfig;
use crate::error::{Fault, MappingError, ReserveError};
use crate::fallback::{MmapReserver, VirtualReserver};
use crate::mapping::{Backing, MappingTable, NodeMapping};
use crate::region::RegionBuilder;
use crate::topology::{NodeId, Topology};
use crate::util::{Size, pages_in};

/// How the online nodes ended up covered after [`Reserver::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Coverage {
    /// Every online node has a physically contiguous region
    Physical,
    /// Every online node has a virtually contiguous fallback area
    Virtual,
    /// Neither phase succeeded; no node is mapped
    None,
}

/// The reservation service.
///
/// Owns the chunk allocator, the fallback reserver and every piece of memory they
/// hand out. Memory stays reserved until [`release`](Reserver::release) or drop.
///
/// # Examples
///
/// ```ignore
/// let mut reserver = Reserver::new(config, Topology::detect()?, HugetlbChunks::new()?, MmapReserver::default());
/// match reserver.reserve()? {
///     Coverage::None => warn!("running without reserved memory"),
///     _ => {}
/// }
/// let mapping = reserver.get_mapping(NodeId(0))?;
/// ```
pub struct Reserver<A: ChunkAllocator, V: VirtualReserver = MmapReserver> {
    config: ReserveConfig,
    topology: Topology,
    allocator: A,
    vmem: V,
    table: MappingTable,
    progress: Option<MultiProgress>,
}

impl<A: ChunkAllocator, V: VirtualReserver> Reserver<A, V> {
    /// Creates a service with an empty mapping table sized for every possible node.
    pub fn new(config: ReserveConfig, topology: Topology, allocator: A, vmem: V) -> Self {
        let table = MappingTable::new(topology.possible());
        Reserver {
            config,
            topology,
            allocator,
            vmem,
            table,
            progress: None,
        }
    }

    /// Shows per-node progress bars while building regions.
    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &ReserveConfig {
        &self.config
    }

    /// The node topology in use.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The chunk allocator.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The fallback reserver.
    pub fn vmem(&self) -> &V {
        &self.vmem
    }

    /// The mapping table.
    pub fn mappings(&self) -> &MappingTable {
        &self.table
    }

    /// Returns the mapping of `node`.
    ///
    /// # Errors
    ///
    /// See [`MappingTable::get`].
    pub fn get_mapping(&self, node: NodeId) -> Result<&NodeMapping, MappingError> {
        self.table.get(node)
    }

    /// Bytes reserved per node.
    pub fn bytes_per_node(&self) -> Size {
        self.config.order.bytes_per_node(self.allocator.chunk_size())
    }

    /// Builds one physically contiguous region on every online node.
    ///
    /// Either every online node ends up mapped, or none does: on the first node that
    /// fails, every region reserved so far is released and the table is emptied.
    ///
    /// # Errors
    ///
    /// * [`ReserveError::Exhausted`] or [`ReserveError::Unmappable`] if a node
    ///   cannot get its region.
    /// * [`ReserveError::Fault`] on an internal-consistency violation.
    pub fn reserve_physical_regions(&mut self) -> Result<(), ReserveError> {
        let target = self.config.chunks_per_node();
        let pages = pages_in(self.bytes_per_node().bytes());
        for node in self.topology.online().to_vec() {
            if let Err(e) = self.reserve_region(node, target, pages) {
                self.rollback();
                return Err(e);
            }
        }
        Ok(())
    }

    fn reserve_region(
        &mut self,
        node: NodeId,
        target: usize,
        pages: usize,
    ) -> Result<(), ReserveError> {
        let mut region = RegionBuilder::new(&mut self.allocator)
            .slot_limit(self.config.slot_limit)
            .progress(self.progress.clone())
            .build(node, target)?;
        let addr = match self.allocator.map_region(&mut region) {
            Ok(addr) => addr,
            Err(e) => {
                error!("cannot map contiguous region at node {}: {}", node, e);
                self.allocator.free_region(region);
                return Err(ReserveError::Unmappable {
                    node,
                    source: Box::new(e),
                });
            }
        };
        let mapping = NodeMapping {
            addr: addr as usize,
            pages,
        };
        let base = region.base_phys();
        self.install(node, mapping, Backing::Physical(region))?;
        info!(
            "allocated contiguous space {:p} {}MB at node {} (phys {:?})",
            addr,
            self.bytes_per_node().megabytes(),
            node,
            base
        );
        Ok(())
    }

    /// Reserves a virtually contiguous area on every online node, unless every
    /// online node is already mapped.
    ///
    /// # Errors
    ///
    /// * [`ReserveError::Fault`] with [`Fault::PartialCoverage`] if only some online
    ///   nodes are mapped.
    /// * [`ReserveError::VirtualExhausted`] if a node's area cannot be reserved. All
    ///   mappings are released and the table is emptied.
    pub fn reserve_virtual_fallback(&mut self) -> Result<(), ReserveError> {
        let online = self.topology.online().to_vec();
        let mapped = self.table.count_mapped(&online);
        if mapped == online.len() {
            return Ok(());
        }
        if mapped != 0 {
            error!(
                "{} of {} online nodes are mapped before the virtual fallback",
                mapped,
                online.len()
            );
            return Err(Fault::PartialCoverage {
                mapped,
                online: online.len(),
            }
            .into());
        }

        let size = self.bytes_per_node();
        let pages = pages_in(size.bytes());
        for node in online {
            warn!("allocating {} pages of virtual memory at node {}", pages, node);
            let area = match self.vmem.reserve_virtual(node, size) {
                Ok(area) => area,
                Err(e) => {
                    error!("cannot reserve {} of virtual memory at node {}: {}", size, node, e);
                    self.rollback();
                    return Err(ReserveError::VirtualExhausted {
                        node,
                        size,
                        source: Box::new(e),
                    });
                }
            };
            let mapping = NodeMapping {
                addr: area.ptr() as usize,
                pages,
            };
            if let Err(e) = self.install(node, mapping, Backing::Virtual(area)) {
                self.rollback();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Runs the physical phase and, if it did not cover every node, the virtual
    /// fallback.
    ///
    /// Exhaustion in either phase is logged and reflected in the returned
    /// [`Coverage`].
    ///
    /// # Errors
    ///
    /// Returns the [`Fault`] if either phase detects an internal-consistency
    /// violation. The table is empty in that case.
    pub fn reserve(&mut self) -> Result<Coverage, Fault> {
        match self.reserve_physical_regions() {
            Ok(()) => return Ok(Coverage::Physical),
            Err(ReserveError::Fault(fault)) => return Err(fault),
            Err(e) => warn!("physical reservation failed, falling back to virtual memory: {}", e),
        }
        match self.reserve_virtual_fallback() {
            Ok(()) => Ok(Coverage::Virtual),
            Err(ReserveError::Fault(fault)) => Err(fault),
            Err(e) => {
                error!("virtual reservation failed: {}", e);
                Ok(Coverage::None)
            }
        }
    }

    /// Releases every reservation and empties the table.
    pub fn release(&mut self) {
        self.rollback();
    }

    fn install(
        &mut self,
        node: NodeId,
        mapping: NodeMapping,
        backing: Backing,
    ) -> Result<(), ReserveError> {
        match self.table.install(node, mapping, backing) {
            Ok(()) => Ok(()),
            Err((fault, backing)) => {
                error!("cannot install mapping for node {}: {}", node, fault);
                self.release_backing(backing);
                Err(fault.into())
            }
        }
    }

    fn rollback(&mut self) {
        for (_, backing) in self.table.drain() {
            self.release_backing(backing);
        }
    }

    fn release_backing(&mut self, backing: Backing) {
        match backing {
            Backing::Physical(region) => self.allocator.free_region(region),
            Backing::Virtual(area) => self.vmem.release_virtual(area),
        }
    }
}

impl<A: ChunkAllocator, V: VirtualReserver> Drop for Reserver<A, V> {
    fn drop(&mut self) {
        self.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Chunk;
    use crate::config::ReservationOrder;
    use crate::fallback::VirtualArea;
    use crate::memory::PhysAddr;
    use crate::region::Region;
    use std::collections::{HashMap, VecDeque};

    const CHUNK: usize = 1 << 21;

    #[derive(Debug, thiserror::Error)]
    #[error("out of chunks")]
    struct OutOfChunks;

    /// Per-node slot scripts; every handed out chunk is tracked until freed.
    #[derive(Default)]
    struct Nodes {
        scripts: HashMap<NodeId, VecDeque<usize>>,
        held: usize,
        fail_map: bool,
    }

    impl Nodes {
        fn with(scripts: Vec<(usize, Vec<usize>)>) -> Self {
            Nodes {
                scripts: scripts
                    .into_iter()
                    .map(|(n, s)| (NodeId(n), VecDeque::from(s)))
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl ChunkAllocator for Nodes {
        type Error = OutOfChunks;

        fn chunk_size(&self) -> Size {
            Size::MB(2)
        }

        fn allocate_chunk(&mut self, node: NodeId) -> Result<Chunk, OutOfChunks> {
            let slot = self
                .scripts
                .get_mut(&node)
                .and_then(VecDeque::pop_front)
                .ok_or(OutOfChunks)?;
            self.held += 1;
            Ok(Chunk::new(
                node,
                PhysAddr::new(slot * CHUNK),
                (slot * CHUNK) as *mut u8,
            ))
        }

        fn free_chunk(&mut self, _chunk: Chunk) {
            self.held -= 1;
        }

        fn map_region(&mut self, region: &mut Region) -> Result<*mut u8, OutOfChunks> {
            if self.fail_map {
                return Err(OutOfChunks);
            }
            Ok(region.chunks()[0].ptr())
        }
    }

    /// Hands out labelled areas, failing on listed nodes.
    #[derive(Default)]
    struct Areas {
        fail: Vec<NodeId>,
        held: usize,
    }

    impl VirtualReserver for Areas {
        type Error = OutOfChunks;

        fn reserve_virtual(&mut self, node: NodeId, size: Size) -> Result<VirtualArea, OutOfChunks> {
            if self.fail.contains(&node) {
                return Err(OutOfChunks);
            }
            self.held += 1;
            let label = (node.index() + 1) << 40;
            Ok(unsafe { VirtualArea::from_raw_parts(node, label as *mut u8, size.bytes()) })
        }

        fn release_virtual(&mut self, _area: VirtualArea) {
            self.held -= 1;
        }
    }

    fn config() -> ReserveConfig {
        ReserveConfig {
            order: ReservationOrder::new(4),
            ..Default::default()
        }
    }

    fn two_nodes() -> Topology {
        Topology::new(vec![NodeId(0), NodeId(1)], 4)
    }

    fn run(base: usize) -> Vec<usize> {
        (base..base + 16).collect()
    }

    #[test]
    fn test_physical_all_nodes() {
        let scripts = vec![(0, run(10)), (1, run(100))];
        let mut r = Reserver::new(config(), two_nodes(), Nodes::with(scripts), Areas::default());
        assert_eq!(r.reserve(), Ok(Coverage::Physical));
        assert_eq!(r.allocator().held, 32);
        let m = r.get_mapping(NodeId(1)).expect("node 1 mapped");
        assert_eq!(m.addr, 100 * CHUNK);
        assert_eq!(m.pages, 16 * 512);
        assert_eq!(r.get_mapping(NodeId(2)), Err(MappingError::NotFound(NodeId(2))));
        assert_eq!(r.get_mapping(NodeId(4)), Err(MappingError::NoSuchNode(NodeId(4))));
        r.release();
        assert_eq!(r.allocator().held, 0);
        assert_eq!(r.mappings().iter().count(), 0);
    }

    #[test]
    fn test_falls_back_when_one_node_fails() {
        let scripts = vec![(0, run(10)), (1, vec![3, 5, 7])];
        let mut r = Reserver::new(config(), two_nodes(), Nodes::with(scripts), Areas::default());
        assert_eq!(r.reserve(), Ok(Coverage::Virtual));
        assert_eq!(r.allocator().held, 0);
        assert_eq!(r.vmem().held, 2);
        assert_eq!(r.get_mapping(NodeId(0)).map(|m| m.addr), Ok(1 << 40));
        assert_eq!(r.get_mapping(NodeId(1)).map(|m| m.pages), Ok(16 * 512));
    }

    #[test]
    fn test_unmappable_region_rolls_back() {
        let scripts = vec![(0, run(10)), (1, run(100))];
        let mut nodes = Nodes::with(scripts);
        nodes.fail_map = true;
        let mut r = Reserver::new(config(), two_nodes(), nodes, Areas::default());
        let err = r.reserve_physical_regions().expect_err("map fails");
        assert!(matches!(err, ReserveError::Unmappable { node: NodeId(0), .. }));
        assert_eq!(r.allocator().held, 0);
    }

    #[test]
    fn test_fallback_failure_empties_table() {
        let areas = Areas {
            fail: vec![NodeId(1)],
            held: 0,
        };
        let mut r = Reserver::new(config(), two_nodes(), Nodes::default(), areas);
        assert_eq!(r.reserve(), Ok(Coverage::None));
        assert_eq!(r.vmem().held, 0);
        assert_eq!(r.mappings().iter().count(), 0);
    }

    #[test]
    fn test_fallback_is_noop_when_covered() {
        let scripts = vec![(0, run(10)), (1, run(100))];
        let mut r = Reserver::new(config(), two_nodes(), Nodes::with(scripts), Areas::default());
        r.reserve_physical_regions().expect("physical");
        r.reserve_virtual_fallback().expect("no-op");
        assert_eq!(r.vmem().held, 0);
    }

    #[test]
    fn test_partial_coverage_is_fault() {
        let mut r = Reserver::new(config(), two_nodes(), Nodes::default(), Areas::default());
        let area = unsafe { VirtualArea::from_raw_parts(NodeId(0), 0x1000 as *mut u8, 4096) };
        r.vmem.held += 1;
        r.install(
            NodeId(0),
            NodeMapping {
                addr: 0x1000,
                pages: 1,
            },
            Backing::Virtual(area),
        )
        .expect("install");
        let err = r.reserve_virtual_fallback().expect_err("partial");
        assert_eq!(
            err.as_fault(),
            Some(&Fault::PartialCoverage {
                mapped: 1,
                online: 2
            })
        );
    }

    #[test]
    fn test_fault_surfaces_from_reserve() {
        let scripts = vec![(0, vec![10, 0])];
        let mut r = Reserver::new(config(), Topology::single(), Nodes::with(scripts), Areas::default());
        assert_eq!(r.reserve(), Err(Fault::ReservedSlot));
        assert_eq!(r.allocator().held, 0);
        assert_eq!(r.vmem().held, 0);
    }

    #[test]
    fn test_drop_releases() {
        let scripts = vec![(0, run(10))];
        let mut nodes = Nodes::with(scripts);
        {
            let mut r = Reserver::new(config(), Topology::single(), &mut nodes, Areas::default());
            assert_eq!(r.reserve(), Ok(Coverage::Physical));
        }
        assert_eq!(nodes.held, 0);
    }
}
