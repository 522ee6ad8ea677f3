//! NUMA node topology.
//!
//! Node lists are read from sysfs in the kernel's list format (`0-3,5`). Machines
//! without `/sys/devices/system/node` are treated as a single node 0.

use std::fs;
use std::io;
use std::path::Path;

use log::{debug, warn};
use serde::Serialize;

const NODE_SYSFS: &str = "/sys/devices/system/node";

/// Identifier of a memory-affinity domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl NodeId {
    /// Returns the node id as an index.
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for NodeId {
    fn from(value: usize) -> Self {
        NodeId(value)
    }
}

/// The set of online nodes and the number of possible node slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    online: Vec<NodeId>,
    possible: usize,
}

impl Topology {
    /// Creates a topology from an explicit list of online nodes.
    ///
    /// `possible` is raised to cover the highest online node id if needed.
    pub fn new(mut online: Vec<NodeId>, possible: usize) -> Self {
        online.sort();
        online.dedup();
        let needed = online.last().map_or(0, |n| n.index() + 1);
        Topology {
            online,
            possible: possible.max(needed),
        }
    }

    /// A single online node 0.
    pub fn single() -> Self {
        Topology::new(vec![NodeId(0)], 1)
    }

    /// Reads the topology of the running system.
    ///
    /// # Errors
    ///
    /// Returns an error if the sysfs node lists exist but cannot be read or parsed.
    pub fn detect() -> io::Result<Self> {
        Self::from_sysfs(Path::new(NODE_SYSFS))
    }

    /// Reads the topology from a sysfs-like directory containing `online` and `possible`.
    ///
    /// # Errors
    ///
    /// Returns an error if a list file cannot be read or parsed.
    pub fn from_sysfs(dir: &Path) -> io::Result<Self> {
        if !dir.exists() {
            warn!(
                "{} does not exist, assuming a single memory node",
                dir.display()
            );
            return Ok(Topology::single());
        }
        let online = parse_node_list(fs::read_to_string(dir.join("online"))?.trim())?;
        let possible = match fs::read_to_string(dir.join("possible")) {
            Ok(list) => parse_node_list(list.trim())?
                .last()
                .map_or(0, |n| n.index() + 1),
            Err(e) => {
                debug!("no possible node list ({}), sizing by online nodes", e);
                0
            }
        };
        Ok(Topology::new(online, possible))
    }

    /// Online nodes in ascending order.
    pub fn online(&self) -> &[NodeId] {
        &self.online
    }

    /// Number of node slots a per-node table must provide.
    pub fn possible(&self) -> usize {
        self.possible
    }
}

/// Parses a kernel node list such as `0-3,5,7-8`.
///
/// # Errors
///
/// Returns [`io::ErrorKind::InvalidData`] for malformed lists.
pub fn parse_node_list(list: &str) -> io::Result<Vec<NodeId>> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, format!("bad node list {list:?}"));
    let mut nodes = vec![];
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (first, last) = match part.split_once('-') {
            Some((a, b)) => (a.parse::<usize>(), b.parse::<usize>()),
            None => (part.parse::<usize>(), part.parse::<usize>()),
        };
        let (first, last) = (first.map_err(|_| invalid())?, last.map_err(|_| invalid())?);
        if first > last {
            return Err(invalid());
        }
        nodes.extend((first..=last).map(NodeId));
    }
    Ok(nodes)
}
