//! Error types of the reservation service.

use crate::topology::NodeId;
use crate::util::Size;
use thiserror::Error;

/// Boxed source error of an allocator or reserver implementation.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Internal-consistency violations.
///
/// A fault means some other part of the system broke an invariant. The reservation
/// and registration paths stop on a fault instead of continuing with a best guess;
/// callers are expected to abort the affected subsystem.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Fault {
    /// A chunk address mapped outside the slot table
    #[error("chunk at slot {slot} is outside the slot table (limit {limit})")]
    SlotOutOfRange {
        /// Offending slot index
        slot: usize,
        /// Number of slots in the table
        limit: usize,
    },
    /// A chunk address mapped to the reserved slot 0 or below the base offset
    #[error("chunk maps to the reserved slot 0")]
    ReservedSlot,
    /// The allocator handed out a chunk that is already held
    #[error("slot {0} handed out twice by the chunk allocator")]
    DuplicateSlot(usize),
    /// Some, but not all, online nodes have a mapping
    #[error("{mapped} of {online} online nodes are mapped; refusing to mix reservation strategies")]
    PartialCoverage {
        /// Nodes that have a mapping
        mapped: usize,
        /// Online node count
        online: usize,
    },
    /// A non-zero mapping was about to be overwritten
    #[error("mapping for node {0} is already installed")]
    MappingOverwrite(NodeId),
    /// Node id outside the mapping table
    #[error("node {0} is outside the mapping table")]
    NodeOutOfRange(NodeId),
}

/// Errors returned by the reservation phases.
#[derive(Debug, Error)]
pub enum ReserveError {
    /// The chunk allocator ran dry before a contiguous run formed
    #[error("cannot allocate {chunks} contiguous chunks at node {node}")]
    Exhausted {
        /// Node being reserved
        node: NodeId,
        /// Requested run length
        chunks: usize,
        /// Allocator failure that ended the search
        #[source]
        source: BoxedError,
    },
    /// A contiguous run was found but could not be made addressable
    #[error("cannot map contiguous region at node {node}")]
    Unmappable {
        /// Node being reserved
        node: NodeId,
        /// Allocator failure
        #[source]
        source: BoxedError,
    },
    /// The virtual fallback could not reserve an area
    #[error("cannot reserve virtual area of {size} at node {node}")]
    VirtualExhausted {
        /// Node being reserved
        node: NodeId,
        /// Requested area size
        size: Size,
        /// Reserver failure
        #[source]
        source: BoxedError,
    },
    /// Internal-consistency violation
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl ReserveError {
    /// Returns the fault if this error is an internal-consistency violation.
    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            ReserveError::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Lookup failures of the mapping table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    /// Reservation never completed for this node
    #[error("no mapping for node {0}")]
    NotFound(NodeId),
    /// The node id is not covered by the table
    #[error("node {0} does not exist")]
    NoSuchNode(NodeId),
}
