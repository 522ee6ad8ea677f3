//! Per-node mapping table.
//!
//! The table has one [`NodeMapping`] per possible node. An entry is zero until a
//! reservation for the node completes and is immutable afterwards. Consumers query
//! it with [`MappingTable::get`] once reservation is over.

use serde::Serialize;

use crate::error::{Fault, MappingError};
use crate::fallback::VirtualArea;
use crate::region::Region;
use crate::topology::NodeId;

/// Base address and size of one node's reserved memory.
///
/// The zero value means "unmapped".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NodeMapping {
    /// Virtual base address
    pub addr: usize,
    /// Number of 4KB pages
    pub pages: usize,
}

impl NodeMapping {
    /// Whether this entry describes reserved memory.
    pub fn is_mapped(&self) -> bool {
        self.addr != 0
    }

    /// Base address as a pointer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }
}

/// What backs a node mapping.
#[derive(Debug)]
pub enum Backing {
    /// Physically contiguous chunks
    Physical(Region),
    /// Virtually contiguous fallback area
    Virtual(VirtualArea),
}

#[derive(Debug, Default)]
struct Entry {
    mapping: NodeMapping,
    backing: Option<Backing>,
}

/// Table of node mappings, indexed by node id.
#[derive(Debug)]
pub struct MappingTable {
    entries: Vec<Entry>,
}

impl MappingTable {
    /// Creates an empty table with `nodes` slots.
    pub fn new(nodes: usize) -> Self {
        MappingTable {
            entries: (0..nodes).map(|_| Entry::default()).collect(),
        }
    }

    /// Returns the mapping of `node`.
    ///
    /// # Errors
    ///
    /// * [`MappingError::NotFound`] if no reservation completed for the node.
    /// * [`MappingError::NoSuchNode`] if the node is outside the table.
    pub fn get(&self, node: NodeId) -> Result<&NodeMapping, MappingError> {
        let entry = self
            .entries
            .get(node.index())
            .ok_or(MappingError::NoSuchNode(node))?;
        if !entry.mapping.is_mapped() {
            return Err(MappingError::NotFound(node));
        }
        Ok(&entry.mapping)
    }

    /// Whether `node` has a mapping.
    pub fn is_mapped(&self, node: NodeId) -> bool {
        self.get(node).is_ok()
    }

    /// Counts how many of `nodes` have a mapping.
    pub fn count_mapped(&self, nodes: &[NodeId]) -> usize {
        nodes.iter().filter(|&&n| self.is_mapped(n)).count()
    }

    /// Installed mappings in node order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &NodeMapping)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.mapping.is_mapped())
            .map(|(i, e)| (NodeId(i), &e.mapping))
    }

    /// Installs the mapping of `node` together with the memory backing it.
    ///
    /// # Errors
    ///
    /// Returns a [`Fault`] if the node is outside the table or already mapped. The
    /// backing is handed back so the caller can release it.
    pub(crate) fn install(
        &mut self,
        node: NodeId,
        mapping: NodeMapping,
        backing: Backing,
    ) -> Result<(), (Fault, Backing)> {
        let Some(entry) = self.entries.get_mut(node.index()) else {
            return Err((Fault::NodeOutOfRange(node), backing));
        };
        if entry.mapping.is_mapped() {
            return Err((Fault::MappingOverwrite(node), backing));
        }
        entry.mapping = mapping;
        entry.backing = Some(backing);
        Ok(())
    }

    /// Empties the table, returning every backing that was installed.
    pub(crate) fn drain(&mut self) -> Vec<(NodeId, Backing)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, e)| {
                e.mapping = NodeMapping::default();
                e.backing.take().map(|b| (NodeId(i), b))
            })
            .collect()
    }
}

impl Serialize for MappingTable {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        for (node, mapping) in self.iter() {
            map.serialize_entry(&node.index(), mapping)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Never released, so the pointer is only a label.
    fn area(addr: usize) -> Backing {
        Backing::Virtual(unsafe { VirtualArea::from_raw_parts(NodeId(0), addr as *mut u8, 4096) })
    }

    #[test]
    fn test_lookup_miss() {
        let table = MappingTable::new(2);
        assert_eq!(table.get(NodeId(1)), Err(MappingError::NotFound(NodeId(1))));
        assert_eq!(table.get(NodeId(2)), Err(MappingError::NoSuchNode(NodeId(2))));
    }

    #[test]
    fn test_install_is_immutable() {
        let mut table = MappingTable::new(2);
        let mapping = NodeMapping {
            addr: 0x7f00_0000_0000,
            pages: 8192,
        };
        table
            .install(NodeId(1), mapping, area(mapping.addr))
            .map_err(|(f, _)| f)
            .expect("first install");
        assert_eq!(table.get(NodeId(1)), Ok(&mapping));

        let (fault, _) = table
            .install(NodeId(1), mapping, area(1))
            .expect_err("second install");
        assert_eq!(fault, Fault::MappingOverwrite(NodeId(1)));
        let (fault, _) = table
            .install(NodeId(9), mapping, area(1))
            .expect_err("outside table");
        assert_eq!(fault, Fault::NodeOutOfRange(NodeId(9)));
        assert_eq!(table.count_mapped(&[NodeId(0), NodeId(1)]), 1);
    }

    #[test]
    fn test_drain_resets_table() {
        let mut table = MappingTable::new(3);
        for node in [0, 2] {
            let mapping = NodeMapping {
                addr: 0x1000 * (node + 1),
                pages: 1,
            };
            table
                .install(NodeId(node), mapping, area(mapping.addr))
                .map_err(|(f, _)| f)
                .expect("install");
        }
        let drained = table.drain();
        assert_eq!(
            drained.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            vec![NodeId(0), NodeId(2)]
        );
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn test_serialize_only_mapped() -> anyhow::Result<()> {
        let mut table = MappingTable::new(2);
        let mapping = NodeMapping {
            addr: 4096,
            pages: 2,
        };
        table
            .install(NodeId(1), mapping, area(4096))
            .map_err(|(f, _)| f)?;
        let json = serde_json::to_string(&table)?;
        assert_eq!(json, r#"{"1":{"addr":4096,"pages":2}}"#);
        Ok(())
    }
}
