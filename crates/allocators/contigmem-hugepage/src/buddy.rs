use contigmem_core::topology::NodeId;
use contigmem_core::util::PAGE_SIZE;
use log::{info, warn};
use lpfs::proc::buddyinfo::buddyinfo;

/// Logs the buddy allocator's free areas of every zone on `node`.
///
/// Large reservations fail on fragmented nodes long before memory runs out, so the
/// free-area counts are worth having in the log next to a failure.
pub(crate) fn log_free_areas(node: NodeId) {
    let zones = match buddyinfo() {
        Ok(zones) => zones,
        Err(e) => {
            warn!("cannot read buddyinfo: {:?}", e);
            return;
        }
    };
    for zone in zones.iter().filter(|z| *z.node() as usize == node.index()) {
        let free = free_bytes(zone.free_areas());
        info!(
            "node {} zone {}: {}MB free, per order {:?}",
            node,
            zone.zone(),
            free >> 20,
            zone.free_areas()
        );
    }
}

fn free_bytes(free_areas: &[u64; 11]) -> usize {
    free_areas
        .iter()
        .enumerate()
        .map(|(order, &blocks)| blocks as usize * (PAGE_SIZE << order))
        .sum()
}
