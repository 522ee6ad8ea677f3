/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Huge page shift (21 bits) for 2MB pages on x86_64
pub const HPAGE_SHIFT: usize = 21;
/// Default huge page size (2 MB)
pub const HPAGE_SIZE: usize = 1 << HPAGE_SHIFT;

/// Number of slots in the region builder's address table.
///
/// Modern processors address up to 1.5TB of RAM; with 2MB chunks this covers 2TB.
/// Slot 0 is reserved, hence the extra entry.
pub const DEFAULT_SLOT_LIMIT: usize = 1024 * 1024 + 1;
