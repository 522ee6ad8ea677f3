/// Memory size representation supporting common units.
///
/// All units use binary (base-2) multipliers (1 KB = 1024 bytes).
///
/// # Examples
///
/// ```
/// use contigmem_core::util::Size;
///
/// let size = Size::MB(512);
/// assert_eq!(size.bytes(), 512 << 20);
/// assert_eq!(Size::MB(2).times(256).bytes(), Size::MB(512).bytes());
/// ```
#[derive(Clone, Copy, Debug)]
pub enum Size {
    /// Size in bytes
    B(usize),
    /// Size in kilobytes (1 KB = 1024 bytes)
    KB(usize),
    /// Size in megabytes (1 MB = 1024 KB)
    MB(usize),
    /// Size in gigabytes (1 GB = 1024 MB)
    GB(usize),
}

impl Size {
    /// Converts this size to bytes.
    pub const fn bytes(&self) -> usize {
        match self {
            Size::B(bytes) => *bytes,
            Size::KB(kb) => *kb * (1 << 10),
            Size::MB(mb) => *mb * (1 << 20),
            Size::GB(gb) => *gb * (1 << 30),
        }
    }

    /// Size of `count` consecutive items of this size, in bytes.
    pub const fn times(&self, count: usize) -> Size {
        Size::B(self.bytes() * count)
    }

    /// Whole megabytes, rounded down. Used for log output.
    pub const fn megabytes(&self) -> usize {
        self.bytes() >> 20
    }
}

impl PartialEq for Size {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl Eq for Size {}

/// Printed in the largest unit that divides the size evenly.
impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.bytes();
        let (value, unit) = [(30, "GB"), (20, "MB"), (10, "KB")]
            .into_iter()
            .find(|&(shift, _)| bytes != 0 && bytes % (1 << shift) == 0)
            .map_or((bytes, "B"), |(shift, unit)| (bytes >> shift, unit));
        write!(f, "{} {}", value, unit)
    }
}

#[cfg(test)]
mod tests {
    use crate::util::Size;

    #[test]
    fn size_conversions() {
        assert_eq!(Size::B(12).bytes(), 12);
        assert_eq!(Size::MB(12).bytes(), 12 * (1 << 20));
        assert_eq!(Size::GB(12).bytes(), 12 * (1 << 30));
    }

    #[test]
    fn size_equality_across_units() {
        assert_eq!(Size::KB(1024), Size::MB(1));
        assert_eq!(Size::MB(2).times(16), Size::MB(32));
        assert_eq!(Size::GB(128).megabytes(), 128 * 1024);
    }

    #[test]
    fn display_picks_largest_whole_unit() {
        assert_eq!(Size::MB(2).times(256).to_string(), "512 MB");
        assert_eq!(Size::MB(2048).to_string(), "2 GB");
        assert_eq!(Size::B(1536).to_string(), "1536 B");
        assert_eq!(Size::B(0).to_string(), "0 B");
    }
}
