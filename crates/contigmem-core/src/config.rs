//! Reservation configuration.
//!
//! The only tunable that changes the amount of reserved memory is the
//! [`ReservationOrder`]: every node gets `2^order` chunks.

use std::fs::File;
use std::io::Read;
use std::num::{IntErrorKind, ParseIntError};
use std::path::Path;
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::{DEFAULT_SLOT_LIMIT, Size};

/// Key of the reservation order on a kernel-style command line.
pub const CMDLINE_KEY: &str = "contigmem_order";

/// Exponent selecting how many chunks each node reserves.
///
/// Values outside `[MIN, MAX]`, negative ones included, are clamped with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "i64", into = "u32")]
pub struct ReservationOrder(u32);

impl ReservationOrder {
    /// Smallest accepted order (32 MB with 2 MB chunks)
    pub const MIN: u32 = 4;
    /// Largest accepted order (128 GB with 2 MB chunks)
    pub const MAX: u32 = 16;
    /// Default order (512 MB with 2 MB chunks)
    pub const DEFAULT: u32 = 8;

    /// Creates an order, clamping it into the accepted range.
    pub fn new(order: i64) -> Self {
        let clamped = order.clamp(Self::MIN.into(), Self::MAX.into());
        if clamped != order {
            warn!(
                "reservation order {} is out of range [{}, {}], using {}",
                order,
                Self::MIN,
                Self::MAX,
                clamped
            );
        }
        // In [MIN, MAX], so it fits.
        ReservationOrder(clamped as u32)
    }

    /// The exponent.
    pub fn get(&self) -> u32 {
        self.0
    }

    /// Number of chunks reserved per node.
    pub fn chunks(&self) -> usize {
        1 << self.0
    }

    /// Memory reserved per node for a given chunk size.
    pub fn bytes_per_node(&self, chunk_size: Size) -> Size {
        chunk_size.times(self.chunks())
    }
}

impl Default for ReservationOrder {
    fn default() -> Self {
        ReservationOrder(Self::DEFAULT)
    }
}

impl From<i64> for ReservationOrder {
    fn from(order: i64) -> Self {
        ReservationOrder::new(order)
    }
}

impl From<ReservationOrder> for u32 {
    fn from(order: ReservationOrder) -> Self {
        order.0
    }
}

impl FromStr for ReservationOrder {
    type Err = ParseIntError;

    /// Parses a decimal integer. Values too large for `i64` saturate before clamping.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let order = match s.trim().parse::<i64>() {
            Ok(order) => order,
            Err(e) => match e.kind() {
                IntErrorKind::PosOverflow => i64::MAX,
                IntErrorKind::NegOverflow => i64::MIN,
                _ => return Err(e),
            },
        };
        Ok(ReservationOrder::new(order))
    }
}

impl std::fmt::Display for ReservationOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The file is not a valid configuration
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Configuration of the reservation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReserveConfig {
    /// Chunks per node as a power of two
    pub order: ReservationOrder,
    /// Size of the region builder's slot table
    pub slot_limit: usize,
}

impl Default for ReserveConfig {
    fn default() -> Self {
        ReserveConfig {
            order: ReservationOrder::default(),
            slot_limit: DEFAULT_SLOT_LIMIT,
        }
    }
}

impl ReserveConfig {
    /// Reads a configuration from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_jsonfile<P: AsRef<Path>>(filepath: P) -> Result<ReserveConfig, ConfigError> {
        let mut file = File::open(filepath.as_ref())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: ReserveConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Reads the reservation order from a kernel-style command line such as
    /// `"quiet contigmem_order=10"`.
    ///
    /// An unparsable value keeps the default and is logged. The last occurrence wins.
    pub fn from_cmdline(cmdline: &str) -> ReserveConfig {
        let mut config = ReserveConfig::default();
        for arg in cmdline.split_whitespace() {
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };
            if key != CMDLINE_KEY {
                continue;
            }
            match value.parse::<ReservationOrder>() {
                Ok(order) => config.order = order,
                Err(e) => warn!(
                    "ignoring {}={}: {}, keeping order {}",
                    CMDLINE_KEY, value, e, config.order
                ),
            }
        }
        config
    }

    /// Number of chunks reserved per node.
    pub fn chunks_per_node(&self) -> usize {
        self.order.chunks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_clamping() {
        assert_eq!(ReservationOrder::new(3).get(), 4);
        assert_eq!(ReservationOrder::new(20).get(), 16);
        assert_eq!(ReservationOrder::new(8).get(), 8);
        assert_eq!(ReservationOrder::default().get(), 8);
        assert_eq!(ReservationOrder::new(-1).get(), 4);
        assert_eq!(ReservationOrder::new(i64::MAX).get(), 16);
    }

    #[test]
    fn test_order_sizes() {
        let order = ReservationOrder::default();
        assert_eq!(order.chunks(), 256);
        assert_eq!(order.bytes_per_node(Size::MB(2)), Size::MB(512));
        assert_eq!(
            ReservationOrder::new(ReservationOrder::MIN.into()).bytes_per_node(Size::MB(2)),
            Size::MB(32)
        );
        assert_eq!(
            ReservationOrder::new(ReservationOrder::MAX.into()).bytes_per_node(Size::MB(2)),
            Size::GB(128)
        );
    }

    #[test]
    fn test_from_cmdline() {
        assert_eq!(
            ReserveConfig::from_cmdline("ro quiet contigmem_order=10").order.get(),
            10
        );
        assert_eq!(ReserveConfig::from_cmdline("contigmem_order=2").order.get(), 4);
        assert_eq!(
            ReserveConfig::from_cmdline("contigmem_order=lots").order,
            ReservationOrder::default()
        );
        assert_eq!(ReserveConfig::from_cmdline(""), ReserveConfig::default());
    }

    #[test]
    fn test_from_cmdline_clamps_any_integer() {
        for (value, order) in [
            ("-1", 4),
            ("99999999999", 16),
            ("-99999999999999999999999", 4),
            ("99999999999999999999999", 16),
        ] {
            let cmdline = format!("quiet contigmem_order={}", value);
            assert_eq!(ReserveConfig::from_cmdline(&cmdline).order.get(), order, "{}", value);
        }
        assert!("4x".parse::<ReservationOrder>().is_err());
    }

    #[test]
    fn test_json_clamps_and_defaults() -> anyhow::Result<()> {
        let config: ReserveConfig = serde_json::from_str(r#"{"order": 30}"#)?;
        assert_eq!(config.order.get(), 16);
        assert_eq!(config.slot_limit, DEFAULT_SLOT_LIMIT);
        let config: ReserveConfig = serde_json::from_str(r#"{"order": -1}"#)?;
        assert_eq!(config.order.get(), 4);
        let config: ReserveConfig = serde_json::from_str(r#"{"order": 99999999999}"#)?;
        assert_eq!(config.order.get(), 16);
        let config: ReserveConfig = serde_json::from_str("{}")?;
        assert_eq!(config, ReserveConfig::default());
        Ok(())
    }

    #[test]
    fn test_from_jsonfile() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("contigmem-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"order": 5, "slot_limit": 4096}"#)?;
        let config = ReserveConfig::from_jsonfile(&path);
        std::fs::remove_file(&path)?;
        let config = config?;
        assert_eq!(config.order.get(), 5);
        assert_eq!(config.chunks_per_node(), 32);
        assert_eq!(config.slot_limit, 4096);
        assert!(matches!(
            ReserveConfig::from_jsonfile("/nonexistent/contigmem.json"),
            Err(ConfigError::Io(_))
        ));
        Ok(())
    }
}
