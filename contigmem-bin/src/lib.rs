//! # contigmem binaries
//!
//! Shared setup for the binaries in this crate:
//!
//! - `reserve`: runs the per-node reservation on this machine and prints the
//!   resulting mapping table as JSON.
//! - `hook_stress`: hammers a hook registry from many dispatcher threads while
//!   the main thread registers and unregisters hooks.
//!
//! The real allocator needs HugeTLB pages and root:
//!
//! ```sh
//! echo 512 | sudo tee /proc/sys/vm/nr_hugepages
//! cargo build --release
//! sudo target/release/reserve --allocator hugetlb --order 6
//! ```
pub mod allocator;

#[macro_use]
extern crate log;

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

/// Installs `env_logger` behind an `indicatif` bridge so log lines do not tear
/// progress bars. The level defaults to `info`.
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Asks the kernel to compact memory before a reservation.
///
/// # Errors
///
/// Returns an error if `/proc/sys/vm/compact_memory` cannot be written (not root).
pub fn compact_memory() -> std::io::Result<()> {
    std::fs::write("/proc/sys/vm/compact_memory", "1")?;
    debug!("memory compacted");
    Ok(())
}
