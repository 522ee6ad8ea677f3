use std::{
    fs::File,
    io::{BufWriter, Write},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use clap::Parser;
use contigmem_bin::allocator::{self, ChunkSource};
use contigmem_bin::{compact_memory, init_logging_with_progress};
use contigmem_core::allocator::ChunkAllocator;
use contigmem_core::config::{ReservationOrder, ReserveConfig};
use contigmem_core::fallback::MmapReserver;
use contigmem_core::mapping::MappingTable;
use contigmem_core::topology::Topology;
use contigmem_core::{Coverage, Reserver};
use indicatif::MultiProgress;
use log::{error, info, warn};
use serde::Serialize;

/// CLI arguments for the `reserve` binary.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// JSON configuration file. Flags override its values.
    #[clap(long = "config")]
    config: Option<String>,
    /// Kernel-style command line to read `contigmem_order=N` from, e.g. "$(cat /proc/cmdline)".
    #[clap(long = "cmdline")]
    cmdline: Option<String>,
    /// Reservation order: every node reserves 2^order chunks. Clamped to [4, 16].
    #[clap(long = "order", allow_negative_numbers = true)]
    order: Option<i64>,
    /// Where chunks come from.
    #[clap(long = "allocator", value_enum, default_value = "hugetlb")]
    allocator: ChunkSource,
    /// Seed of the simulated allocator.
    #[clap(long = "seed", default_value = "0")]
    seed: u64,
    /// Make every n-th simulated slot unavailable.
    #[clap(long = "hole-every")]
    hole_every: Option<usize>,
    /// Compact memory before reserving.
    #[clap(long = "compact")]
    compact: bool,
    /// Keep the memory reserved for this many seconds before releasing it.
    #[clap(long = "hold", default_value = "0")]
    hold_secs: u64,
    /// Output file for the report (JSON format). Printed to stdout if absent.
    #[clap(long = "output")]
    output: Option<String>,
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    date: String,
    args: &'a CliArgs,
    config: ReserveConfig,
    online_nodes: usize,
    chunk_size_bytes: usize,
    bytes_per_node: usize,
    coverage: Coverage,
    duration_ms: u64,
    mappings: &'a MappingTable,
}

impl Report<'_> {
    fn write(&self, output: Option<&str>) -> Result<()> {
        match output {
            Some(filename) => {
                let file = File::create(filename)?;
                let mut writer = BufWriter::new(file);
                serde_json::to_writer_pretty(&mut writer, self)?;
                writer.flush()?;
                info!("Report saved to {}", filename);
            }
            None => println!("{}", serde_json::to_string_pretty(self)?),
        }
        Ok(())
    }
}

fn load_config(args: &CliArgs) -> Result<ReserveConfig> {
    let mut config = match (&args.config, &args.cmdline) {
        (Some(path), _) => ReserveConfig::from_jsonfile(path)?,
        (None, Some(cmdline)) => ReserveConfig::from_cmdline(cmdline),
        (None, None) => ReserveConfig::default(),
    };
    if args.config.is_some() && args.cmdline.is_some() {
        warn!("both --config and --cmdline given, ignoring --cmdline");
    }
    if let Some(order) = args.order {
        config.order = ReservationOrder::new(order);
    }
    Ok(config)
}

fn run<A: ChunkAllocator>(
    args: &CliArgs,
    config: ReserveConfig,
    topology: Topology,
    chunks: A,
    progress: MultiProgress,
) -> Result<()> {
    let online_nodes = topology.online().len();
    let mut reserver =
        Reserver::new(config, topology, chunks, MmapReserver::default()).with_progress(progress);
    info!(
        "Reserving {} per node on {} online nodes",
        reserver.bytes_per_node(),
        online_nodes
    );

    let start_time = Instant::now();
    let coverage = match reserver.reserve() {
        Ok(coverage) => coverage,
        Err(fault) => {
            error!("Reservation aborted: {}", fault);
            bail!(fault);
        }
    };
    let duration = start_time.elapsed();
    match coverage {
        Coverage::Physical => info!("All nodes physically contiguous"),
        Coverage::Virtual => warn!("Fell back to virtually contiguous memory"),
        Coverage::None => error!("No memory reserved"),
    }

    Report {
        date: chrono::Local::now().to_rfc3339(),
        args,
        config,
        online_nodes,
        chunk_size_bytes: reserver.allocator().chunk_size().bytes(),
        bytes_per_node: reserver.bytes_per_node().bytes(),
        coverage,
        duration_ms: duration.as_millis() as u64,
        mappings: reserver.mappings(),
    }
    .write(args.output.as_deref())?;

    if args.hold_secs > 0 {
        info!("Holding reservation for {}s", args.hold_secs);
        thread::sleep(Duration::from_secs(args.hold_secs));
    }
    reserver.release();
    info!("Reservation released");
    Ok(())
}

fn main() -> Result<()> {
    let progress = init_logging_with_progress()?;

    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);

    let config = load_config(&args)?;
    info!("Config: {:?}", config);
    let topology = Topology::detect()?;
    info!("Online nodes: {:?}", topology.online());

    if args.compact {
        if let Err(e) = compact_memory() {
            warn!("Memory compaction failed: {:?}", e);
        }
    }

    match args.allocator {
        ChunkSource::Hugetlb => {
            let chunks = allocator::hugetlb()?;
            run(&args, config, topology, chunks, progress)
        }
        ChunkSource::Simulated => {
            let chunks = allocator::simulated(
                &topology,
                config.chunks_per_node(),
                args.seed,
                args.hole_every,
            );
            run(&args, config, topology, chunks, progress)
        }
    }
}
