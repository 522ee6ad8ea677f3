use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use contigmem_bin::init_logging_with_progress;
use contigmem_core::util::NamedProgress;
use contigmem_hooks::{
    Connection, ETH_P_IP, HookRegistry, Hooks, Packet, RegistryConfig, SocketHooks, Verdict,
};
use crossbeam::channel;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use serde::Serialize;

/// CLI arguments for the `hook_stress` binary.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// Number of dispatcher threads.
    #[clap(long = "threads", default_value = "4")]
    threads: usize,
    /// Number of register/unregister cycles.
    #[clap(long = "cycles", default_value = "1000")]
    cycles: usize,
    /// Time each hook invocation spins, in microseconds.
    #[clap(long = "hook-us", default_value = "0")]
    hook_us: u64,
    /// Time hooks stay registered per cycle, in microseconds.
    #[clap(long = "registered-us", default_value = "100")]
    registered_us: u64,
}

struct Sock {
    id: usize,
}

impl Connection for Sock {
    fn has_security_context(&self) -> bool {
        self.id % 2 == 0
    }
}

struct Frame {
    protocol: u16,
}

impl Packet for Frame {
    fn protocol(&self) -> u16 {
        self.protocol
    }
}

/// Counts calls and flags any call that runs after it was retired.
struct Probe {
    calls: AtomicUsize,
    retired: AtomicBool,
    late_calls: AtomicUsize,
    spin: Duration,
}

impl Probe {
    fn new(spin: Duration) -> Self {
        Probe {
            calls: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            late_calls: AtomicUsize::new(0),
            spin,
        }
    }

    fn enter(&self) {
        let start = Instant::now();
        while start.elapsed() < self.spin {
            std::hint::spin_loop();
        }
        if self.retired.load(Ordering::SeqCst) {
            self.late_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

impl SocketHooks<Sock, Frame> for Probe {
    fn on_socket_create(&self, _conn: &Sock) -> Verdict {
        self.enter();
        Verdict::Accept
    }

    fn on_socket_destroy(&self, _conn: &Sock) {
        self.enter();
    }

    fn on_packet_receive(&self, _conn: &Sock, _packet: &Frame) -> Verdict {
        self.enter();
        Verdict::Reject(-1)
    }
}

/// Sums hook calls and late calls over every retired probe.
///
/// Only meaningful once no dispatcher can run any more.
fn tally(probes: &[Arc<Probe>]) -> (usize, usize) {
    probes.iter().fold((0, 0), |(calls, late), p| {
        (
            calls + p.calls.load(Ordering::SeqCst),
            late + p.late_calls.load(Ordering::SeqCst),
        )
    })
}

#[derive(Debug, Default, Serialize)]
struct DispatchCounts {
    dispatched: usize,
    rejected: usize,
}

#[derive(Debug, Serialize)]
struct Summary {
    args: CliArgs,
    duration_ms: u64,
    dispatched: usize,
    rejected: usize,
    hook_calls: usize,
    late_calls: usize,
}

fn main() -> Result<()> {
    let progress = init_logging_with_progress()?;
    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);

    let registry = Arc::new(HookRegistry::<Sock, Frame>::new(RegistryConfig::default()));
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = channel::unbounded::<DispatchCounts>();

    let stride = args.threads;
    let dispatchers = (0..args.threads)
        .map(|t| {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            let tx = tx.clone();
            thread::spawn(move || {
                let mut counts = DispatchCounts::default();
                let mut id = t;
                while !stop.load(Ordering::Relaxed) {
                    let sock = Sock { id };
                    let protocol = if id % 5 == 0 { 0x86dd } else { ETH_P_IP };
                    registry.dispatch_create(&sock);
                    if registry.dispatch_receive(&sock, &Frame { protocol }) != Verdict::Accept {
                        counts.rejected += 1;
                    }
                    registry.dispatch_destroy(&sock);
                    counts.dispatched += 3;
                    id += stride;
                }
                let _ = tx.send(counts);
            })
        })
        .collect::<Vec<_>>();
    drop(tx);

    let bar = progress.add(
        ProgressBar::new(args.cycles as u64)
            .with_style(ProgressStyle::named_bar("Register/unregister cycles")),
    );

    let start_time = Instant::now();
    let mut retired = Vec::with_capacity(args.cycles);
    for _ in 0..args.cycles {
        let probe = Arc::new(Probe::new(Duration::from_micros(args.hook_us)));
        let hooks: Hooks<Sock, Frame> = probe.clone();
        registry.register(Arc::clone(&hooks))?;
        thread::sleep(Duration::from_micros(args.registered_us));
        registry.unregister(&hooks)?;
        probe.retired.store(true, Ordering::SeqCst);
        retired.push(probe);
        bar.inc(1);
    }
    let duration = start_time.elapsed();
    bar.finish();

    stop.store(true, Ordering::Relaxed);
    for dispatcher in dispatchers {
        if dispatcher.join().is_err() {
            anyhow::bail!("dispatcher thread panicked");
        }
    }
    let (hook_calls, late_calls) = tally(&retired);
    let (dispatched, rejected) = rx
        .iter()
        .fold((0, 0), |(d, r), c| (d + c.dispatched, r + c.rejected));

    let summary = Summary {
        args,
        duration_ms: duration.as_millis() as u64,
        dispatched,
        rejected,
        hook_calls,
        late_calls,
    };
    info!(
        "{} cycles in {:.2}s, {} dispatches, {} hook calls",
        summary.args.cycles,
        duration.as_secs_f64(),
        summary.dispatched,
        summary.hook_calls
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.late_calls > 0 {
        anyhow::bail!("{} hook calls ran after unregister returned", summary.late_calls);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_counts_calls_after_retirement() {
        let probes: Vec<_> = (0..3).map(|_| Arc::new(Probe::new(Duration::ZERO))).collect();
        probes[0].enter();
        probes[1].enter();
        probes[1].retired.store(true, Ordering::SeqCst);
        probes[1].enter();
        probes[2].retired.store(true, Ordering::SeqCst);
        probes[2].enter();
        assert_eq!(tally(&probes), (4, 2));
    }
}
