//! Two-counter grace periods.
//!
//! Readers enter a read-side section by bumping the counter of the current epoch
//! parity and leave it when their [`ReadGuard`] drops. A writer that has just
//! unpublished a pointer calls [`GracePeriod::synchronize`]: it flips the epoch,
//! waits for the old parity to drain, and does so a second time. Every reader that
//! could have loaded the old pointer has left once it returns.
//!
//! Readers never wait. Writers must be serialized by the caller.
//!
//! The reader's counter increment and pointer load, and the writer's pointer swap
//! and counter load, must all be `SeqCst`. With anything weaker the writer may see
//! a drained counter while a reader still loads the old pointer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::{Backoff, CachePadded};
use log::{debug, warn};

/// Default time after which a waiting writer logs a stall warning.
pub const DEFAULT_STALL_WARNING: Duration = Duration::from_secs(1);

const PARK_INTERVAL: Duration = Duration::from_micros(50);

/// Read-side counters and epoch of one grace-period domain.
#[derive(Debug)]
pub struct GracePeriod {
    epoch: CachePadded<AtomicUsize>,
    readers: [CachePadded<AtomicUsize>; 2],
    stall_warning: Duration,
}

/// An open read-side section. Dropping it leaves the section.
#[derive(Debug)]
#[must_use = "the read-side section ends when the guard is dropped"]
pub struct ReadGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

impl Default for GracePeriod {
    fn default() -> Self {
        GracePeriod::new(DEFAULT_STALL_WARNING)
    }
}

impl GracePeriod {
    /// Creates a domain whose writers warn after waiting `stall_warning`.
    pub fn new(stall_warning: Duration) -> Self {
        GracePeriod {
            epoch: CachePadded::new(AtomicUsize::new(0)),
            readers: [
                CachePadded::new(AtomicUsize::new(0)),
                CachePadded::new(AtomicUsize::new(0)),
            ],
            stall_warning,
        }
    }

    /// Enters a read-side section.
    pub fn read(&self) -> ReadGuard<'_> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let counter = &*self.readers[epoch & 1];
        // Pairs with the SeqCst counter load in `synchronize`.
        counter.fetch_add(1, Ordering::SeqCst);
        ReadGuard { counter }
    }

    /// Number of readers currently inside a section.
    pub fn active_readers(&self) -> usize {
        self.readers
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .sum()
    }

    /// Waits until every read-side section that started before the call has ended.
    ///
    /// Sections started afterwards do not delay it for longer than one epoch flip.
    pub fn synchronize(&self) {
        let started = Instant::now();
        let mut warned = false;
        for _ in 0..2 {
            let old = self.epoch.fetch_add(1, Ordering::SeqCst);
            let counter = &self.readers[old & 1];
            let backoff = Backoff::new();
            while counter.load(Ordering::SeqCst) != 0 {
                if !warned && started.elapsed() >= self.stall_warning {
                    warn!(
                        "grace period stalled for {:?} with {} readers in epoch {}",
                        started.elapsed(),
                        counter.load(Ordering::Relaxed),
                        old
                    );
                    warned = true;
                }
                if backoff.is_completed() {
                    thread::sleep(PARK_INTERVAL);
                } else {
                    backoff.snooze();
                }
            }
        }
        debug!("grace period completed in {:?}", started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_synchronize_without_readers() {
        let gp = GracePeriod::default();
        gp.synchronize();
        gp.synchronize();
        assert_eq!(gp.active_readers(), 0);
    }

    #[test]
    fn test_guard_counts() {
        let gp = GracePeriod::default();
        let a = gp.read();
        let b = gp.read();
        assert_eq!(gp.active_readers(), 2);
        drop(a);
        assert_eq!(gp.active_readers(), 1);
        drop(b);
        assert_eq!(gp.active_readers(), 0);
    }

    #[test]
    fn test_synchronize_waits_for_reader() {
        let gp = Arc::new(GracePeriod::new(Duration::from_millis(10)));
        let done = Arc::new(AtomicBool::new(false));
        let guard_taken = Arc::new(std::sync::Barrier::new(2));

        let reader = {
            let gp = Arc::clone(&gp);
            let done = Arc::clone(&done);
            let guard_taken = Arc::clone(&guard_taken);
            thread::spawn(move || {
                let _guard = gp.read();
                guard_taken.wait();
                thread::sleep(Duration::from_millis(50));
                done.store(true, Ordering::SeqCst);
            })
        };
        guard_taken.wait();
        gp.synchronize();
        assert!(done.load(Ordering::SeqCst));
        reader.join().expect("reader panicked");
    }

    #[test]
    fn test_reader_uses_current_parity() {
        let gp = GracePeriod::default();
        gp.synchronize();
        let _late = gp.read();
        let epoch = gp.epoch.load(Ordering::SeqCst);
        assert_eq!(gp.readers[epoch & 1].load(Ordering::SeqCst), 1);
        assert_eq!(gp.readers[(epoch + 1) & 1].load(Ordering::SeqCst), 0);
    }
}
