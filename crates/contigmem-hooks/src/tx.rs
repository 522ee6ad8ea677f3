//! Transmit action slot.
//!
//! Holds the single callback run from the transmit path.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

use log::info;
use parking_lot::Mutex;

use crate::grace::{DEFAULT_STALL_WARNING, GracePeriod};
use crate::registry::RegistryFault;

/// Callback run from the transmit path.
pub type TxAction = Arc<dyn Fn() + Send + Sync>;

/// Slot holding at most one transmit action.
///
/// Uses the same publish and retire protocol as [`HookRegistry`](crate::HookRegistry):
/// [`run`](TxActionSlot::run) never blocks and [`del`](TxActionSlot::del) waits
/// until no caller is still inside the old action.
pub struct TxActionSlot {
    published: AtomicPtr<TxAction>,
    writer: Mutex<bool>,
    grace: GracePeriod,
}

impl Default for TxActionSlot {
    fn default() -> Self {
        TxActionSlot::new(DEFAULT_STALL_WARNING)
    }
}

impl TxActionSlot {
    /// Creates an empty slot.
    pub fn new(stall_warning: Duration) -> Self {
        TxActionSlot {
            published: AtomicPtr::new(ptr::null_mut()),
            writer: Mutex::new(false),
            grace: GracePeriod::new(stall_warning),
        }
    }

    /// Installs `action`.
    ///
    /// # Errors
    ///
    /// [`RegistryFault::AlreadyRegistered`] if an action is installed.
    pub fn set(&self, action: TxAction) -> Result<(), RegistryFault> {
        let mut set = self.writer.lock();
        if *set {
            return Err(RegistryFault::AlreadyRegistered);
        }
        self.published
            .store(Box::into_raw(Box::new(action)), Ordering::Release);
        *set = true;
        info!("tx action installed");
        Ok(())
    }

    /// Removes the installed action, if any, and waits for running callers.
    pub fn del(&self) {
        let mut set = self.writer.lock();
        let old = self.published.swap(ptr::null_mut(), Ordering::SeqCst);
        if old.is_null() {
            return;
        }
        self.grace.synchronize();
        // SAFETY: allocated in `set`, unreachable after the grace period.
        drop(unsafe { Box::from_raw(old) });
        *set = false;
        info!("tx action removed");
    }

    /// Runs the installed action. Returns whether one was installed.
    pub fn run(&self) -> bool {
        let _guard = self.grace.read();
        let action = self.published.load(Ordering::SeqCst);
        if action.is_null() {
            return false;
        }
        // SAFETY: see `del`.
        (unsafe { &*action })();
        true
    }
}

impl Drop for TxActionSlot {
    fn drop(&mut self) {
        let old = *self.published.get_mut();
        if !old.is_null() {
            drop(unsafe { Box::from_raw(old) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_set_run_del() -> anyhow::Result<()> {
        let slot = TxActionSlot::default();
        assert!(!slot.run());

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        slot.set(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))?;
        assert!(slot.run());
        assert!(slot.run());
        assert_eq!(
            slot.set(Arc::new(|| {})),
            Err(RegistryFault::AlreadyRegistered)
        );

        slot.del();
        assert!(!slot.run());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        // Deleting an empty slot is a no-op.
        slot.del();
        slot.set(Arc::new(|| {}))?;
        assert!(slot.run());
        Ok(())
    }
}
