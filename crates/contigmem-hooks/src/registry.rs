//! The socket hook registry.
//!
//! One external module at a time may install a [`SocketHooks`] implementation.
//! Dispatch is lock-free and never blocks; [`HookRegistry::unregister`] returns only
//! after every dispatch that could still see the old hooks has finished.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::time::Duration;

use log::{info, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::grace::{DEFAULT_STALL_WARNING, GracePeriod};

/// EtherType of IPv4.
pub const ETH_P_IP: u16 = 0x0800;

/// A connection as seen by the hooks.
pub trait Connection {
    /// Whether a security context is already attached to the connection.
    fn has_security_context(&self) -> bool;
}

/// A received packet as seen by the hooks.
pub trait Packet {
    /// Link-layer protocol (EtherType) of the packet.
    fn protocol(&self) -> u16;
}

/// Outcome of a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    /// Let the connection or packet through. Also returned when nothing is registered.
    #[default]
    Accept,
    /// Refuse it with an error code
    Reject(i32),
}

/// The capability set installed by the external subsystem.
///
/// Hooks run concurrently on many threads and must not block.
pub trait SocketHooks<C, P>: Send + Sync {
    /// A socket is being created.
    fn on_socket_create(&self, conn: &C) -> Verdict;
    /// A socket carrying a security context is being destroyed.
    fn on_socket_destroy(&self, conn: &C);
    /// A packet of the configured protocol was received.
    fn on_packet_receive(&self, conn: &C, packet: &P) -> Verdict;
}

/// Shared handle to an installed capability set.
pub type Hooks<C, P> = Arc<dyn SocketHooks<C, P>>;

/// Fatal misuse of a registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryFault {
    /// Something is already registered
    #[error("hooks are already registered")]
    AlreadyRegistered,
    /// Nothing is registered
    #[error("no hooks are registered")]
    NotRegistered,
    /// A different capability set is registered
    #[error("unregistering hooks that are not the registered ones")]
    Mismatch,
}

/// Registry options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Protocol that packets must carry to reach `on_packet_receive`
    pub protocol: u16,
    /// How long `unregister` waits before logging a stall warning
    pub stall_warning: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            protocol: ETH_P_IP,
            stall_warning: DEFAULT_STALL_WARNING,
        }
    }
}

/// Holder of at most one registered [`SocketHooks`].
///
/// # Examples
///
/// ```ignore
/// let registry = HookRegistry::new(RegistryConfig::default());
/// let hooks: Hooks<Sock, Skb> = Arc::new(Firewall::new());
/// registry.register(Arc::clone(&hooks))?;
/// let verdict = registry.dispatch_receive(&sock, &skb);
/// registry.unregister(&hooks)?;
/// ```
pub struct HookRegistry<C, P> {
    config: RegistryConfig,
    // Points at a leaked `Box<Hooks>` while registered, null otherwise.
    published: AtomicPtr<Hooks<C, P>>,
    writer: Mutex<Option<Hooks<C, P>>>,
    grace: GracePeriod,
    // Set once the preexisting-context warning was logged.
    context_warned: AtomicBool,
}

impl<C, P> HookRegistry<C, P> {
    /// Creates an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        HookRegistry {
            config,
            published: AtomicPtr::new(ptr::null_mut()),
            writer: Mutex::new(None),
            grace: GracePeriod::new(config.stall_warning),
            context_warned: AtomicBool::new(false),
        }
    }

    /// The registry options.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Whether hooks are currently registered.
    pub fn is_registered(&self) -> bool {
        !self.published.load(Ordering::Acquire).is_null()
    }

    /// Publishes `hooks`. Dispatches starting after this returns will call them.
    ///
    /// # Errors
    ///
    /// [`RegistryFault::AlreadyRegistered`] if other hooks are registered.
    pub fn register(&self, hooks: Hooks<C, P>) -> Result<(), RegistryFault> {
        let mut current = self.writer.lock();
        if current.is_some() {
            return Err(RegistryFault::AlreadyRegistered);
        }
        let boxed = Box::into_raw(Box::new(Arc::clone(&hooks)));
        self.published.store(boxed, Ordering::Release);
        *current = Some(hooks);
        info!("socket hooks registered");
        Ok(())
    }

    /// Removes `hooks` and waits until no dispatch is still running them.
    ///
    /// Identity is compared, not equality.
    ///
    /// # Errors
    ///
    /// * [`RegistryFault::NotRegistered`] if nothing is registered.
    /// * [`RegistryFault::Mismatch`] if other hooks are registered.
    pub fn unregister(&self, hooks: &Hooks<C, P>) -> Result<(), RegistryFault> {
        let mut current = self.writer.lock();
        match current.as_ref() {
            None => return Err(RegistryFault::NotRegistered),
            Some(registered) if !Arc::ptr_eq(registered, hooks) => {
                return Err(RegistryFault::Mismatch);
            }
            Some(_) => {}
        }
        // SeqCst, see the `grace` module.
        let old = self.published.swap(ptr::null_mut(), Ordering::SeqCst);
        self.grace.synchronize();
        if !old.is_null() {
            // SAFETY: `old` came from `Box::into_raw` in `register` and no reader
            // can still hold it after the grace period.
            drop(unsafe { Box::from_raw(old) });
        }
        *current = None;
        info!("socket hooks unregistered");
        Ok(())
    }

    fn with_hooks<R>(&self, f: impl FnOnce(&dyn SocketHooks<C, P>) -> R) -> Option<R> {
        let _guard = self.grace.read();
        // SeqCst, see the `grace` module.
        let hooks = self.published.load(Ordering::SeqCst);
        if hooks.is_null() {
            return None;
        }
        // SAFETY: non-null values stay allocated until a grace period has passed,
        // which cannot complete while `_guard` is alive.
        Some(f(unsafe { &**hooks }))
    }
}

impl<C: Connection, P: Packet> HookRegistry<C, P> {
    /// Runs `on_socket_create` if hooks are registered.
    ///
    /// A new socket that already carries a security context is logged as a warning
    /// the first time only.
    pub fn dispatch_create(&self, conn: &C) -> Verdict {
        if conn.has_security_context() {
            if self.context_warned.swap(true, Ordering::Relaxed) {
                trace!("new socket already carries a security context");
            } else {
                warn!("new socket already carries a security context (logged once)");
            }
        }
        self.with_hooks(|h| h.on_socket_create(conn))
            .unwrap_or_default()
    }

    /// Runs `on_socket_destroy` for connections that carry a security context.
    pub fn dispatch_destroy(&self, conn: &C) {
        if !conn.has_security_context() {
            return;
        }
        self.with_hooks(|h| h.on_socket_destroy(conn));
    }

    /// Runs `on_packet_receive` for packets of the configured protocol.
    pub fn dispatch_receive(&self, conn: &C, packet: &P) -> Verdict {
        if packet.protocol() != self.config.protocol {
            trace!("bypassing hooks for protocol {:#06x}", packet.protocol());
            return Verdict::Accept;
        }
        self.with_hooks(|h| h.on_packet_receive(conn, packet))
            .unwrap_or_default()
    }
}

impl<C, P> Default for HookRegistry<C, P> {
    fn default() -> Self {
        HookRegistry::new(RegistryConfig::default())
    }
}

impl<C, P> Drop for HookRegistry<C, P> {
    fn drop(&mut self) {
        let old = *self.published.get_mut();
        if !old.is_null() {
            // SAFETY: `&mut self` excludes readers.
            drop(unsafe { Box::from_raw(old) });
        }
    }
}
