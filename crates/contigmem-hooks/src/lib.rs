//! # Contigmem Hooks
//!
//! An interrupt-style callback registry for socket lifecycle and packet receive
//! events. A single external module installs a [`SocketHooks`] implementation
//! with [`HookRegistry::register`]; packet and socket code calls the
//! `dispatch_*` entry points from any number of threads without locking.
//!
//! Retirement follows a grace-period protocol ([`grace::GracePeriod`]):
//! [`HookRegistry::unregister`] unpublishes the hooks and then waits until every
//! dispatch that might still be running them has returned. The caller may unload
//! or drop the hooks afterwards.
//!
//! [`TxActionSlot`] applies the same protocol to a single transmit-path callback.

#![warn(missing_docs)]

pub mod grace;
mod registry;
mod tx;

pub use crate::registry::{
    Connection, ETH_P_IP, HookRegistry, Hooks, Packet, RegistryConfig, RegistryFault,
    SocketHooks, Verdict,
};
pub use crate::tx::{TxAction, TxActionSlot};
