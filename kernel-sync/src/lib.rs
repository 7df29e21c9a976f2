//! # Kernel synchronization primitives
//!
//! Everything the kernel shares across contexts goes through one of the types
//! in this crate:
//!
//! - [`SpinLock`]: a TATAS spinlock with an RAII guard.
//! - [`SyncOnceCell`]: lock-free one-shot initialization for globals.
//! - [`IrqGuard`]: RAII cli/sti bracket for critical sections that must not
//!   be re-entered from an interrupt handler.
//! - [`ByteRing`]: a single-producer single-consumer byte queue for handing
//!   data from interrupt context to the main thread.
//!
//! The kernel is single-core today; the primitives are still written to their
//! full multi-core contracts so that callers never have to change.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod byte_ring;
pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use byte_ring::ByteRing;
pub use irq::IrqGuard;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
