//! # Kernel synchronization primitives
//!
//! The kernel runs on a single core, so mutual exclusion between a task and
//! the interrupt handlers that may preempt it is achieved by masking
//! interrupts ([`IrqGuard`]). [`IrqSpinLock`] adds a lock word on top, which
//! never spins on one core but keeps the type honest when shared between
//! host threads.
//!
//! On bare metal (`target_os = "none"`) the interrupt flag is the CPU's
//! `RFLAGS.IF`; elsewhere each thread carries its own simulated flag so the
//! same code runs under the host test harness.

#![no_std]
#![allow(unsafe_code)]

#[cfg(not(target_os = "none"))]
extern crate std;

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::{IrqGuard, IrqSpinLock, IrqSpinLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
