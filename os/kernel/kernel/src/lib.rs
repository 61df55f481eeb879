//! # Kernel
//!
//! Ties the scheduler, the address spaces and the system calls together
//! behind the three trap entry points:
//!
//! ```text
//!   timer IRQ ──▶ Kernel::on_timer ──────▶ Scheduler::on_timer_tick
//!   #PF ────────▶ Kernel::on_page_fault ─▶ demand paging, else kill the task
//!   int 0x80 ───▶ Kernel::on_syscall ────▶ kernel_syscall::dispatch
//! ```
//!
//! [`Kernel`] is an explicit context passed to whoever needs it. The x86-64
//! backend in [`arch`] (bare metal only) keeps the one instance its assembly
//! entry stubs reach in a [`SyncOnceCell`](kernel_sync::SyncOnceCell).

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

#[cfg(target_os = "none")]
pub mod arch;
pub mod backtrace;
mod kernel;
pub mod logger;
pub mod page_fault;
mod syscall;
mod trap;
mod user;

pub use kernel::Kernel;
pub use page_fault::PageFaultError;
