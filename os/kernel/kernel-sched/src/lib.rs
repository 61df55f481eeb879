//! # Tasks and Scheduling
//!
//! A single-core, preemptive round-robin scheduler and the blocking
//! primitives built on it.
//!
//! ```text
//!   trap layer ──▶ Scheduler ──▶ Platform (switch, timer mask, cr3)
//!                    ▲   │
//!      Semaphore ────┘   └──▶ AddressSpace (per task, kernel space shared)
//!      Mutex, CondVar
//! ```
//!
//! Mutual exclusion comes from masking interrupts: on one core nothing else
//! can run while they are off. The scheduler never holds its lock across a
//! switch, and every task has its own kernel stack, so a task can be switched
//! out anywhere interrupts are enabled and resumed later from the same spot.
//!
//! ## Sleeping
//!
//! A task blocks in two steps. [`Sleeper::prepare_me_for_sleep`] marks it
//! sleeping while it still holds the primitive's lock; after releasing the
//! lock, [`Sleeper::put_me_to_sleep`] consults [`Scheduler::yield_point`]:
//!
//! - [`YieldOutcome::GoingToSleep`]: still sleeping, the CPU goes elsewhere
//!   until a [`Sleeper::wake_up_task`];
//! - [`YieldOutcome::Resumed`]: a wake-up already happened in between, the
//!   task simply continues.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod config;
mod context;
mod error;
pub mod files;
mod platform;
mod scheduler;
pub mod sync;
mod task;

pub use context::{KernelContext, TaskContext, YieldOutcome};
pub use error::{SpawnError, WaitError};
pub use platform::{Platform, Space};
pub use scheduler::Scheduler;
pub use sync::{CondVar, Mutex, MutexGuard, Semaphore, Sleeper};
pub use task::{TaskId, TaskState};
