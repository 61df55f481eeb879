//! # Tasks
//!
//! ```text
//!            prepare_me_for_sleep
//!  Runnable ───────────────────────▶ Sleeping
//!     │    ◀───────────────────────────
//!     │           wake_up_task
//!     │ terminate
//!     ▼
//!   Zombie ── wait ──▶ (removed)
//! ```

use crate::context::{KernelContext, TaskContext};
use crate::files::FileTable;
use crate::platform::{Platform, Space};
use crate::sync::{CondVar, Mutex};
use alloc::sync::Arc;
use core::fmt;
use kernel_info::memory::kernel_stack_top;
use kernel_vmem::VirtualAddress;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(u32);

impl TaskId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Top of the kernel stack slot reserved for this id.
    #[must_use]
    pub const fn kernel_stack_top(self) -> VirtualAddress {
        VirtualAddress::new(kernel_stack_top(self.0))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TaskState {
    Runnable,
    Sleeping,
    Zombie,
}

/// First id after `last` (wrapping from `max` back to 1) that is not in use.
pub(crate) fn next_free_id(last: u32, max: u32, in_use: impl Fn(TaskId) -> bool) -> Option<TaskId> {
    let mut id = last;
    for _ in 0..max {
        id = if id >= max { 1 } else { id + 1 };
        if !in_use(TaskId(id)) {
            return Some(TaskId(id));
        }
    }
    None
}

/// Exit status of a task, published once when it terminates.
pub(crate) struct ExitSignal {
    pub status: Mutex<Option<i32>>,
    pub done: CondVar,
}

impl ExitSignal {
    pub const fn new() -> Self {
        Self {
            status: Mutex::new(None),
            done: CondVar::new(),
        }
    }
}

pub(crate) struct Task<P: Platform> {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub state: TaskState,
    /// Where the task continues when it is (re)entered from its saved state.
    pub context: TaskContext,
    pub kernel: KernelContext,
    /// `None` for kernel tasks, which run in the kernel address space.
    pub space: Option<Arc<Space<P>>>,
    pub exit: Arc<ExitSignal>,
    pub files: FileTable,
}

impl<P: Platform> Task<P> {
    pub const fn kernel_stack_top(&self) -> VirtualAddress {
        self.id.kernel_stack_top()
    }

    /// An address inside the kernel stack, for checking that it stays mapped
    /// across address-space switches.
    pub const fn stack_probe(&self) -> VirtualAddress {
        VirtualAddress::new(self.kernel_stack_top().as_u64() - 8)
    }
}

impl<P: Platform> fmt::Debug for Task<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("state", &self.state)
            .field("rip", &format_args!("{:#x}", self.context.rip))
            .field("space", &self.space)
            .finish_non_exhaustive()
    }
}
