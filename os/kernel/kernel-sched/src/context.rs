//! Saved CPU state.

use crate::config::{INITIAL_RFLAGS, KERNEL_CS, KERNEL_SS, RFLAGS_IF, USER_CS, USER_SS};
use kernel_vmem::VirtualAddress;

/// Register snapshot of a task as seen by a trap: the general purpose
/// registers pushed by the entry stub followed by the frame the CPU pushes.
///
/// Restoring it (`iretq`) continues the task exactly where it trapped.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct TaskContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // pushed by the CPU
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TaskContext {
    /// Start state of a kernel task running `entry` on the stack ending at `stack_top`.
    #[must_use]
    pub const fn kernel(entry: VirtualAddress, stack_top: VirtualAddress) -> Self {
        Self::start(entry, stack_top, KERNEL_CS, KERNEL_SS)
    }

    /// Start state of a user task.
    #[must_use]
    pub const fn user(entry: VirtualAddress, stack_top: VirtualAddress) -> Self {
        Self::start(entry, stack_top, USER_CS, USER_SS)
    }

    const fn start(entry: VirtualAddress, stack_top: VirtualAddress, cs: u64, ss: u64) -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: entry.as_u64(),
            cs,
            rflags: INITIAL_RFLAGS,
            rsp: stack_top.as_u64(),
            ss,
        }
    }

    /// `true` if the trap came from ring 3.
    #[inline]
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    #[inline]
    #[must_use]
    pub const fn interrupts_enabled(&self) -> bool {
        self.rflags & RFLAGS_IF != 0
    }

    /// Switches the selectors to ring 3.
    pub const fn downgrade(&mut self) {
        self.cs = USER_CS;
        self.ss = USER_SS;
    }
}

/// State of a task suspended inside the kernel. Only the platform's switch
/// routine interprets it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct KernelContext {
    /// Saved stack pointer; the callee-saved registers sit on that stack.
    pub rsp: u64,
    /// Top of the task's kernel stack.
    pub stack_top: u64,
    /// Address of the [`TaskContext`] to enter on the first switch, or 0
    /// once the task has started.
    pub start: u64,
}

/// What [`Scheduler::yield_point`](crate::Scheduler::yield_point) found.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum YieldOutcome {
    /// The caller is still sleeping and has to hand the CPU to another task.
    GoingToSleep,
    /// The caller was woken before it gave up the CPU; it keeps running.
    Resumed,
}
