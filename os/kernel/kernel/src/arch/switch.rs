//! Kernel stack switching.
//!
//! A suspended task's [`KernelContext::rsp`] points at its callee-saved
//! registers and the return address into the code that switched away. A
//! task that never ran has `start` set instead and is entered through
//! [`restore_context`] on a fresh stack.

use kernel_sched::{KernelContext, TaskContext};

/// Saves the callee-saved registers of the running code into `prev` and
/// continues `next`.
///
/// Returns when another switch targets `prev`.
///
/// # Safety
/// Interrupts must be masked. `next` must either have been saved by this
/// routine or describe a task that has not started yet.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(prev: *mut KernelContext, next: *const KernelContext) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // prev.rsp = rsp; a task that switches out has started
        "mov [rdi], rsp",
        "mov qword ptr [rdi + 16], 0",
        // first run?
        "mov rax, [rsi + 16]",
        "test rax, rax",
        "jnz 2f",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
        "2:",
        "mov rsp, [rsi + 8]",
        "mov rdi, rax",
        "jmp {restore}",
        restore = sym restore_context,
    );
}

/// Loads `context` and returns from the trap it describes.
///
/// # Safety
/// `context` must describe code and a stack valid in the active address space.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(context: *const TaskContext) -> ! {
    core::arch::naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
    );
}
