//! Trap entry stubs.
//!
//! Each stub completes the CPU's interrupt frame to a [`TaskContext`] by
//! pushing the general purpose registers, calls into the installed
//! [`Kernel`](crate::Kernel) with the stack 16-byte aligned, and returns with
//! `iretq` to whatever the context describes afterwards.

use super::kernel;
use super::ports::pic_end_of_interrupt;
use crate::page_fault::PageFaultError;
use kernel_sched::TaskContext;
use kernel_vmem::VirtualAddress;

/// Vector 0x20: the PIT through PIC #1.
#[unsafe(naked)]
pub extern "C" fn timer_entry() {
    core::arch::naked_asm!(
        "cld",
        "push rax", "push rbx", "push rcx", "push rdx", "push rsi", "push rdi", "push rbp",
        "push r8", "push r9", "push r10", "push r11", "push r12", "push r13", "push r14", "push r15",
        "mov rdi, rsp",
        "mov rbp, rsp",
        "and rsp, -16",
        "call {rust}",
        "mov rsp, rbp",
        "pop r15", "pop r14", "pop r13", "pop r12", "pop r11", "pop r10", "pop r9", "pop r8",
        "pop rbp", "pop rdi", "pop rsi", "pop rdx", "pop rcx", "pop rbx", "pop rax",
        "iretq",
        rust = sym timer_trap,
    );
}

/// Vector 0x0e. The CPU pushes an error code; it is swapped for `rax` so
/// the frame has the same shape as the others.
#[unsafe(naked)]
pub extern "C" fn page_fault_entry() {
    core::arch::naked_asm!(
        "cld",
        "xchg rax, [rsp]",
        "push rbx", "push rcx", "push rdx", "push rsi", "push rdi", "push rbp",
        "push r8", "push r9", "push r10", "push r11", "push r12", "push r13", "push r14", "push r15",
        "mov rdi, rsp",
        "mov rsi, rax",
        "mov rdx, cr2",
        "mov rbp, rsp",
        "and rsp, -16",
        "call {rust}",
        "mov rsp, rbp",
        "pop r15", "pop r14", "pop r13", "pop r12", "pop r11", "pop r10", "pop r9", "pop r8",
        "pop rbp", "pop rdi", "pop rsi", "pop rdx", "pop rcx", "pop rbx", "pop rax",
        "iretq",
        rust = sym page_fault_trap,
    );
}

/// Vector 0x80, reachable from ring 3. The result comes back in `rax`.
#[unsafe(naked)]
pub extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "cld",
        "push rax", "push rbx", "push rcx", "push rdx", "push rsi", "push rdi", "push rbp",
        "push r8", "push r9", "push r10", "push r11", "push r12", "push r13", "push r14", "push r15",
        "mov rdi, rsp",
        "mov rbp, rsp",
        "and rsp, -16",
        "call {rust}",
        "mov rsp, rbp",
        "pop r15", "pop r14", "pop r13", "pop r12", "pop r11", "pop r10", "pop r9", "pop r8",
        "pop rbp", "pop rdi", "pop rsi", "pop rdx", "pop rcx", "pop rbx", "pop rax",
        "iretq",
        rust = sym syscall_trap,
    );
}

extern "C" fn timer_trap(frame: &TaskContext) {
    // Acknowledge first: the handler may switch away for a long time.
    pic_end_of_interrupt();
    kernel().on_timer(frame);
}

extern "C" fn page_fault_trap(frame: &TaskContext, error: u64, address: u64) {
    kernel().on_page_fault(
        frame,
        VirtualAddress::new(address),
        PageFaultError::from_bits(error),
    );
}

extern "C" fn syscall_trap(frame: &mut TaskContext) {
    kernel().on_syscall(frame);
}
