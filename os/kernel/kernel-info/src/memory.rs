//! # Memory Layout

/// Size of a virtual page and of a physical frame.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// First address of the public (kernel-shared) range.
///
/// Pages below this address are private to one address space; pages at or
/// above it are shared by all of them.
pub const PUBLIC_BOUNDARY: u64 = 0xffff_8000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Pages in each task stack, user and kernel alike.
pub const STACK_PAGES: u64 = 4;

/// Size of one task stack in bytes.
pub const STACK_SIZE: u64 = STACK_PAGES * PAGE_SIZE;

/// Base of the kernel stack slots. Task `n` owns slot `n`.
pub const KERNEL_STACKS_BASE: u64 = 0xffff_c000_0000_0000;

/// Bytes per kernel stack slot: the stack plus one unmapped guard page below it.
pub const KERNEL_STACK_SLOT: u64 = STACK_SIZE + PAGE_SIZE;

/// Two consecutive public pages used to copy frames while duplicating an
/// address space.
pub const COPY_WINDOW_BASE: u64 = 0xffff_d000_0000_0000;

/// Exclusive top of the user stack in every task's private range.
pub const USER_STACK_TOP: u64 = 0x0000_7fff_ffff_f000;

/// Returns the exclusive top of the kernel stack in `slot`.
#[must_use]
pub const fn kernel_stack_top(slot: u32) -> u64 {
    KERNEL_STACKS_BASE + (slot as u64 + 1) * KERNEL_STACK_SLOT
}

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(HHDM_BASE >= PUBLIC_BOUNDARY);
    assert!(KERNEL_STACKS_BASE > HHDM_BASE);
    assert!(COPY_WINDOW_BASE > kernel_stack_top(crate::tasks::MAX_TASK_ID));
    assert!(KERNEL_BASE > COPY_WINDOW_BASE + 2 * PAGE_SIZE);
    assert!(USER_STACK_TOP < PUBLIC_BOUNDARY);
    assert!(USER_STACK_TOP.is_multiple_of(PAGE_SIZE));
};
