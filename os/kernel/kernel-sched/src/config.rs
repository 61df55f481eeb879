//! # Scheduler Configuration
//!
//! Segment selectors the boot code's GDT provides, plus the task limits from
//! [`kernel_info::tasks`].

pub use kernel_info::memory::{STACK_PAGES, STACK_SIZE, USER_STACK_TOP};
pub use kernel_info::tasks::{INITIAL_RFLAGS, MAX_TASK_ID};

/// Kernel code segment (GDT index 1, RPL 0).
pub const KERNEL_CS: u64 = 0x08;

/// Kernel data/stack segment (GDT index 2, RPL 0).
pub const KERNEL_SS: u64 = 0x10;

/// User code segment (GDT index 3, RPL 3).
pub const USER_CS: u64 = 0x18 | 3;

/// User data/stack segment (GDT index 4, RPL 3).
pub const USER_SS: u64 = 0x20 | 3;

/// `RFLAGS.IF`.
pub const RFLAGS_IF: u64 = 1 << 9;

const _: () = {
    assert!(INITIAL_RFLAGS & RFLAGS_IF != 0);
    assert!(USER_CS & 3 == 3 && USER_SS & 3 == 3);
    assert!(KERNEL_CS & 3 == 0 && KERNEL_SS & 3 == 0);
};
