//! # Task Limits

/// Largest task id handed out before the id allocator wraps around to 1.
///
/// Id 0 is never assigned.
pub const MAX_TASK_ID: u32 = 4095;

/// `RFLAGS` value new tasks start with: only `IF` (bit 9) set.
pub const INITIAL_RFLAGS: u64 = 1 << 9;

/// Longest buffer the `log` system call forwards to the kernel log.
pub const MAX_LOG_BYTES: usize = 256;

/// Most pages a single `map` system call may request.
pub const MAX_MAP_PAGES: u64 = 512;

/// Exit status of a task killed by a page fault it caused.
pub const FAULT_EXIT_STATUS: i32 = -14;
