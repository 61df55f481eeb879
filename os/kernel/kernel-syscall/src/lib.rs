//! # System Calls
//!
//! User code traps with `int 0x80`, the call number in `rax` and up to three
//! arguments in `rdi`, `rsi` and `rdx`. The result comes back in `rax`:
//! a non-negative value on success, a negated error number otherwise.
//!
//! | `rax` | call            | `rdi`      | `rsi`   | `rdx`       | returns          |
//! |-------|-----------------|------------|---------|-------------|------------------|
//! | 1     | [`Sysno::Exit`] | status     |         |             | never            |
//! | 2     | [`Sysno::Clone`]|            |         |             | child id, 0 in the child |
//! | 3     | [`Sysno::Wait`] | task id    |         |             | exit status (low 32 bits) |
//! | 4     | [`Sysno::Map`]  | address    | pages   | [`MapFlags`]| 0                |
//! | 5     | [`Sysno::Log`]  | buffer     | length  |             | bytes logged     |
//!
//! This crate only decodes and routes; the kernel does the work through
//! [`SyscallHandler`].

#![cfg_attr(not(test), no_std)]

mod error;
mod syscall;

pub use error::{Errno, SyscallError};
pub use syscall::{MapFlags, Syscall, SyscallHandler, Sysno, dispatch};
