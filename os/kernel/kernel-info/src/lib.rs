//! # Kernel Configuration
//!
//! Compile-time layout and sizing constants shared by the memory manager,
//! the scheduler and the trap layer. Everything here is a `const`, checked by
//! `const` assertions, so an inconsistent configuration fails the build.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Private range (per task)      │
//!                       │   code, data, heap, user stack  │
//! USER_STACK_TOP        ├─────────────────────────────────┤ 0x0000_7fff_ffff_f000
//!                       │   non-canonical hole            │
//! PUBLIC_BOUNDARY       ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │   Public range (kernel-shared,  │
//!                       │   aliased into every task)      │
//! HHDM_BASE             │   direct map of physical RAM    │ 0xffff_8880_0000_0000
//! KERNEL_STACKS_BASE    │   per-task kernel stack slots   │ 0xffff_c000_0000_0000
//! COPY_WINDOW_BASE      │   two-page frame copy window    │ 0xffff_d000_0000_0000
//! KERNEL_BASE           │   kernel text & data            │ 0xffff_ffff_8000_0000
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The public range is backed by top-level table slots that the kernel
//! address space creates once at boot. Task address spaces copy those slots
//! and never free them.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
pub mod tasks;
