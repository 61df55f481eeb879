//! # Physical Memory Services
//!
//! The page-table code in `kernel-vmem` treats physical memory as two
//! services: a [`FrameAlloc`](kernel_vmem::FrameAlloc) that hands out and takes
//! back 4 KiB frames, and a [`PhysMapper`](kernel_vmem::PhysMapper) that makes
//! a frame's bytes reachable. This crate provides both for the kernel and for
//! hosted tests:
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │ BitmapFrameAlloc             │   │ HhdmPhysMapper               │
//! │  1 bit per frame, no heap    │   │  frame → HHDM_BASE + pa      │
//! └──────────────────────────────┘   └──────────────────────────────┘
//!              kernel (bare metal)
//!
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ FrameArena                                                       │
//! │  heap-backed "physical memory": frame n ↔ arena slot n - base    │
//! │  allocator and mapper in one                                     │
//! └──────────────────────────────────────────────────────────────────┘
//!              hosted tests and simulation
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::frame_alloc::BitmapFrameAlloc;
//! use kernel_vmem::{FrameAlloc, PhysicalFrame};
//!
//! let frames = BitmapFrameAlloc::<1>::new(PhysicalFrame::from_number(0x100), 64);
//! let frame = frames.allocate().unwrap();
//! assert_eq!(frames.free_frames(), 63);
//! frames.free(frame);
//! assert_eq!(frames.free_frames(), 64);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod arena;
pub mod frame_alloc;
pub mod phys_mapper;

pub use arena::FrameArena;
pub use frame_alloc::BitmapFrameAlloc;
pub use phys_mapper::HhdmPhysMapper;
