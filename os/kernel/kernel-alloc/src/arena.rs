//! Heap-backed stand-in for physical memory.
//!
//! A [`FrameArena`] owns a block of page-aligned host memory and numbers its
//! pages as if they were physical frames starting at [`FrameArena::BASE`].
//! It allocates those frames like the kernel's allocator does and maps them
//! like the direct map does, so page tables, demand paging and address-space
//! copies run unchanged on the host.

use crate::frame_alloc::BitmapFrameAlloc;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;
use kernel_info::memory::PAGE_SIZE;
use kernel_vmem::{FrameAlloc, PhysMapper, PhysicalFrame};

/// Freshly allocated frames are filled with this byte, so code relying on
/// zeroed memory it never zeroed shows up in tests.
pub const POISON: u8 = 0xA5;

const BITMAP_WORDS: usize = 64;

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

pub struct FrameArena {
    memory: NonNull<Frame>,
    len: usize,
    frames: BitmapFrameAlloc<BITMAP_WORDS>,
}

// SAFETY: the arena hands out frames through the allocator, which serializes
// access to its bitmap; the memory itself is only reached through
// `PhysMapper`, whose callers uphold exclusivity.
unsafe impl Send for FrameArena {}
// SAFETY: see above.
unsafe impl Sync for FrameArena {}

impl FrameArena {
    /// Number of the first frame; frame 0 is never handed out.
    pub const BASE: u64 = 0x100;

    /// Most frames one arena can hold.
    pub const MAX_FRAMES: usize = BitmapFrameAlloc::<BITMAP_WORDS>::CAPACITY;

    /// Creates an arena of `frames` poisoned frames.
    ///
    /// # Panics
    /// If `frames` exceeds [`Self::MAX_FRAMES`].
    #[must_use]
    pub fn new(frames: usize) -> Self {
        assert!(frames <= Self::MAX_FRAMES, "arena of {frames} frames is too large");
        let memory: Box<[Frame]> = (0..frames)
            .map(|_| Frame([POISON; PAGE_SIZE as usize]))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let memory = NonNull::from(Box::leak(memory)).cast::<Frame>();
        log::trace!("frame arena of {frames} frames at {memory:p}");
        Self {
            memory,
            len: frames,
            frames: BitmapFrameAlloc::new(PhysicalFrame::from_number(Self::BASE), frames),
        }
    }

    /// Frames currently handed out.
    #[must_use]
    pub fn allocated_frames(&self) -> usize {
        self.frames.total_frames() - self.frames.free_frames()
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalFrame) -> bool {
        self.frames.is_allocated(frame)
    }

    fn slot(&self, frame: PhysicalFrame) -> NonNull<Frame> {
        let index = frame
            .number()
            .checked_sub(Self::BASE)
            .and_then(|n| usize::try_from(n).ok())
            .filter(|&i| i < self.len);
        let Some(index) = index else {
            log::error!("access to {frame:?} outside the arena");
            panic!("frame {frame:?} lies outside the arena");
        };
        // SAFETY: index is within the allocation.
        unsafe { self.memory.add(index) }
    }
}

impl FrameAlloc for FrameArena {
    fn allocate(&self) -> Option<PhysicalFrame> {
        self.frames.allocate()
    }

    fn free(&self, frame: PhysicalFrame) {
        self.frames.free(frame);
    }
}

impl PhysMapper for FrameArena {
    unsafe fn frame_to_mut<'a, T>(&self, frame: PhysicalFrame) -> &'a mut T {
        debug_assert!(size_of::<T>() <= PAGE_SIZE as usize);
        // SAFETY: the slot is page sized and aligned; the caller guarantees
        // exclusive access for 'a.
        unsafe { &mut *self.slot(frame).as_ptr().cast::<T>() }
    }
}

impl Drop for FrameArena {
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.memory.as_ptr(), self.len);
        // SAFETY: reconstructs the box leaked in `new`.
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl core::fmt::Debug for FrameArena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameArena")
            .field("frames", &self.len)
            .field("allocated", &self.allocated_frames())
            .finish()
    }
}
