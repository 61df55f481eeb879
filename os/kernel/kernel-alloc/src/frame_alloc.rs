//! Bitmap physical frame allocator.

use kernel_sync::IrqSpinLock;
use kernel_vmem::{FrameAlloc, PhysicalFrame};

/// Tracks up to `WORDS * 64` consecutive frames with one bit each
/// (`1` = in use). Needs no heap, so it can live in a `static`.
pub struct BitmapFrameAlloc<const WORDS: usize> {
    state: IrqSpinLock<Bitmap<WORDS>>,
}

struct Bitmap<const WORDS: usize> {
    used: [u64; WORDS],
    first: u64,
    frames: usize,
    free: usize,
    /// Word to start the next search at.
    hint: usize,
}

impl<const WORDS: usize> BitmapFrameAlloc<WORDS> {
    /// Largest number of frames this allocator can track.
    pub const CAPACITY: usize = WORDS * 64;

    /// Manages `frames` frames starting at `first`, all initially free.
    ///
    /// # Panics
    /// If `frames` exceeds [`Self::CAPACITY`].
    #[must_use]
    pub const fn new(first: PhysicalFrame, frames: usize) -> Self {
        assert!(frames <= Self::CAPACITY, "bitmap too small");
        let mut used = [0u64; WORDS];
        let mut i = frames;
        while i < Self::CAPACITY {
            used[i / 64] |= 1 << (i % 64);
            i += 1;
        }
        Self {
            state: IrqSpinLock::new(Bitmap {
                used,
                first: first.number(),
                frames,
                free: frames,
                hint: 0,
            }),
        }
    }

    /// Marks `frame` as in use, e.g. because the boot image occupies it.
    /// Reserving a frame twice is harmless.
    pub fn reserve(&self, frame: PhysicalFrame) {
        self.state.with_lock(|map| {
            if let Some(i) = map.index(frame)
                && !map.is_used(i)
            {
                map.set(i, true);
                map.free -= 1;
            }
        });
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.state.lock().free
    }

    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.state.lock().frames
    }

    /// `true` if `frame` is managed here and currently handed out.
    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalFrame) -> bool {
        let map = self.state.lock();
        map.index(frame).is_some_and(|i| map.is_used(i))
    }
}

impl<const WORDS: usize> Bitmap<WORDS> {
    fn index(&self, frame: PhysicalFrame) -> Option<usize> {
        let n = frame.number().checked_sub(self.first)?;
        usize::try_from(n).ok().filter(|&i| i < self.frames)
    }

    fn is_used(&self, i: usize) -> bool {
        self.used[i / 64] & (1 << (i % 64)) != 0
    }

    fn set(&mut self, i: usize, used: bool) {
        if used {
            self.used[i / 64] |= 1 << (i % 64);
        } else {
            self.used[i / 64] &= !(1 << (i % 64));
        }
    }
}

impl<const WORDS: usize> FrameAlloc for BitmapFrameAlloc<WORDS> {
    fn allocate(&self) -> Option<PhysicalFrame> {
        let mut map = self.state.lock();
        if map.free == 0 {
            return None;
        }
        for step in 0..WORDS {
            let w = (map.hint + step) % WORDS;
            let word = map.used[w];
            if word == u64::MAX {
                continue;
            }
            let i = w * 64 + word.trailing_ones() as usize;
            map.set(i, true);
            map.free -= 1;
            map.hint = w;
            return Some(PhysicalFrame::from_number(map.first + i as u64));
        }
        None
    }

    /// # Panics
    /// Freeing a frame that is not allocated, or not managed here, is a fatal
    /// bookkeeping error.
    fn free(&self, frame: PhysicalFrame) {
        let mut map = self.state.lock();
        let Some(i) = map.index(frame) else {
            log::error!("free of foreign frame {frame:?}");
            panic!("frame {frame:?} is not managed by this allocator");
        };
        if !map.is_used(i) {
            log::error!("double free of frame {frame:?}");
            panic!("double free of frame {frame:?}");
        }
        map.set(i, false);
        map.free += 1;
        map.hint = i / 64;
    }
}
