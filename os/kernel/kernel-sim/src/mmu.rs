use kernel_alloc::FrameArena;
use kernel_vmem::{Mmu, PageTableWalker, PhysMapper, PhysicalFrame, VirtualAddress, X86_64_4LEVEL};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Records what the scheduler asks of the MMU and translates through the
/// tables it was told to load.
#[derive(Debug)]
pub struct SimMmu {
    arena: &'static FrameArena,
    active: AtomicU64,
    loads: AtomicUsize,
    flushes: AtomicUsize,
}

impl SimMmu {
    /// Starts out on frame 0, standing in for the boot loader's tables.
    #[must_use]
    pub const fn new(arena: &'static FrameArena) -> Self {
        Self {
            arena,
            active: AtomicU64::new(0),
            loads: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    /// Number of root loads so far.
    #[must_use]
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl Mmu for SimMmu {
    fn active_root(&self) -> PhysicalFrame {
        PhysicalFrame::from_number(self.active.load(Ordering::Acquire))
    }

    unsafe fn load_root(&self, root: PhysicalFrame) {
        self.active.store(root.number(), Ordering::Release);
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_page(&self, _va: VirtualAddress) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn page_bytes<'a>(&self, va: VirtualAddress) -> &'a mut [u8; 4096] {
        let root = self.active_root();
        // SAFETY: the scheduler only loads roots it built from this arena.
        let walker = unsafe { PageTableWalker::from_root(root, X86_64_4LEVEL, self.arena, self.arena) };
        let Some(pa) = walker.translate(va) else {
            panic!("{va:?} is not mapped in the active tables {root:?}");
        };
        // SAFETY: forwarded to the caller.
        unsafe { self.arena.frame_bytes(pa.frame()) }
    }
}
