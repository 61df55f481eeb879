//! # Virtual Memory Support
//!
//! Generic multi-level page tables and per-task address spaces.
//!
//! ## What you get
//! - [`PageEntryBits`]: the hardware entry layout, including the OS-defined
//!   *deferred* (reserved, not yet backed) and *owned* markers.
//! - [`PagingLayout`]: index widths of each table level; [`X86_64_4LEVEL`] is
//!   the four-level x86-64 layout.
//! - [`PageTableWalker`]: finds, creates and destroys entries at any level.
//! - [`AddressSpace`]: map/unmap/resolve, demand paging, full-copy duplication
//!   and activation of a hierarchy, split at a fixed boundary into a private
//!   range and a public range shared by every space.
//! - The seams to the outside world: [`FrameAlloc`] hands out frames,
//!   [`PhysMapper`] makes a frame's contents reachable, [`Mmu`] installs a
//!   hierarchy on the CPU.
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L0   |  L1   |  L2   |  L3   | Offset |
//!
//!  root (L0) → L1 → L2 → L3 → frame
//! ```
//!
//! Each table is one frame of 512 entries. Intermediate entries point to the
//! next table; leaf entries name a frame or a deferred reservation.
//!
//! ## Leaf states
//!
//! ```text
//!   Absent ──map_page(DEFER)──► Deferred ──handle_fault──► Present
//!     │  ▲                         │                          │
//!     │  └──────unmap_page─────────┼──────────────────────────┘
//!     └─────────map_page / map_page_to──────────────────────► Present
//! ```

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod addresses;
pub mod layout;
mod page_entry_bits;
mod page_table;
pub mod walker;

pub use crate::address_space::{AddressSpace, CopyWindow, FaultError, MapError, SpaceKind};
pub use crate::addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
pub use crate::layout::{PagingLayout, X86_64_4LEVEL};
pub use crate::page_entry_bits::{PageEntryBits, PageFlags};
pub use crate::page_table::{PageTable, TABLE_ENTRIES};
pub use crate::walker::{EntryInit, EntrySlot, PageTableWalker};

/// Source of physical frames.
///
/// Frames are handed out uninitialized; users zero them as needed.
pub trait FrameAlloc {
    /// Takes one free frame, or `None` if memory is exhausted.
    fn allocate(&self) -> Option<PhysicalFrame>;

    /// Returns `frame` to the pool.
    fn free(&self, frame: PhysicalFrame);
}

/// Makes the contents of a physical frame addressable by the kernel.
pub trait PhysMapper {
    /// Returns a mutable reference to a `T` placed at the start of `frame`.
    ///
    /// # Safety
    /// - `frame` must be backed by memory reachable through this mapper.
    /// - `T` must fit into one frame and need at most 4 KiB alignment.
    /// - The caller must not create overlapping live references.
    unsafe fn frame_to_mut<'a, T>(&self, frame: PhysicalFrame) -> &'a mut T;

    /// The 4 KiB contents of `frame`.
    ///
    /// # Safety
    /// As for [`PhysMapper::frame_to_mut`].
    #[inline]
    unsafe fn frame_bytes<'a>(&self, frame: PhysicalFrame) -> &'a mut [u8; 4096] {
        // SAFETY: forwarded to the caller.
        unsafe { self.frame_to_mut::<[u8; 4096]>(frame) }
    }
}

/// The CPU's translation hardware.
pub trait Mmu {
    /// Root table of the hierarchy the CPU currently translates through.
    fn active_root(&self) -> PhysicalFrame;

    /// Installs the hierarchy rooted at `root`.
    ///
    /// # Safety
    /// The hierarchy must map the code and stack executing the switch.
    unsafe fn load_root(&self, root: PhysicalFrame);

    /// Drops any cached translation for `va`.
    fn flush_page(&self, va: VirtualAddress);

    /// The page `va` lies in, as seen through the active hierarchy.
    ///
    /// # Safety
    /// - `va` must be mapped in the active hierarchy.
    /// - The caller must not create overlapping live references.
    unsafe fn page_bytes<'a>(&self, va: VirtualAddress) -> &'a mut [u8; 4096];
}

/// Align `x` down to the given power-of-two alignment.
///
/// # Examples
/// ```
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    x & !(align - 1)
}

/// Align `x` up to the given power-of-two alignment.
///
/// # Examples
/// ```
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0x1234, 0x1000), 0x2000);
/// assert_eq!(align_up(0x2000, 0x1000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[repr(C, align(4096))]
    struct Aligned4K([u8; 4096]);

    /// Small in-process "physical memory": frame `n` is `frames[n]`.
    struct TestPhys {
        frames: RefCell<Vec<Box<Aligned4K>>>,
        next: Cell<u64>,
        freed: RefCell<Vec<PhysicalFrame>>,
    }

    impl TestPhys {
        fn new(count: usize) -> Self {
            let frames = (0..count).map(|_| Box::new(Aligned4K([0xAA; 4096]))).collect();
            Self {
                frames: RefCell::new(frames),
                next: Cell::new(1),
                freed: RefCell::new(Vec::new()),
            }
        }
    }

    impl FrameAlloc for TestPhys {
        fn allocate(&self) -> Option<PhysicalFrame> {
            let n = self.next.get();
            if n as usize >= self.frames.borrow().len() {
                return None;
            }
            self.next.set(n + 1);
            Some(PhysicalFrame::from_number(n))
        }

        fn free(&self, frame: PhysicalFrame) {
            self.freed.borrow_mut().push(frame);
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn frame_to_mut<'a, T>(&self, frame: PhysicalFrame) -> &'a mut T {
            let ptr = self.frames.borrow_mut()[frame.number() as usize]
                .0
                .as_mut_ptr()
                .cast::<T>();
            // SAFETY: every test frame is a live, page-aligned buffer.
            unsafe { &mut *ptr }
        }
    }

    #[test]
    fn walk_creates_each_level_once() {
        let phys = TestPhys::new(16);
        let walker = PageTableWalker::new(X86_64_4LEVEL, &phys, &phys);
        let root = walker.root();

        let va = VirtualAddress::new(0x0000_0040_2010_3000);
        assert!(walker.leaf(va).is_none());

        let slot = walker.get_entry(va, 3, true, None).unwrap();
        assert_eq!(slot.level, 3);
        assert_eq!(slot.index, X86_64_4LEVEL.index(va, 3));
        // root + three new tables
        assert_eq!(phys.next.get(), 5);

        // The walk is stable and allocates nothing new.
        assert_eq!(walker.leaf(va), Some(slot));
        assert_eq!(phys.next.get(), 5);

        // New tables are zeroed and intermediates are maximally permissive.
        let top = walker.read(EntrySlot {
            table: root,
            index: X86_64_4LEVEL.index(va, 0),
            level: 0,
        });
        assert!(top.present() && top.writable() && top.user_access());
        assert!(walker.read(slot).is_unused());
    }

    #[test]
    fn initializer_runs_on_created_entries_only() {
        let phys = TestPhys::new(16);
        let walker = PageTableWalker::new(X86_64_4LEVEL, &phys, &phys);
        let va = VirtualAddress::new(0x1000);
        let calls = Cell::new(0);
        let nx = |e: &mut PageEntryBits| {
            calls.set(calls.get() + 1);
            e.set_no_execute(true);
        };

        walker.get_entry(va, 3, true, Some(&nx)).unwrap();
        assert_eq!(calls.get(), 3);
        walker.get_entry(va.add_pages(1), 3, true, Some(&nx)).unwrap();
        assert_eq!(calls.get(), 3);

        let l2 = walker.get_entry(va, 2, false, None).unwrap();
        let mid = walker.get_entry(va, 1, false, None).unwrap();
        assert!(walker.read(mid).no_execute());
        assert!(walker.read(l2).present());
    }

    #[test]
    fn translate_and_for_each_leaf() {
        let phys = TestPhys::new(16);
        let walker = PageTableWalker::new(X86_64_4LEVEL, &phys, &phys);
        let a = VirtualAddress::new(0x4000);
        let b = VirtualAddress::new(0xffff_8000_0000_0000);

        let slot = walker.get_entry(a, 3, true, None).unwrap();
        walker.write(slot, PageEntryBits::leaf(PhysicalFrame::from_number(0x77), PageFlags::empty()));
        let slot = walker.get_entry(b, 3, true, None).unwrap();
        walker.write(slot, PageEntryBits::deferred(PageFlags::KERNEL_DATA));

        assert_eq!(
            walker.translate(VirtualAddress::new(0x4abc)),
            Some(PhysicalAddress::new(0x77abc))
        );
        assert_eq!(walker.translate(b), None);

        let mut seen = Vec::new();
        walker.for_each_leaf(0..512, &mut |va, e| seen.push((va, e.is_deferred())));
        assert_eq!(seen, vec![(a, false), (b, true)]);

        let mut lower = Vec::new();
        walker.for_each_leaf(0..256, &mut |va, _| lower.push(va));
        assert_eq!(lower, vec![a]);
    }

    #[test]
    fn destroy_frees_tables_and_owned_leaves_but_keeps_slots() {
        let phys = TestPhys::new(32);
        let walker = PageTableWalker::new(X86_64_4LEVEL, &phys, &phys);
        let root = walker.root();

        let owned = walker.get_entry(VirtualAddress::new(0x1000), 3, true, None).unwrap();
        let frame = phys.allocate().unwrap();
        walker.write(owned, PageEntryBits::leaf(frame, PageFlags::empty()).with_owned(true));
        let foreign = walker.get_entry(VirtualAddress::new(0x2000), 3, true, None).unwrap();
        walker.write(foreign, PageEntryBits::leaf(PhysicalFrame::from_number(999), PageFlags::empty()));
        walker
            .get_entry(VirtualAddress::new(0xffff_ff80_0000_0000), 3, true, None)
            .unwrap();

        // SAFETY: the hierarchy is never installed and not used afterwards.
        unsafe { walker.destroy(511..512) };
        let freed = phys.freed.borrow();
        // three lower tables, the owned leaf frame and the root
        assert_eq!(freed.len(), 5);
        assert!(freed.contains(&frame));
        assert!(freed.contains(&root));
        assert!(!freed.contains(&PhysicalFrame::from_number(999)));
        assert_eq!(freed.last(), Some(&root));
    }

    #[test]
    #[should_panic(expected = "out of physical frames")]
    fn exhaustion_while_creating_tables_is_fatal() {
        let phys = TestPhys::new(3);
        let walker = PageTableWalker::new(X86_64_4LEVEL, &phys, &phys);
        let _ = walker.get_entry(VirtualAddress::new(0x1000), 3, true, None);
    }
}
