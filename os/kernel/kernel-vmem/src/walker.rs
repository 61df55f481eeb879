//! # Page-Table Walker
//!
//! Finds, creates and destroys entries of a page-table hierarchy described by
//! a [`PagingLayout`]. Tables are never touched through raw pointer chains;
//! every table is named by its [`PhysicalFrame`] and reached through the
//! [`PhysMapper`], and entries are addressed as `(table frame, index)` pairs
//! ([`EntrySlot`]).
//!
//! Intermediate entries are created with the most permissive attributes
//! ([`PageEntryBits::table`]); only the leaf carries the attributes a caller
//! asked for.

use crate::addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
use crate::layout::PagingLayout;
use crate::page_entry_bits::PageEntryBits;
use crate::page_table::PageTable;
use crate::{FrameAlloc, PhysMapper};
use core::ops::Range;

/// Location of a single entry: the table holding it and its index there.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EntrySlot {
    pub table: PhysicalFrame,
    pub index: usize,
    pub level: usize,
}

/// Hook applied to a freshly created intermediate entry, e.g. to propagate
/// `NX` over a data-only region.
pub type EntryInit<'a> = &'a dyn Fn(&mut PageEntryBits);

pub struct PageTableWalker<'m, M, A> {
    root: PhysicalFrame,
    layout: PagingLayout,
    mapper: &'m M,
    frames: &'m A,
}

impl<'m, M: PhysMapper, A: FrameAlloc> PageTableWalker<'m, M, A> {
    /// Creates an empty hierarchy with a freshly allocated, zeroed root table.
    ///
    /// # Panics
    /// If no frame is available for the root table.
    pub fn new(layout: PagingLayout, mapper: &'m M, frames: &'m A) -> Self {
        let mut walker = Self {
            root: PhysicalFrame::from_number(0),
            layout,
            mapper,
            frames,
        };
        walker.root = walker.allocate_table(0, VirtualAddress::new(0));
        walker
    }

    /// Wraps an existing hierarchy.
    ///
    /// # Safety
    /// `root` must be a valid top-level table laid out per `layout` whose
    /// intermediate entries all reference valid tables.
    pub const unsafe fn from_root(
        root: PhysicalFrame,
        layout: PagingLayout,
        mapper: &'m M,
        frames: &'m A,
    ) -> Self {
        Self {
            root,
            layout,
            mapper,
            frames,
        }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &PagingLayout {
        &self.layout
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &'m A {
        self.frames
    }

    #[allow(clippy::mut_from_ref)]
    fn table(&self, frame: PhysicalFrame) -> &mut PageTable {
        // SAFETY: every frame passed here is either the root or was read from
        // a present intermediate entry, so it holds a table; callers never keep
        // two references to the same table alive.
        unsafe { self.mapper.frame_to_mut::<PageTable>(frame) }
    }

    #[inline]
    #[must_use]
    pub fn read(&self, slot: EntrySlot) -> PageEntryBits {
        self.table(slot.table).get(slot.index)
    }

    #[inline]
    pub fn write(&self, slot: EntrySlot, entry: PageEntryBits) {
        self.table(slot.table).set(slot.index, entry);
    }

    /// Allocates and zero-fills a table frame.
    ///
    /// # Panics
    /// Frame exhaustion while building page tables is fatal.
    fn allocate_table(&self, level: usize, va: VirtualAddress) -> PhysicalFrame {
        let Some(frame) = self.frames.allocate() else {
            log::error!("out of physical frames creating a level-{level} table for {va:?}");
            panic!("out of physical frames while creating a page table");
        };
        self.table(frame).zero();
        log::trace!("created level-{level} table {frame:?} for {va:?}");
        frame
    }

    /// Locates the entry for `va` at `level` (0 is the top level).
    ///
    /// Walking down, an absent intermediate entry either ends the search
    /// (`create == false`, returns `None`) or gets a new zeroed table attached,
    /// is marked present, and then handed to `init`.
    ///
    /// # Panics
    /// If `level` is deeper than the layout, or if a table cannot be allocated.
    pub fn get_entry(
        &self,
        va: VirtualAddress,
        level: usize,
        create: bool,
        init: Option<EntryInit<'_>>,
    ) -> Option<EntrySlot> {
        assert!(level < self.layout.depth(), "level {level} out of range");
        let mut table = self.root;
        for current in 0..level {
            let slot = EntrySlot {
                table,
                index: self.layout.index(va, current),
                level: current,
            };
            let entry = self.read(slot);
            if entry.present() {
                if entry.large_page() {
                    return None;
                }
                table = entry.frame();
                continue;
            }
            if !create {
                return None;
            }
            let child = self.allocate_table(current + 1, va);
            let mut entry = PageEntryBits::table(child);
            if let Some(init) = init {
                init(&mut entry);
            }
            self.write(slot, entry);
            table = child;
        }
        Some(EntrySlot {
            table,
            index: self.layout.index(va, level),
            level,
        })
    }

    /// The leaf slot for `va`, if all tables above it exist.
    #[inline]
    #[must_use]
    pub fn leaf(&self, va: VirtualAddress) -> Option<EntrySlot> {
        self.get_entry(va, self.layout.leaf_level(), false, None)
    }

    /// Translates `va` if its leaf is present.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let entry = self.read(self.leaf(va)?);
        entry
            .present()
            .then(|| entry.frame().at(va.page_offset()))
    }

    /// Calls `f` for every present or deferred leaf reachable through the
    /// top-level slots in `top`, in ascending address order.
    pub fn for_each_leaf(
        &self,
        top: Range<usize>,
        f: &mut dyn FnMut(VirtualAddress, PageEntryBits),
    ) {
        self.visit(self.root, 0, top, 0, f);
    }

    fn visit(
        &self,
        table: PhysicalFrame,
        level: usize,
        indices: Range<usize>,
        base: u64,
        f: &mut dyn FnMut(VirtualAddress, PageEntryBits),
    ) {
        let shift = self.layout.shift(level);
        let is_leaf = level == self.layout.leaf_level();
        for index in indices {
            let entry = self.table(table).get(index);
            let raw = base | ((index as u64) << shift);
            if is_leaf {
                if entry.present() || entry.is_deferred() {
                    f(self.layout.canonical(raw), entry);
                }
            } else if entry.present() && !entry.large_page() {
                let children = 0..self.layout.entries(level + 1);
                self.visit(entry.frame(), level + 1, children, raw, f);
            }
        }
    }

    /// Frees every table of the hierarchy, and every leaf frame marked owned,
    /// except the subtrees behind the top-level slots in `keep`.
    ///
    /// The root itself is freed last.
    ///
    /// # Safety
    /// The hierarchy must not be installed on the CPU, and neither this walker
    /// nor any other view of the same root may be used afterwards.
    pub unsafe fn destroy(&self, keep: Range<usize>) {
        for index in 0..self.layout.entries(0) {
            if keep.contains(&index) {
                continue;
            }
            let entry = self.table(self.root).get(index);
            self.release(entry, 0);
        }
        self.frames.free(self.root);
    }

    fn release(&self, entry: PageEntryBits, level: usize) {
        if !entry.present() {
            return;
        }
        if level == self.layout.leaf_level() {
            if entry.owned() {
                self.frames.free(entry.frame());
            }
            return;
        }
        if entry.large_page() {
            return;
        }
        let child = entry.frame();
        for index in 0..self.layout.entries(level + 1) {
            let e = self.table(child).get(index);
            self.release(e, level + 1);
        }
        self.frames.free(child);
    }
}
