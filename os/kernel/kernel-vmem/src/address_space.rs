//! # Address Space
//!
//! One page-table hierarchy plus the rules for using it. The virtual range is
//! split at a fixed **boundary**:
//!
//! - below it, pages are **private** to this address space;
//! - at and above it, pages are **public**: the kernel address space creates
//!   the top-level tables of that range once, and every task address space
//!   aliases them by copying the top-level entries.
//!
//! ## Highlights
//!
//! - [`AddressSpace::map_page_to`], [`AddressSpace::map_range_to`] map known frames.
//! - [`AddressSpace::map_page`], [`AddressSpace::map_range`] allocate frames, or only
//!   reserve the pages when [`PageFlags::DEFER`] is set.
//! - [`AddressSpace::handle_fault`] backs a deferred page on first access.
//! - [`AddressSpace::duplicate`] copies every private page into a new space.
//! - [`AddressSpace::activate`] installs the hierarchy on the CPU.
//!
//! ## Fatal misuse
//!
//! Mapping a page that is already present, unmapping a page that is not,
//! putting a private page above the boundary (or a public page below it), and
//! running out of frames while building tables all halt with a panic after
//! logging diagnostics. [`AddressSpace::check_mapping`] lets callers that
//! act on untrusted input validate a request first.

use crate::addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
use crate::layout::PagingLayout;
use crate::page_entry_bits::{PageEntryBits, PageFlags};
use crate::walker::{EntryInit, EntrySlot, PageTableWalker};
use crate::{FrameAlloc, Mmu, PhysMapper};
use core::ops::Range;
use kernel_info::memory::COPY_WINDOW_BASE;

/// Which role an address space plays.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SpaceKind {
    /// Owns the public range's tables.
    Kernel,
    /// Aliases the public range; owns only what lies below the boundary.
    Process,
}

/// Why a page fault could not be resolved by demand paging.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    #[error("no page-table entry covers {0:?}")]
    NotMapped(VirtualAddress),
    #[error("page {0:?} is already present")]
    AlreadyPresent(VirtualAddress),
    #[error("page {0:?} is not a deferred reservation")]
    NotDeferred(VirtualAddress),
}

/// Why a mapping request is invalid.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("{0:?} is not page aligned")]
    Misaligned(VirtualAddress),
    #[error("{0:?} is not canonical")]
    NonCanonical(VirtualAddress),
    #[error("private page {0:?} lies above the public boundary")]
    PrivateAboveBoundary(VirtualAddress),
    #[error("public page {0:?} lies below the public boundary")]
    PublicBelowBoundary(VirtualAddress),
}

/// Two public pages the kernel borrows to reach a source and a target frame
/// while copying.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CopyWindow {
    source: VirtualAddress,
    target: VirtualAddress,
}

impl CopyWindow {
    /// The window at [`COPY_WINDOW_BASE`].
    pub const DEFAULT: Self = Self::new(VirtualAddress::new(COPY_WINDOW_BASE));

    /// A window made of the page at `base` and the one after it.
    #[must_use]
    pub const fn new(base: VirtualAddress) -> Self {
        Self {
            source: base,
            target: base.add_pages(1),
        }
    }

    #[must_use]
    pub const fn source(&self) -> VirtualAddress {
        self.source
    }

    #[must_use]
    pub const fn target(&self) -> VirtualAddress {
        self.target
    }
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper, A: FrameAlloc> {
    walker: PageTableWalker<'m, M, A>,
    boundary: VirtualAddress,
    kind: SpaceKind,
}

impl<'m, M: PhysMapper, A: FrameAlloc> AddressSpace<'m, M, A> {
    /// Creates the kernel address space and every top-level table of the
    /// public range, so later task spaces can alias them.
    ///
    /// # Panics
    /// If `boundary` does not start a top-level slot, or frames run out.
    pub fn new_kernel(
        layout: PagingLayout,
        boundary: VirtualAddress,
        mapper: &'m M,
        frames: &'m A,
    ) -> Self {
        let slot_size = 1u64 << layout.shift(0);
        assert!(
            boundary.as_u64().is_multiple_of(slot_size),
            "boundary {boundary:?} does not start a top-level slot"
        );
        let space = Self {
            walker: PageTableWalker::new(layout, mapper, frames),
            boundary,
            kind: SpaceKind::Kernel,
        };
        let shift = layout.shift(0);
        for index in space.shared_slots() {
            let va = layout.canonical((index as u64) << shift);
            space.walker.get_entry(va, 1.min(layout.leaf_level()), true, None);
        }
        log::debug!(
            "kernel address space {:?}, public from {:?}",
            space.root(),
            boundary
        );
        space
    }

    /// Creates an empty task address space sharing this kernel space's public
    /// range.
    ///
    /// # Panics
    /// If `self` is not the kernel space, or no frame is left for the root.
    #[must_use]
    pub fn new_process(&self) -> Self {
        assert_eq!(self.kind, SpaceKind::Kernel, "tasks derive from the kernel space");
        let walker = PageTableWalker::new(
            *self.walker.layout(),
            self.walker.mapper(),
            self.walker.frames(),
        );
        for index in self.shared_slots() {
            let from = EntrySlot {
                table: self.root(),
                index,
                level: 0,
            };
            let to = EntrySlot {
                table: walker.root(),
                ..from
            };
            walker.write(to, self.walker.read(from));
        }
        log::debug!("new address space {:?}", walker.root());
        Self {
            walker,
            boundary: self.boundary,
            kind: SpaceKind::Process,
        }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalFrame {
        self.walker.root()
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn boundary(&self) -> VirtualAddress {
        self.boundary
    }

    #[inline]
    #[must_use]
    pub const fn walker(&self) -> &PageTableWalker<'m, M, A> {
        &self.walker
    }

    /// Top-level slots of the public range.
    #[must_use]
    pub const fn shared_slots(&self) -> Range<usize> {
        let layout = self.walker.layout();
        layout.index(self.boundary, 0)..layout.entries(0)
    }

    /// Validates a single-page request without touching any table.
    ///
    /// # Errors
    /// Returns the first rule `va` and `flags` break.
    pub fn check_mapping(&self, va: VirtualAddress, flags: PageFlags) -> Result<(), MapError> {
        if !va.is_page_aligned() {
            return Err(MapError::Misaligned(va));
        }
        if !self.walker.layout().is_canonical(va) {
            return Err(MapError::NonCanonical(va));
        }
        let public = flags.contains(PageFlags::PUBLIC);
        match (va >= self.boundary, public) {
            (true, false) => Err(MapError::PrivateAboveBoundary(va)),
            (false, true) => Err(MapError::PublicBelowBoundary(va)),
            _ => Ok(()),
        }
    }

    /// Finds (creating tables as needed) the leaf for a mappable, currently
    /// unmapped `va`.
    fn vacant_leaf(&self, va: VirtualAddress, flags: PageFlags) -> EntrySlot {
        if let Err(e) = self.check_mapping(va, flags) {
            log::error!("refusing to map {va:?} with {flags:?} in {:?}: {e}", self.root());
            panic!("invalid mapping: {e}");
        }
        let leaf_level = self.walker.layout().leaf_level();
        let Some(slot) = self.walker.get_entry(va, leaf_level, true, None) else {
            log::error!("{va:?} is covered by a large page in {:?}", self.root());
            panic!("cannot map inside a large page");
        };
        let existing = self.walker.read(slot);
        if existing.present() {
            log::error!(
                "double map of {va:?} in {:?}: already backed by {:?}",
                self.root(),
                existing.frame()
            );
            panic!("page {va:?} is already mapped");
        }
        slot
    }

    /// Maps exactly one page `va → frame`.
    ///
    /// A deferred reservation at `va` is replaced. The frame stays owned by
    /// the caller.
    ///
    /// # Panics
    /// If the page is already present or the request breaks the boundary rule.
    pub fn map_page_to(&self, va: VirtualAddress, frame: PhysicalFrame, flags: PageFlags) {
        let slot = self.vacant_leaf(va, flags);
        self.walker.write(slot, PageEntryBits::leaf(frame, flags));
        log::trace!("mapped {va:?} -> {frame:?} ({flags:?})");
    }

    /// Maps `pages` consecutive pages to consecutive frames starting at `first`.
    pub fn map_range_to(
        &self,
        va: VirtualAddress,
        first: PhysicalFrame,
        pages: u64,
        flags: PageFlags,
    ) {
        for i in 0..pages {
            let frame = PhysicalFrame::from_number(first.number() + i);
            self.map_page_to(va.add_pages(i), frame, flags);
        }
    }

    /// Maps one page backed by a fresh, zeroed frame owned by this space.
    ///
    /// With [`PageFlags::DEFER`], only reserves the page and returns `None`;
    /// the first access faults and [`AddressSpace::handle_fault`] backs it.
    ///
    /// # Panics
    /// As [`AddressSpace::map_page_to`], and on frame exhaustion.
    pub fn map_page(&self, va: VirtualAddress, flags: PageFlags) -> Option<PhysicalFrame> {
        let slot = self.vacant_leaf(va, flags);
        if flags.contains(PageFlags::DEFER) {
            self.walker.write(slot, PageEntryBits::deferred(flags));
            log::trace!("reserved {va:?} ({flags:?})");
            return None;
        }
        let frame = self.allocate_zeroed(va);
        self.walker
            .write(slot, PageEntryBits::leaf(frame, flags).with_owned(true));
        log::trace!("mapped {va:?} -> {frame:?} ({flags:?})");
        Some(frame)
    }

    /// [`AddressSpace::map_page`] for `pages` consecutive pages.
    pub fn map_range(&self, va: VirtualAddress, pages: u64, flags: PageFlags) {
        for i in 0..pages {
            self.map_page(va.add_pages(i), flags);
        }
    }

    /// Creates the tables covering `pages` pages from `va` without mapping
    /// anything, applying `init` to every intermediate entry it creates.
    pub fn reserve_tables(&self, va: VirtualAddress, pages: u64, init: Option<EntryInit<'_>>) {
        let leaf_level = self.walker.layout().leaf_level();
        for i in 0..pages {
            self.walker.get_entry(va.add_pages(i), leaf_level, true, init);
        }
    }

    /// Removes the mapping of `va` and returns the frame it pointed to.
    ///
    /// The frame is not freed; the caller decides what happens to it.
    ///
    /// # Panics
    /// If `va` is not mapped.
    pub fn unmap_page(&self, va: VirtualAddress) -> PhysicalFrame {
        let slot = self.walker.leaf(va.page_base());
        let entry = slot.map(|s| self.walker.read(s));
        match (slot, entry) {
            (Some(slot), Some(entry)) if entry.present() => {
                self.walker.write(slot, PageEntryBits::new());
                log::trace!("unmapped {va:?} (was {:?})", entry.frame());
                entry.frame()
            }
            _ => {
                log::error!("unmap of {va:?} in {:?}, which is not mapped", self.root());
                panic!("page {va:?} is not mapped");
            }
        }
    }

    /// Translates `va`, or `None` if no present leaf covers it.
    #[inline]
    #[must_use]
    pub fn resolve(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.walker.translate(va)
    }

    /// `true` if a present leaf covers `va`.
    #[inline]
    #[must_use]
    pub fn is_page_mapped(&self, va: VirtualAddress) -> bool {
        self.resolve(va).is_some()
    }

    /// The raw leaf entry for `va`, if the tables above it exist.
    #[must_use]
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        self.walker.leaf(va).map(|slot| self.walker.read(slot))
    }

    /// Backs a deferred page on its first access.
    ///
    /// # Errors
    /// Anything but a deferred reservation at `va` is not a demand-paging
    /// fault and must be handled by the caller.
    ///
    /// # Panics
    /// On frame exhaustion.
    pub fn handle_fault(&self, va: VirtualAddress) -> Result<PhysicalFrame, FaultError> {
        let page = va.page_base();
        let slot = self.walker.leaf(page).ok_or(FaultError::NotMapped(va))?;
        let entry = self.walker.read(slot);
        if entry.present() {
            return Err(FaultError::AlreadyPresent(va));
        }
        if !entry.is_deferred() {
            return Err(if entry.is_unused() {
                FaultError::NotMapped(va)
            } else {
                FaultError::NotDeferred(va)
            });
        }
        let frame = self.allocate_zeroed(page);
        self.walker.write(slot, entry.backed_by(frame));
        log::debug!("demand-paged {page:?} -> {frame:?}");
        Ok(frame)
    }

    /// Builds a new task address space holding a private copy of every page
    /// below the boundary. Deferred reservations stay deferred.
    ///
    /// Each frame is copied while both source and target are mapped into the
    /// kernel's `window`; the window is empty again afterwards.
    ///
    /// # Panics
    /// If `self` is not a task space, `kernel` is not the kernel space, or
    /// frames run out.
    #[must_use]
    pub fn duplicate(&self, kernel: &Self, window: &CopyWindow, mmu: &impl Mmu) -> Self {
        assert_eq!(self.kind, SpaceKind::Process, "only task spaces are duplicated");
        let child = kernel.new_process();
        let leaf_level = self.walker.layout().leaf_level();
        let private = 0..self.shared_slots().start;
        let mut copied = 0usize;

        self.walker.for_each_leaf(private, &mut |va, entry| {
            let Some(slot) = child.walker.get_entry(va, leaf_level, true, None) else {
                panic!("cannot duplicate into a large page at {va:?}");
            };
            if entry.is_deferred() {
                child.walker.write(slot, entry);
                return;
            }
            let frame = child.allocate_uninit(va);
            kernel.copy_frame(entry.frame(), frame, window, mmu);
            let copy = entry
                .with_accessed(false)
                .with_dirty(false)
                .backed_by(frame);
            child.walker.write(slot, copy);
            copied += 1;
        });

        log::debug!(
            "duplicated {:?} into {:?}: {copied} pages copied",
            self.root(),
            child.root()
        );
        child
    }

    /// Copies `from` into `to` through the two window pages.
    ///
    /// The window lies in the public range, so it is visible through
    /// whichever hierarchy is active.
    fn copy_frame(&self, from: PhysicalFrame, to: PhysicalFrame, window: &CopyWindow, mmu: &impl Mmu) {
        self.map_page_to(window.source, from, PageFlags::KERNEL_DATA);
        self.map_page_to(window.target, to, PageFlags::KERNEL_DATA);

        // SAFETY: both window pages were just mapped to distinct frames, and
        // nothing else holds a reference to their contents.
        unsafe {
            mmu.page_bytes(window.target)
                .copy_from_slice(mmu.page_bytes(window.source));
        }

        self.unmap_page(window.source);
        self.unmap_page(window.target);
        mmu.flush_page(window.source);
        mmu.flush_page(window.target);
    }

    /// Installs this address space on the CPU.
    ///
    /// `kernel_stack` is an address on the stack executing the switch; it has
    /// to translate to the same memory before and after.
    ///
    /// # Panics
    /// If the stack is unmapped or translates differently in this space.
    pub fn activate(&self, mmu: &impl Mmu, kernel_stack: VirtualAddress) {
        let active = mmu.active_root();
        if active == self.root() {
            return;
        }
        // SAFETY: the active root is a complete hierarchy with our layout; the
        // view is only read.
        let current = unsafe {
            PageTableWalker::from_root(
                active,
                *self.walker.layout(),
                self.walker.mapper(),
                self.walker.frames(),
            )
        };
        let before = current.translate(kernel_stack);
        let after = self.resolve(kernel_stack);
        if before.is_none() || before != after {
            log::error!(
                "kernel stack {kernel_stack:?} resolves to {before:?} in {active:?} but {after:?} in {:?}",
                self.root()
            );
            panic!("kernel stack is not shared by the target address space");
        }
        // SAFETY: the stack in use stays mapped, and so does the public range
        // holding the kernel.
        unsafe { mmu.load_root(self.root()) };
        log::trace!("activated {:?}", self.root());
    }

    /// Tears the space down. Another hierarchy has to be active by now.
    ///
    /// # Panics
    /// If the CPU still translates through this space.
    pub fn destroy(self, mmu: &impl Mmu) {
        if mmu.active_root() == self.root() {
            log::error!("{:?} is still installed and cannot be destroyed", self.root());
            panic!("destroying the active address space");
        }
        drop(self);
    }

    fn allocate_uninit(&self, va: VirtualAddress) -> PhysicalFrame {
        let Some(frame) = self.walker.frames().allocate() else {
            log::error!("out of physical frames backing {va:?} in {:?}", self.root());
            panic!("out of physical frames while backing a page");
        };
        frame
    }

    fn allocate_zeroed(&self, va: VirtualAddress) -> PhysicalFrame {
        let frame = self.allocate_uninit(va);
        // SAFETY: freshly allocated, so unreferenced.
        unsafe { self.walker.mapper().frame_bytes(frame).fill(0) };
        frame
    }
}

impl<M: PhysMapper, A: FrameAlloc> core::fmt::Debug for AddressSpace<'_, M, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root())
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<M: PhysMapper, A: FrameAlloc> Drop for AddressSpace<'_, M, A> {
    /// Frees the tables and owned frames. Task spaces leave the aliased
    /// public slots alone.
    fn drop(&mut self) {
        let keep = match self.kind {
            SpaceKind::Kernel => 0..0,
            SpaceKind::Process => self.shared_slots(),
        };
        log::debug!("destroying address space {:?}", self.root());
        // SAFETY: the space is going away; callers switch to another hierarchy
        // before dropping the installed one.
        unsafe { self.walker.destroy(keep) };
    }
}
