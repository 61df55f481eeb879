use crate::addresses::PhysicalFrame;
use bitfield_struct::bitfield;
use bitflags::bitflags;

/// Represents a single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// The same layout is used at every level of the hierarchy; the MMU reads it
/// directly, so the bit positions below are fixed by the hardware.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS` / `PAT`      | Large page (intermediate) / PAT (leaf) |
/// | 8         | `G`               | Global (leaf only) |
/// | 9         | owned (OS)        | Frame was allocated by the address space |
/// | 10–11     | OS avail low      | Reserved for OS use |
/// | 12–51     | `addr`            | Physical frame number |
/// | 52–62     | OS avail high     | Reserved for OS use |
/// | 63        | `NX`              | Execute disable |
///
/// ### Deferred entries
///
/// A leaf with `P = 0` whose frame field holds [`PageEntryBits::DEFERRED_FRAME`]
/// is a reservation: the virtual page belongs to the address space but has no
/// frame yet. The remaining permission bits are kept so the page fault handler
/// can back it with the attributes requested at reservation time.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a leaf.
    pub dirty: bool,

    /// Page Size (PS, bit 7). Only 4 KiB leaves are created here, so this
    /// stays clear.
    pub large_page: bool,

    /// Global (G, bit 8), **leaf only**.
    pub global_translation: bool,

    /// OS-available bit 9: the leaf's frame was allocated by the owning
    /// address space and is freed together with it.
    pub owned: bool,

    /// OS-available (bits 10..=11).
    #[bits(2)]
    pub os_available_low: u8,

    /// Physical frame number (bits 12..=51).
    #[bits(40)]
    frame_bits: u64,

    /// OS-available (bits 52..=62).
    #[bits(11)]
    pub os_available_high: u16,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

bitflags! {
    /// Attributes requested by a caller when mapping a page.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct PageFlags: u32 {
        const WRITABLE = 1 << 0;
        const USER = 1 << 1;
        const NO_EXECUTE = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const GLOBAL = 1 << 5;
        /// The page belongs to the public range. Without it the page is private.
        const PUBLIC = 1 << 6;
        /// Reserve the page only; a frame is attached on first access.
        const DEFER = 1 << 7;
    }
}

impl PageFlags {
    /// Private, user-accessible read/write data.
    pub const USER_DATA: Self = Self::USER.union(Self::WRITABLE).union(Self::NO_EXECUTE);

    /// Private, user-accessible code.
    pub const USER_CODE: Self = Self::USER;

    /// Public read/write kernel data.
    pub const KERNEL_DATA: Self = Self::PUBLIC.union(Self::WRITABLE).union(Self::NO_EXECUTE);
}

impl PageEntryBits {
    const FRAME_MASK: u64 = (1 << 40) - 1;

    /// Frame number stored in a deferred leaf.
    pub const DEFERRED_FRAME: u64 = Self::FRAME_MASK;

    /// An intermediate entry pointing at the next-level table in `frame`.
    ///
    /// Intermediate entries carry the most permissive attributes; only the leaf
    /// restricts access.
    #[inline]
    #[must_use]
    pub const fn table(frame: PhysicalFrame) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_frame_bits(frame.number() & Self::FRAME_MASK)
    }

    /// A present leaf mapping `frame` with the attributes in `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalFrame, flags: PageFlags) -> Self {
        Self::with_attributes(flags)
            .with_present(true)
            .with_frame_bits(frame.number() & Self::FRAME_MASK)
    }

    /// A reserved, not yet backed leaf.
    #[inline]
    #[must_use]
    pub const fn deferred(flags: PageFlags) -> Self {
        Self::with_attributes(flags).with_frame_bits(Self::DEFERRED_FRAME)
    }

    const fn with_attributes(flags: PageFlags) -> Self {
        Self::new()
            .with_writable(flags.contains(PageFlags::WRITABLE))
            .with_user_access(flags.contains(PageFlags::USER))
            .with_write_through(flags.contains(PageFlags::WRITE_THROUGH))
            .with_cache_disabled(flags.contains(PageFlags::CACHE_DISABLE))
            .with_global_translation(flags.contains(PageFlags::GLOBAL))
            .with_no_execute(flags.contains(PageFlags::NO_EXECUTE))
    }

    /// `true` for a reserved leaf: not present, frame field holds the sentinel.
    #[inline]
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        !self.present() && self.frame_bits() == Self::DEFERRED_FRAME
    }

    /// `true` if every bit is clear.
    #[inline]
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalFrame {
        PhysicalFrame::from_number(self.frame_bits())
    }

    #[inline]
    pub const fn set_frame(&mut self, frame: PhysicalFrame) {
        self.set_frame_bits(frame.number() & Self::FRAME_MASK);
    }

    /// Turns a deferred reservation into a present, owned leaf backed by `frame`,
    /// keeping the reserved attributes.
    #[inline]
    #[must_use]
    pub const fn backed_by(self, frame: PhysicalFrame) -> Self {
        self.with_present(true)
            .with_owned(true)
            .with_frame_bits(frame.number() & Self::FRAME_MASK)
    }
}
