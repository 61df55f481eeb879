//! # Paging Layout Descriptors
//!
//! A [`PagingLayout`] lists the index width of every table level, top level
//! first, plus the width of the in-page offset. The walker is written against
//! a layout instead of hard-coding four x86-64 levels:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L0   |  L1   |  L2   |  L3   | Offset |     X86_64_4LEVEL = [9, 9, 9, 9] + 12
//! ```
//!
//! The index at level `n` is the slice of address bits between the cumulative
//! width of the levels above and below `n`.

use crate::addresses::VirtualAddress;
use crate::page_table::TABLE_ENTRIES;

/// Deepest hierarchy supported (x86-64 LA57 uses five levels).
pub const MAX_DEPTH: usize = 5;

/// Index widths of a paging hierarchy.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PagingLayout {
    level_bits: &'static [u32],
    page_shift: u32,
}

/// Four-level x86-64 paging with 4 KiB pages.
pub const X86_64_4LEVEL: PagingLayout = PagingLayout::new(&[9, 9, 9, 9], 12);

impl PagingLayout {
    /// Creates a layout; level widths are listed from the top level down.
    ///
    /// # Panics
    /// In `const` context (compile time) if there are no levels, more than
    /// [`MAX_DEPTH`] levels, or a level wider than one table frame can index.
    #[must_use]
    pub const fn new(level_bits: &'static [u32], page_shift: u32) -> Self {
        assert!(!level_bits.is_empty() && level_bits.len() <= MAX_DEPTH);
        let mut i = 0;
        let mut total = page_shift;
        while i < level_bits.len() {
            assert!(level_bits[i] > 0 && (1usize << level_bits[i]) <= TABLE_ENTRIES);
            total += level_bits[i];
            i += 1;
        }
        assert!(total <= 64);
        Self {
            level_bits,
            page_shift,
        }
    }

    /// Number of table levels.
    #[inline]
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.level_bits.len()
    }

    /// The level whose entries map frames.
    #[inline]
    #[must_use]
    pub const fn leaf_level(&self) -> usize {
        self.level_bits.len() - 1
    }

    #[inline]
    #[must_use]
    pub const fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// Entries used in a table at `level`.
    #[inline]
    #[must_use]
    pub const fn entries(&self, level: usize) -> usize {
        1 << self.level_bits[level]
    }

    /// Total translated address bits.
    #[must_use]
    pub const fn address_bits(&self) -> u32 {
        self.shift(0) + self.level_bits[0]
    }

    /// Bit position of the lowest address bit indexed at `level`.
    #[must_use]
    pub const fn shift(&self, level: usize) -> u32 {
        let mut shift = self.page_shift;
        let mut i = level + 1;
        while i < self.level_bits.len() {
            shift += self.level_bits[i];
            i += 1;
        }
        shift
    }

    /// Table index selected by `va` at `level`.
    #[inline]
    #[must_use]
    pub const fn index(&self, va: VirtualAddress, level: usize) -> usize {
        let mask = (1u64 << self.level_bits[level]) - 1;
        ((va.as_u64() >> self.shift(level)) & mask) as usize
    }

    /// Rebuilds a canonical address from raw translated bits by sign-extending
    /// the highest translated bit.
    #[must_use]
    pub const fn canonical(&self, raw: u64) -> VirtualAddress {
        let bits = self.address_bits();
        if bits >= 64 {
            return VirtualAddress::new(raw);
        }
        let unused = 64 - bits;
        VirtualAddress::new((((raw << unused) as i64) >> unused) as u64)
    }

    /// `true` if `va` survives sign extension unchanged.
    #[inline]
    #[must_use]
    pub const fn is_canonical(&self, va: VirtualAddress) -> bool {
        self.canonical(va.as_u64()).as_u64() == va.as_u64()
    }
}
