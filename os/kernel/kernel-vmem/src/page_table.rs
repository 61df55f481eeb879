use crate::page_entry_bits::PageEntryBits;

/// Entries in one table frame: 4096 bytes / 8 bytes per entry.
pub const TABLE_ENTRIES: usize = 512;

/// One page table: a 4 KiB-aligned frame of 512 raw entries.
///
/// Tables at every level share this shape. A layout with fewer index bits
/// at some level simply leaves the upper entries of that table unused.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; TABLE_ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> PageEntryBits {
        self.entries[index]
    }

    #[inline]
    pub fn set(&mut self, index: usize, entry: PageEntryBits) {
        self.entries[index] = entry;
    }

    /// `true` if no entry is in use (neither present nor reserved).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(PageEntryBits::is_unused)
    }
}
