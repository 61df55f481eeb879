//! Typed physical and virtual addresses.

use core::fmt;
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};

/// A virtual address in some address space.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct VirtualAddress(u64);

/// A physical address.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct PhysicalAddress(u64);

/// A physical frame, identified by its frame number (`address >> 12`).
///
/// Page tables and task memory are allocated in units of frames.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct PhysicalFrame(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(va: u64) -> Self {
        Self(va)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The address of the page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Advances the address by `pages` pages, wrapping at the top of the range.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, pages: u64) -> Self {
        Self(self.0.wrapping_add(pages << PAGE_SHIFT))
    }
}

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(pa: u64) -> Self {
        Self(pa)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The frame containing this address.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalFrame {
        PhysicalFrame(self.0 >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn frame_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl PhysicalFrame {
    #[inline]
    #[must_use]
    pub const fn from_number(number: u64) -> Self {
        Self(number)
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0
    }

    /// The first byte of the frame.
    #[inline]
    #[must_use]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress(self.0 << PAGE_SHIFT)
    }

    /// The physical address `offset` bytes into the frame.
    #[inline]
    #[must_use]
    pub const fn at(self, offset: u64) -> PhysicalAddress {
        PhysicalAddress((self.0 << PAGE_SHIFT) | (offset & (PAGE_SIZE - 1)))
    }
}

impl From<u64> for VirtualAddress {
    fn from(va: u64) -> Self {
        Self(va)
    }
}

impl From<u64> for PhysicalAddress {
    fn from(pa: u64) -> Self {
        Self(pa)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA({:#018x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA({:#x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#x})", self.start().as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_math() {
        let va = VirtualAddress::new(0x1234_5678);
        assert_eq!(va.page_base().as_u64(), 0x1234_5000);
        assert_eq!(va.page_offset(), 0x678);
        assert!(!va.is_page_aligned());
        assert_eq!(va.page_base().add_pages(2).as_u64(), 0x1234_7000);
    }

    #[test]
    fn frame_roundtrip_keeps_offset() {
        let pa = PhysicalAddress::new(0x0020_0abc);
        let frame = pa.frame();
        assert_eq!(frame.number(), 0x200);
        assert_eq!(frame.start().as_u64(), 0x0020_0000);
        assert_eq!(frame.at(pa.frame_offset()), pa);
    }

    #[test]
    fn debug_formatting() {
        assert_eq!(
            format!("{:?}", VirtualAddress::new(0x1000)),
            "VA(0x0000000000001000)"
        );
        assert_eq!(format!("{:?}", PhysicalFrame::from_number(2)), "Frame(0x2000)");
    }
}
