//! # Stack Traces
//!
//! Follows the chain of saved frame pointers: `[rbp]` holds the caller's
//! `rbp`, `[rbp + 8]` the return address. Every word is looked up in the
//! address space before it is read, so a corrupt chain ends the walk instead
//! of faulting again.

use kernel_vmem::{AddressSpace, FrameAlloc, PhysMapper, VirtualAddress};

/// Frames reported at most.
pub const MAX_DEPTH: usize = 32;

/// Return addresses of the frames starting at `rbp`, innermost first.
pub const fn walk<'a, 'm, M: PhysMapper, A: FrameAlloc>(
    space: &'a AddressSpace<'m, M, A>,
    rbp: u64,
) -> Frames<'a, 'm, M, A> {
    Frames {
        space,
        rbp,
        depth: 0,
    }
}

pub struct Frames<'a, 'm, M: PhysMapper, A: FrameAlloc> {
    space: &'a AddressSpace<'m, M, A>,
    rbp: u64,
    depth: usize,
}

impl<M: PhysMapper, A: FrameAlloc> Frames<'_, '_, M, A> {
    #[allow(clippy::cast_possible_truncation)]
    fn read(&self, at: u64) -> Option<u64> {
        let va = VirtualAddress::new(at);
        if !self.space.is_page_mapped(va) {
            return None;
        }
        let pa = self.space.resolve(va)?;
        // SAFETY: the frame is mapped in `space`; we only read it.
        let bytes = unsafe { self.space.walker().mapper().frame_bytes(pa.frame()) };
        let offset = pa.frame_offset() as usize;
        let word = bytes.get(offset..offset + 8)?;
        Some(u64::from_le_bytes(word.try_into().ok()?))
    }
}

impl<M: PhysMapper, A: FrameAlloc> Iterator for Frames<'_, '_, M, A> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.rbp == 0 || self.depth >= MAX_DEPTH || !self.rbp.is_multiple_of(8) {
            return None;
        }
        let saved = self.read(self.rbp)?;
        let ret = self.read(self.rbp.checked_add(8)?)?;
        self.depth += 1;
        // Stacks grow down, so callers sit at higher addresses.
        self.rbp = if saved > self.rbp { saved } else { 0 };
        Some(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::FrameArena;
    use kernel_info::memory::PUBLIC_BOUNDARY;
    use kernel_vmem::{PageFlags, X86_64_4LEVEL};

    const STACK: u64 = 0x0000_0000_1000_0000;

    fn write(space: &AddressSpace<'_, FrameArena, FrameArena>, at: u64, value: u64) {
        let pa = space.resolve(VirtualAddress::new(at)).unwrap();
        let offset = pa.frame_offset() as usize;
        let bytes = unsafe { space.walker().mapper().frame_bytes(pa.frame()) };
        bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn stops_at_an_unmapped_frame_pointer() {
        let arena = FrameArena::new(512);
        let kernel = AddressSpace::new_kernel(
            X86_64_4LEVEL,
            VirtualAddress::new(PUBLIC_BOUNDARY),
            &arena,
            &arena,
        );
        let space = kernel.new_process();
        space.map_page(VirtualAddress::new(STACK), PageFlags::USER_DATA);

        write(&space, STACK + 0x100, STACK + 0x200);
        write(&space, STACK + 0x108, 0xaaa);
        write(&space, STACK + 0x200, STACK + 0x300);
        write(&space, STACK + 0x208, 0xbbb);
        write(&space, STACK + 0x300, 0x5000_0000);
        write(&space, STACK + 0x308, 0xccc);

        let frames: Vec<u64> = walk(&space, STACK + 0x100).collect();
        assert_eq!(frames, [0xaaa, 0xbbb, 0xccc]);
    }

    #[test]
    fn loops_and_garbage_end_the_walk() {
        let arena = FrameArena::new(512);
        let kernel = AddressSpace::new_kernel(
            X86_64_4LEVEL,
            VirtualAddress::new(PUBLIC_BOUNDARY),
            &arena,
            &arena,
        );
        let space = kernel.new_process();
        space.map_page(VirtualAddress::new(STACK), PageFlags::USER_DATA);

        write(&space, STACK + 0x200, STACK + 0x100);
        write(&space, STACK + 0x208, 0xaaa);
        assert_eq!(walk(&space, STACK + 0x200).collect::<Vec<_>>(), [0xaaa]);

        assert_eq!(walk(&space, STACK + 0x201).count(), 0);
        assert_eq!(walk(&space, 0).count(), 0);
        assert_eq!(walk(&space, 0x7000_0000).count(), 0);
    }
}
