//! Access to the running task's user memory.

use crate::Kernel;
use kernel_info::memory::PAGE_SIZE;
use kernel_sched::Platform;
use kernel_syscall::SyscallError;
use kernel_vmem::{AddressSpace, FrameAlloc, PhysMapper, PhysicalFrame, VirtualAddress};

impl<P: Platform> Kernel<P> {
    /// Fills `out` from the running task's memory at `va`.
    ///
    /// Every page must be a user page below the public boundary. Deferred
    /// pages are backed on the way, as touching them from user mode would.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn copy_from_user(&self, va: VirtualAddress, out: &mut [u8]) -> Result<(), SyscallError> {
        let mut done = 0;
        while done < out.len() {
            let at = va
                .as_u64()
                .checked_add(done as u64)
                .map(VirtualAddress::new)
                .ok_or(SyscallError::InvalidArgument)?;
            let frame = self.sched.with_current_space(|space| user_frame(space, at))?;
            let offset = at.page_offset() as usize;
            let n = (PAGE_SIZE as usize - offset).min(out.len() - done);
            // SAFETY: the frame backs a user page of the running task, which
            // cannot be unmapped while the task is in this call.
            let bytes = unsafe { self.sched.platform().mapper().frame_bytes(frame) };
            out[done..done + n].copy_from_slice(&bytes[offset..offset + n]);
            done += n;
        }
        Ok(())
    }
}

fn user_frame<M: PhysMapper, A: FrameAlloc>(
    space: &AddressSpace<'_, M, A>,
    va: VirtualAddress,
) -> Result<PhysicalFrame, SyscallError> {
    if va.as_u64() >= space.boundary().as_u64() {
        return Err(SyscallError::InvalidArgument);
    }
    let entry = space.leaf_entry(va).ok_or(SyscallError::InvalidArgument)?;
    if !entry.user_access() {
        return Err(SyscallError::InvalidArgument);
    }
    if entry.present() {
        return Ok(entry.frame());
    }
    space
        .handle_fault(va)
        .map_err(|_| SyscallError::InvalidArgument)
}
