//! # HHDM-based PhysMapper for Kernel Virtual Memory
//!
//! With a higher-half direct map, every physical address `pa` is visible to
//! the kernel at `HHDM_BASE + pa`, so reaching a frame is a single addition.
//! The boot code that builds the direct map is responsible for covering all
//! frames the allocator hands out.

use kernel_info::memory::HHDM_BASE;
use kernel_vmem::{PhysMapper, PhysicalFrame};

/// [`PhysMapper`] implementation for kernels with a higher-half direct map (HHDM).
///
/// # Safety
/// - The HHDM mapping must be present and cover the referenced physical range.
/// - The returned reference must only be used for valid, mapped, and writable memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct HhdmPhysMapper;

impl HhdmPhysMapper {
    /// The kernel virtual address at which `frame` is visible.
    #[inline]
    #[must_use]
    pub const fn virtual_address(frame: PhysicalFrame) -> u64 {
        HHDM_BASE + frame.start().as_u64()
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn frame_to_mut<'a, T>(&self, frame: PhysicalFrame) -> &'a mut T {
        let va = Self::virtual_address(frame) as *mut T;
        // SAFETY: Caller must ensure the frame is valid and mapped via HHDM.
        unsafe { &mut *va }
    }
}
