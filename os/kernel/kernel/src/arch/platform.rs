//! [`Platform`] for a single x86-64 core.

use super::ports::pic_set_masked;
use super::switch::{context_switch, restore_context};
use core::cell::UnsafeCell;
use kernel_alloc::frame_alloc::BitmapFrameAlloc;
use kernel_alloc::phys_mapper::HhdmPhysMapper;
use kernel_sched::{KernelContext, Platform, TaskContext, TaskId};
use kernel_vmem::{Mmu, PhysicalAddress, PhysicalFrame, VirtualAddress};

/// Frame allocator of the bare-metal kernel: 512 words track 128 MiB.
pub type PhysFrames = BitmapFrameAlloc<512>;

/// IRQ line of the PIT on PIC #1.
const TIMER_IRQ: u8 = 0;

/// Physical address bits of `cr3`.
const CR3_ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

/// The MMU, driven through `cr3` and `invlpg`.
#[derive(Debug, Default)]
pub struct Cr3Mmu;

impl Mmu for Cr3Mmu {
    fn active_root(&self) -> PhysicalFrame {
        let cr3: u64;
        // SAFETY: reading cr3 has no side effects at CPL0.
        unsafe { core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags)) };
        PhysicalAddress::new(cr3 & CR3_ADDRESS_MASK).frame()
    }

    unsafe fn load_root(&self, root: PhysicalFrame) {
        let cr3 = root.start().as_u64();
        // SAFETY: forwarded to the caller.
        unsafe { core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags)) };
    }

    fn flush_page(&self, va: VirtualAddress) {
        // SAFETY: invalidating a TLB entry never changes memory.
        unsafe { core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags)) };
    }

    unsafe fn page_bytes<'a>(&self, va: VirtualAddress) -> &'a mut [u8; 4096] {
        // SAFETY: the caller guarantees the page is mapped and unaliased.
        unsafe { &mut *(va.page_base().as_u64() as *mut [u8; 4096]) }
    }
}

/// 64-bit Task State Segment. Only `rsp0` is used: the stack the CPU
/// switches to on a trap from ring 3. No I/O bitmap, no IST.
#[repr(C, packed)]
#[allow(dead_code)] // read by the CPU
struct Tss64 {
    _reserved0: u32,
    rsp0: u64,
    rsp1: u64,
    rsp2: u64,
    _reserved1: u64,
    ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    iopb_offset: u16,
}

impl Tss64 {
    #[allow(clippy::cast_possible_truncation)]
    const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _reserved1: 0,
            ist: [0; 7],
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<Self>() as u16,
        }
    }
}

pub struct X86Platform {
    frames: &'static PhysFrames,
    mmu: Cr3Mmu,
    tss: UnsafeCell<Tss64>,
}

// SAFETY: one core; the TSS is only written with interrupts masked.
unsafe impl Sync for X86Platform {}

impl X86Platform {
    #[must_use]
    pub const fn new(frames: &'static PhysFrames) -> Self {
        Self {
            frames,
            mmu: Cr3Mmu,
            tss: UnsafeCell::new(Tss64::new()),
        }
    }

    /// Base address for the GDT's TSS descriptor.
    #[must_use]
    pub fn tss_base(&self) -> u64 {
        self.tss.get() as u64
    }

    /// Size of the TSS, minus one, for the descriptor's limit field.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn tss_limit() -> u32 {
        (size_of::<Tss64>() - 1) as u32
    }
}

impl Platform for X86Platform {
    type Mapper = HhdmPhysMapper;
    type Frames = PhysFrames;
    type Mmu = Cr3Mmu;

    fn mapper(&self) -> &'static HhdmPhysMapper {
        &HhdmPhysMapper
    }

    fn frames(&self) -> &'static PhysFrames {
        self.frames
    }

    fn mmu(&self) -> &Cr3Mmu {
        &self.mmu
    }

    fn set_timer_masked(&self, masked: bool) {
        pic_set_masked(TIMER_IRQ, masked);
    }

    fn set_kernel_stack(&self, top: VirtualAddress) {
        let tss = self.tss.get();
        // SAFETY: the field is unaligned in the packed layout; the CPU only
        // reads it on the next ring 3 trap.
        unsafe { (&raw mut (*tss).rsp0).write_unaligned(top.as_u64()) };
    }

    fn wait_for_interrupt(&self) {
        // `sti` delays interrupts by one instruction, so none can slip in
        // between it and `hlt`.
        unsafe { core::arch::asm!("sti", "hlt", "cli", options(nomem, nostack)) };
    }

    unsafe fn prepare_entry(
        &self,
        _task: TaskId,
        kernel: &mut KernelContext,
        stack_top: VirtualAddress,
        context: *const TaskContext,
    ) {
        kernel.rsp = 0;
        kernel.stack_top = stack_top.as_u64();
        kernel.start = context as u64;
    }

    unsafe fn switch(&self, prev: *mut KernelContext, next: *const KernelContext, _next_task: TaskId) {
        unsafe { context_switch(prev, next) };
    }

    unsafe fn resume(&self, context: *const TaskContext) -> ! {
        unsafe { restore_context(context) }
    }
}
