//! The machine underneath the scheduler.

use crate::context::{KernelContext, TaskContext};
use crate::task::TaskId;
use kernel_vmem::{AddressSpace, FrameAlloc, Mmu, PhysMapper, VirtualAddress};

/// An address space living as long as the kernel.
pub type Space<P> = AddressSpace<'static, <P as Platform>::Mapper, <P as Platform>::Frames>;

/// Hardware services the scheduler relies on.
///
/// The bare-metal kernel implements this with port I/O, `cr3` and a stack
/// switching routine; tests implement it with one host thread per task.
pub trait Platform: Sync + 'static {
    type Mapper: PhysMapper + Sync + 'static;
    type Frames: FrameAlloc + Sync + 'static;
    type Mmu: Mmu;

    fn mapper(&self) -> &'static Self::Mapper;

    fn frames(&self) -> &'static Self::Frames;

    fn mmu(&self) -> &Self::Mmu;

    /// Masks (`true`) or unmasks the periodic timer interrupt.
    fn set_timer_masked(&self, masked: bool);

    /// Stack the CPU switches to when the next trap arrives from user mode.
    fn set_kernel_stack(&self, top: VirtualAddress);

    /// Lets pending interrupts in and halts until one arrived. Called with
    /// interrupts masked; returns with them masked again.
    fn wait_for_interrupt(&self);

    /// Sets up `kernel` so that the first [`Platform::switch`] to `task`
    /// starts it from `context` on the stack ending at `stack_top`.
    ///
    /// # Safety
    /// `context` must stay valid until the task has been started.
    unsafe fn prepare_entry(
        &self,
        task: TaskId,
        kernel: &mut KernelContext,
        stack_top: VirtualAddress,
        context: *const TaskContext,
    );

    /// Suspends the running code into `prev` and continues `next`.
    ///
    /// Returns when another switch names `prev` as its target.
    ///
    /// # Safety
    /// Interrupts must be masked, both pointers valid, and `next` must belong
    /// to `next_task`.
    unsafe fn switch(&self, prev: *mut KernelContext, next: *const KernelContext, next_task: TaskId);

    /// Abandons the running code and continues from `context`.
    ///
    /// # Safety
    /// `context` must describe code that is valid in the active address space.
    unsafe fn resume(&self, context: *const TaskContext) -> !;
}
