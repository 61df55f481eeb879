//! What the trap entry stubs call once the register state is on the stack.

use crate::backtrace;
use crate::page_fault::PageFaultError;
use crate::Kernel;
use core::sync::atomic::Ordering;
use kernel_info::tasks::FAULT_EXIT_STATUS;
use kernel_sched::{Platform, TaskContext};
use kernel_vmem::VirtualAddress;

impl<P: Platform> Kernel<P> {
    /// Periodic timer interrupt. May run other tasks before returning.
    pub fn on_timer(&self, frame: &TaskContext) {
        self.sched.on_timer_tick(frame);
    }

    /// `int 0x80`; the result is written to `frame.rax`.
    pub fn on_syscall(&self, frame: &mut TaskContext) {
        kernel_syscall::dispatch(self, frame);
    }

    /// Page fault at `address`.
    ///
    /// Deferred pages are backed and the faulting access is retried. Any
    /// other fault from user mode kills the task with [`FAULT_EXIT_STATUS`].
    ///
    /// # Panics
    /// On an unresolvable fault in kernel mode, or a fault while a fault is
    /// being resolved.
    pub fn on_page_fault(&self, frame: &TaskContext, address: VirtualAddress, error: PageFaultError) {
        if self.in_fault.swap(true, Ordering::AcqRel) {
            log::error!("page fault at {address:?} (rip {:#x}) while resolving another one", frame.rip);
            panic!("nested page fault");
        }
        let result = self.sched.handle_page_fault(address);
        self.in_fault.store(false, Ordering::Release);

        let reason = match result {
            Ok(backing) => {
                log::trace!("backed {address:?} with {backing:?}");
                return;
            }
            Err(reason) => reason,
        };

        if frame.is_user() {
            log::warn!(
                "task {:?} killed: {reason} at rip {:#x}: {}",
                self.sched.current_task(),
                frame.rip,
                error.explain()
            );
            self.sched.terminate_current_task(FAULT_EXIT_STATUS);
        }

        log::error!(
            "kernel page fault at {address:?}, rip {:#x}, error {:#x}: {reason}: {}",
            frame.rip,
            error.into_bits(),
            error.explain()
        );
        self.sched.with_current_space(|space| {
            for ret in backtrace::walk(space, frame.rbp) {
                log::error!("  at {ret:#018x}");
            }
        });
        panic!("unhandled page fault in kernel mode");
    }
}
