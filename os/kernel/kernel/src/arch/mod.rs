//! # x86-64 backend
//!
//! Everything that only makes sense on the real machine: port I/O, `cr3`,
//! the TSS, the kernel stack switch and the trap entry stubs.
//!
//! The boot code loads the GDT (with a descriptor for
//! [`X86Platform::tss_base`]), points the IDT gates at the stubs in
//! [`entry`], creates the tasks and then calls
//! [`Scheduler::start`](kernel_sched::Scheduler::start):
//!
//! ```text
//!   vector 0x0e ──▶ entry::page_fault_entry
//!   vector 0x20 ──▶ entry::timer_entry        (legacy PIC, IRQ 0)
//!   vector 0x80 ──▶ entry::syscall_entry      (DPL 3)
//! ```

pub mod entry;
pub mod platform;
pub mod ports;
mod switch;

pub use platform::{Cr3Mmu, PhysFrames, X86Platform};

use crate::Kernel;
use kernel_sync::SyncOnceCell;

static KERNEL: SyncOnceCell<Kernel<X86Platform>> = SyncOnceCell::new();

/// Creates the kernel the entry stubs dispatch to.
///
/// # Panics
/// If called twice.
pub fn install(platform: &'static X86Platform) -> &'static Kernel<X86Platform> {
    if KERNEL.set(Kernel::new(platform)).is_err() {
        panic!("kernel already installed");
    }
    kernel()
}

/// The installed kernel.
///
/// # Panics
/// Before [`install`].
#[must_use]
pub fn kernel() -> &'static Kernel<X86Platform> {
    let Some(kernel) = KERNEL.get() else {
        panic!("trap before the kernel was installed");
    };
    kernel
}

/// Masks interrupts and parks the CPU for good.
pub fn halt() -> ! {
    loop {
        // SAFETY: only stops the CPU.
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    log::error!("kernel panic: {info}");
    halt()
}
