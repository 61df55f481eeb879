use core::sync::atomic::AtomicBool;
use kernel_info::memory::PUBLIC_BOUNDARY;
use kernel_sched::{Platform, Scheduler};

/// The kernel instance: the scheduler plus trap bookkeeping.
pub struct Kernel<P: Platform> {
    pub(crate) sched: Scheduler<P>,
    /// Set while a page fault is being resolved.
    pub(crate) in_fault: AtomicBool,
}

impl<P: Platform> Kernel<P> {
    /// Builds the kernel address space and an empty task registry.
    pub fn new(platform: &'static P) -> Self {
        log::info!("kernel starting, public range from {PUBLIC_BOUNDARY:#x}");
        Self {
            sched: Scheduler::new(platform),
            in_fault: AtomicBool::new(false),
        }
    }

    #[inline]
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler<P> {
        &self.sched
    }
}

impl<P: Platform> core::fmt::Debug for Kernel<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel").field("sched", &self.sched).finish()
    }
}
