use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-test-and-set lock.
///
/// On the kernel's single core the lock word is only ever contended when the
/// holder was interrupted and the interrupt handler tries to take the same
/// lock, which can never resolve by waiting. With interrupts masked that is
/// reported as a fatal re-entrancy bug instead of a silent hang. Only host
/// threads, which really run in parallel, ever spin.
pub struct SpinLock<T> {
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

// SAFETY: the lock word serializes access to `inner`.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    #[inline]
    fn acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Takes the lock, spinning only where a second execution context exists.
    ///
    /// # Panics
    /// On bare metal, if the lock is held while interrupts are masked: the
    /// holder cannot run again until this context gives up the CPU.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while !self.acquire() {
            #[cfg(target_os = "none")]
            if !crate::irq::interrupts_enabled() {
                panic!("re-entrant acquisition of a held lock with interrupts masked");
            }
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while the lock word is held.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above; `&mut self` rules out other borrows through the guard.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release publishes the critical section.
        self.lock.locked.store(false, Ordering::Release);
    }
}
