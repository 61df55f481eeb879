use crate::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

#[cfg(target_os = "none")]
mod cpu {
    /// Returns the current `RFLAGS` value (via `pushfq/pop`).
    #[inline]
    fn rflags() -> u64 {
        let r: u64;
        // SAFETY: reading RFLAGS has no side effects.
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r
    }

    #[inline]
    pub fn enabled() -> bool {
        rflags() & (1 << 9) != 0
    }

    #[inline]
    pub fn disable() {
        // SAFETY: masking interrupts on this core only delays them.
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        // SAFETY: callers restore a state that was valid before.
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(target_os = "none"))]
mod cpu {
    use std::cell::Cell;

    std::thread_local! {
        static IF: Cell<bool> = const { Cell::new(true) };
    }

    #[inline]
    pub fn enabled() -> bool {
        IF.with(Cell::get)
    }

    #[inline]
    pub fn disable() {
        IF.with(|f| f.set(false));
    }

    #[inline]
    pub fn enable() {
        IF.with(|f| f.set(true));
    }
}

/// `true` if interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    cpu::enabled()
}

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// On bare metal this must only be called where `cli` is permitted.
#[inline]
pub fn cli_stop_interrupts() {
    cpu::disable();
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// On bare metal this must only be called where `sti` is permitted.
#[inline]
pub fn sti_enable_interrupts() {
    cpu::enable();
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the interrupt flag. If interrupts were enabled,
/// it disables them. On drop, it re-enables them **only** if they were
/// previously enabled, so guards nest.
///
/// # Examples
///
/// ```
/// use kernel_sync::irq::{IrqGuard, interrupts_enabled};
///
/// let before = interrupts_enabled();
/// {
///     let _g = IrqGuard::new();
///     assert!(!interrupts_enabled());
/// }
/// assert_eq!(interrupts_enabled(), before);
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    /// Re-enables interrupts only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}

/// A lock whose critical sections also run with interrupts disabled.
///
/// This is the kernel's basic mutual-exclusion tool: on a single core, masking
/// interrupts already excludes every other context, so the inner lock word is
/// always free when taken there.
///
/// # Examples
///
/// ```
/// use kernel_sync::IrqSpinLock;
///
/// static COUNTER: IrqSpinLock<u64> = IrqSpinLock::new(0);
///
/// *COUNTER.lock() += 1;
/// assert_eq!(COUNTER.with_lock(|c| *c), 1);
/// ```
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
        }
    }

    /// Disables interrupts, then takes the lock.
    #[inline]
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.inner.lock();
        IrqSpinLockGuard { guard, _irq: irq }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }
}

/// Guard of an [`IrqSpinLock`]. Releases the lock, then restores interrupts.
pub struct IrqSpinLockGuard<'a, T> {
    // Field order is drop order.
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
