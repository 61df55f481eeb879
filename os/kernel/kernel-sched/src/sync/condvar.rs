use super::{MutexGuard, Sleeper, Waiter};
use alloc::vec::Vec;
use core::ptr::NonNull;
use kernel_sync::IrqSpinLock;

/// Condition variable paired with a [`Mutex`](super::Mutex).
///
/// [`CondVar::notify_one`] wakes the most recent waiter first.
pub struct CondVar {
    waiters: IrqSpinLock<Vec<NonNull<Waiter>>>,
}

// SAFETY: the waiter pointers are only dereferenced under the lock, while
// their owners are blocked.
unsafe impl Send for CondVar {}
// SAFETY: see above.
unsafe impl Sync for CondVar {}

impl CondVar {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: IrqSpinLock::new(Vec::new()),
        }
    }

    /// Releases `guard`'s mutex, sleeps until notified, and locks the mutex
    /// again before returning.
    ///
    /// The waiter is registered and the task marked sleeping before the
    /// mutex is released, so a notify issued right after the release is
    /// seen.
    pub fn wait<'a, T, S: Sleeper>(&self, guard: MutexGuard<'a, T, S>) -> MutexGuard<'a, T, S> {
        let mutex = guard.mutex();
        let sleeper = guard.sleeper();

        let waiter = Waiter::new(sleeper.current());
        let mut waiters = self.waiters.lock();
        waiters.push(NonNull::from(&waiter));
        sleeper.prepare_me_for_sleep();
        drop(waiters);
        drop(guard);

        loop {
            sleeper.put_me_to_sleep();
            let _waiters = self.waiters.lock();
            if waiter.is_woken() {
                break;
            }
            sleeper.prepare_me_for_sleep();
        }

        mutex.lock(sleeper)
    }

    /// Wakes the most recently registered waiter, if any.
    pub fn notify_one(&self, sleeper: &impl Sleeper) {
        let mut waiters = self.waiters.lock();
        if let Some(waiter) = waiters.pop() {
            // SAFETY: removed under the lock, which we still hold.
            unsafe { Waiter::wake(waiter, sleeper) };
        }
    }

    /// Wakes every registered waiter.
    pub fn notify_all(&self, sleeper: &impl Sleeper) {
        let mut waiters = self.waiters.lock();
        for waiter in core::mem::take(&mut *waiters) {
            // SAFETY: removed under the lock, which we still hold.
            unsafe { Waiter::wake(waiter, sleeper) };
        }
    }

    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::NeverSleeps;

    #[test]
    fn notify_without_waiters_is_a_no_op() {
        let sleeper = NeverSleeps::default();
        let cv = CondVar::new();
        cv.notify_one(&sleeper);
        cv.notify_all(&sleeper);
        assert_eq!(cv.waiting(), 0);
        assert!(sleeper.woken.borrow().is_empty());
    }
}
