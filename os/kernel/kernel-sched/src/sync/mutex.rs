use super::{Semaphore, Sleeper};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// Sleeping mutual exclusion: a [`Semaphore`] with one unit guarding `T`.
///
/// Unlike a spin lock, a contended `lock` puts the caller to sleep, and the
/// holder may be preempted.
pub struct Mutex<T> {
    sem: Semaphore,
    cell: UnsafeCell<T>,
}

// SAFETY: the semaphore admits one holder at a time.
unsafe impl<T: Send> Sync for Mutex<T> {}
// SAFETY: moving the mutex moves `T`.
unsafe impl<T: Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            sem: Semaphore::new(1),
            cell: UnsafeCell::new(value),
        }
    }

    /// Blocks until the mutex is free.
    pub fn lock<'a, S: Sleeper>(&'a self, sleeper: &'a S) -> MutexGuard<'a, T, S> {
        self.sem.down(sleeper);
        MutexGuard {
            mutex: self,
            sleeper,
        }
    }

    pub fn try_lock<'a, S: Sleeper>(&'a self, sleeper: &'a S) -> Option<MutexGuard<'a, T, S>> {
        self.sem.try_down().then(|| MutexGuard {
            mutex: self,
            sleeper,
        })
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.sem.count() == 0
    }
}

/// Holds a [`Mutex`] until dropped.
pub struct MutexGuard<'a, T, S: Sleeper> {
    mutex: &'a Mutex<T>,
    sleeper: &'a S,
}

impl<'a, T, S: Sleeper> MutexGuard<'a, T, S> {
    pub(crate) const fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }

    pub(crate) const fn sleeper(&self) -> &'a S {
        self.sleeper
    }
}

impl<T, S: Sleeper> Deref for MutexGuard<'_, T, S> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.mutex.cell.get() }
    }
}

impl<T, S: Sleeper> DerefMut for MutexGuard<'_, T, S> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.mutex.cell.get() }
    }
}

impl<T, S: Sleeper> Drop for MutexGuard<'_, T, S> {
    fn drop(&mut self) {
        self.mutex.sem.up(self.sleeper);
    }
}
