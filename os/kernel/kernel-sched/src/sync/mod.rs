//! # Blocking Primitives
//!
//! [`Semaphore`], [`Mutex`] and [`CondVar`] park tasks through a [`Sleeper`],
//! normally the [`Scheduler`](crate::Scheduler). Their own bookkeeping sits
//! behind an [`IrqSpinLock`](kernel_sync::IrqSpinLock), so it is only ever
//! touched with interrupts masked.
//!
//! Every blocking path follows the same protocol:
//!
//! 1. register a stack-local [`Waiter`] while holding the lock,
//! 2. [`Sleeper::prepare_me_for_sleep`] (still holding it),
//! 3. release the lock,
//! 4. [`Sleeper::put_me_to_sleep`], which returns at once if a waker got in
//!    between,
//! 5. reacquire the lock and check the waiter's `woken` flag, looping if unset.
//!
//! Wake-ups are handed over through the flag rather than re-checked
//! conditions, so a wake between steps 3 and 4 is never lost.
//!
//! Semaphore waiters are woken in arrival order. Condition variable waiters
//! are woken most recent first.

mod condvar;
mod mutex;
mod semaphore;

pub use condvar::CondVar;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;

use crate::task::TaskId;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

/// Lets blocking primitives suspend and resume tasks.
pub trait Sleeper {
    /// The running task.
    ///
    /// # Panics
    /// Outside of any task, where nothing can be put to sleep.
    fn current(&self) -> TaskId;

    /// Marks the running task as sleeping; it keeps running until
    /// [`Sleeper::put_me_to_sleep`].
    fn prepare_me_for_sleep(&self);

    /// Gives up the CPU unless the task was woken since it prepared.
    /// Returns `true` if it actually slept.
    fn put_me_to_sleep(&self) -> bool;

    /// Makes `task` runnable again.
    fn wake_up_task(&self, task: TaskId);
}

/// A blocked task's entry in a wait queue. Lives on the blocked task's stack
/// for the duration of the blocking call.
pub(crate) struct Waiter {
    task: TaskId,
    woken: AtomicBool,
}

impl Waiter {
    pub(crate) const fn new(task: TaskId) -> Self {
        Self {
            task,
            woken: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }

    /// Marks the waiter woken and wakes its task.
    ///
    /// # Safety
    /// `waiter` must have been taken off its queue under the queue's lock,
    /// and that lock must still be held.
    pub(crate) unsafe fn wake(waiter: NonNull<Self>, sleeper: &impl Sleeper) {
        // SAFETY: the owner cannot leave its blocking call while the queue
        // lock is held, so the record is alive.
        let waiter = unsafe { waiter.as_ref() };
        let task = waiter.task;
        waiter.woken.store(true, Ordering::Release);
        sleeper.wake_up_task(task);
    }
}
