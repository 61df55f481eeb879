use super::{Sleeper, Waiter};
use alloc::collections::VecDeque;
use core::ptr::NonNull;
use kernel_sync::IrqSpinLock;

/// Counting semaphore with a FIFO wait queue.
pub struct Semaphore {
    state: IrqSpinLock<State>,
}

struct State {
    count: usize,
    waiters: VecDeque<NonNull<Waiter>>,
}

// SAFETY: the waiter pointers are only dereferenced under the lock, while
// their owners are blocked.
unsafe impl Send for Semaphore {}
// SAFETY: see above.
unsafe impl Sync for Semaphore {}

impl Semaphore {
    #[must_use]
    pub const fn new(count: usize) -> Self {
        Self {
            state: IrqSpinLock::new(State {
                count,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Takes one unit, blocking the running task until one is available.
    pub fn down(&self, sleeper: &impl Sleeper) {
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            return;
        }

        let waiter = Waiter::new(sleeper.current());
        state.waiters.push_back(NonNull::from(&waiter));
        loop {
            sleeper.prepare_me_for_sleep();
            drop(state);
            sleeper.put_me_to_sleep();
            state = self.state.lock();
            // `up` handed its unit straight to us.
            if waiter.is_woken() {
                return;
            }
        }
    }

    /// Takes one unit if available without blocking.
    pub fn try_down(&self) -> bool {
        self.state.with_lock(|state| {
            let available = state.count > 0;
            if available {
                state.count -= 1;
            }
            available
        })
    }

    /// Returns one unit, waking the longest waiting task if there is one.
    pub fn up(&self, sleeper: &impl Sleeper) {
        let mut state = self.state.lock();
        if let Some(waiter) = state.waiters.pop_front() {
            // SAFETY: dequeued under the lock, which we still hold.
            unsafe { Waiter::wake(waiter, sleeper) };
        } else {
            state.count += 1;
        }
    }

    /// Units currently available.
    #[must_use]
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Tasks currently queued in `down`.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("count", &state.count)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}
