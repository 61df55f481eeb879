//! # Scheduler
//!
//! Owns the task registry and decides which task runs. All state lives behind
//! one [`IrqSpinLock`]; the lock is never held across a switch.
//!
//! ## Selection
//!
//! Round robin over task ids: the next runnable task with an id strictly
//! greater than the current one, wrapping around once. The current task is
//! the last candidate. With nothing runnable the CPU idles on the current
//! stack until an interrupt makes a task runnable.
//!
//! ## Timer masking
//!
//! Preemption only matters with at least two runnable tasks, so the timer
//! interrupt is masked whenever fewer are runnable.

use crate::config::{INITIAL_RFLAGS, MAX_TASK_ID, STACK_PAGES, STACK_SIZE, USER_STACK_TOP};
use crate::context::{KernelContext, TaskContext, YieldOutcome};
use crate::error::{SpawnError, WaitError};
use crate::files::FileTable;
use crate::platform::{Platform, Space};
use crate::sync::{Mutex, Sleeper};
use crate::task::{ExitSignal, Task, TaskId, TaskState, next_free_id};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use kernel_info::memory::PUBLIC_BOUNDARY;
use kernel_sync::{IrqGuard, IrqSpinLock, IrqSpinLockGuard};
use kernel_vmem::{
    AddressSpace, CopyWindow, FaultError, FrameAlloc, Mmu, PageFlags, PhysicalFrame,
    VirtualAddress, X86_64_4LEVEL,
};

pub struct Scheduler<P: Platform> {
    platform: &'static P,
    state: IrqSpinLock<State<P>>,
    /// Taken by whoever copies frames through the window, with the scheduler
    /// unlocked.
    copy_window: Mutex<CopyWindow>,
}

struct State<P: Platform> {
    kernel: Arc<Space<P>>,
    tasks: BTreeMap<TaskId, Box<Task<P>>>,
    /// `None` while the boot context runs.
    current: Option<TaskId>,
    last_id: u32,
    timer_masked: bool,
    boot: KernelContext,
}

/// The next runnable task after `current` in id order, wrapping once.
fn pick_next(
    tasks: impl IntoIterator<Item = (TaskId, TaskState)>,
    current: Option<TaskId>,
) -> Option<TaskId> {
    let mut wrapped = None;
    for (id, state) in tasks {
        if state != TaskState::Runnable {
            continue;
        }
        if current.is_none_or(|current| id > current) {
            return Some(id);
        }
        wrapped.get_or_insert(id);
    }
    wrapped
}

impl<P: Platform> State<P> {
    fn current_id(&self) -> TaskId {
        let Some(id) = self.current else {
            log::error!("task operation issued from the boot context");
            panic!("no task is running");
        };
        id
    }

    fn task(&self, id: TaskId) -> &Task<P> {
        let Some(task) = self.tasks.get(&id) else {
            log::error!("lookup of unknown task {id}");
            panic!("unknown task {id}");
        };
        task
    }

    fn task_mut(&mut self, id: TaskId) -> &mut Task<P> {
        let Some(task) = self.tasks.get_mut(&id) else {
            log::error!("lookup of unknown task {id}");
            panic!("unknown task {id}");
        };
        task
    }

    fn current_task(&self) -> &Task<P> {
        self.task(self.current_id())
    }

    fn current_task_mut(&mut self) -> &mut Task<P> {
        self.task_mut(self.current_id())
    }

    fn space_of(&self, id: TaskId) -> &Space<P> {
        self.task(id).space.as_deref().unwrap_or(&*self.kernel)
    }

    fn pick_next(&self) -> Option<TaskId> {
        pick_next(
            self.tasks.iter().map(|(id, task)| (*id, task.state)),
            self.current,
        )
    }

    fn allocate_id(&mut self) -> Result<TaskId, SpawnError> {
        let id = next_free_id(self.last_id, MAX_TASK_ID, |id| self.tasks.contains_key(&id))
            .ok_or(SpawnError::NoTaskIdsLeft)?;
        self.last_id = id.as_u32();
        Ok(id)
    }

    fn runnable(&self) -> usize {
        self.tasks
            .values()
            .filter(|task| task.state == TaskState::Runnable)
            .count()
    }

    /// Masks the timer unless at least two tasks are runnable.
    fn do_interrupt_masking(&mut self, platform: &P) {
        let masked = self.runnable() < 2;
        if masked != self.timer_masked {
            self.timer_masked = masked;
            platform.set_timer_masked(masked);
            log::trace!("timer {}", if masked { "masked" } else { "unmasked" });
        }
    }

    /// Nothing is runnable; fatal unless something could still wake up.
    fn check_idle_allowed(&self) {
        if self.tasks.is_empty() {
            log::error!("scheduling with an empty task registry");
            panic!("no tasks to schedule");
        }
        if self.tasks.values().all(|task| task.state == TaskState::Zombie) {
            log::error!("all {} tasks are zombies", self.tasks.len());
            panic!("every task is a zombie");
        }
    }
}

impl<P: Platform> Scheduler<P> {
    /// Creates the scheduler and the kernel address space.
    ///
    /// Before [`Scheduler::start`], the boot code maps whatever the kernel
    /// itself needs into the public range via [`Scheduler::with_kernel_space`].
    pub fn new(platform: &'static P) -> Self {
        let kernel = AddressSpace::new_kernel(
            X86_64_4LEVEL,
            VirtualAddress::new(PUBLIC_BOUNDARY),
            platform.mapper(),
            platform.frames(),
        );
        let window = CopyWindow::DEFAULT;
        kernel.reserve_tables(window.source(), 2, None);
        platform.set_timer_masked(true);
        Self {
            platform,
            state: IrqSpinLock::new(State {
                kernel: Arc::new(kernel),
                tasks: BTreeMap::new(),
                current: None,
                last_id: 0,
                timer_masked: true,
                boot: KernelContext::default(),
            }),
            copy_window: Mutex::new(window),
        }
    }

    #[must_use]
    pub const fn platform(&self) -> &'static P {
        self.platform
    }

    /// Runs `f` on the kernel address space with the scheduler locked.
    pub fn with_kernel_space<R>(&self, f: impl FnOnce(&Space<P>) -> R) -> R {
        f(&*self.state.lock().kernel)
    }

    /// Runs `f` on the running task's address space (the kernel space for
    /// kernel tasks and the boot context) with the scheduler locked.
    pub fn with_current_space<R>(&self, f: impl FnOnce(&Space<P>) -> R) -> R {
        let state = self.state.lock();
        match state.current {
            Some(id) => f(state.space_of(id)),
            None => f(&*state.kernel),
        }
    }

    /// Runs `f` on the running task's open handles.
    ///
    /// # Panics
    /// From the boot context.
    pub fn with_current_files<R>(&self, f: impl FnOnce(&mut FileTable) -> R) -> R {
        f(&mut self.state.lock().current_task_mut().files)
    }

    /// A fresh task address space sharing the kernel's public range.
    #[must_use]
    pub fn new_address_space(&self) -> Space<P> {
        self.with_kernel_space(|kernel| kernel.new_process())
    }

    /// Backs a deferred page of the running task on first access.
    ///
    /// # Errors
    /// If `va` is not a deferred reservation; see [`AddressSpace::handle_fault`].
    pub fn handle_page_fault(&self, va: VirtualAddress) -> Result<PhysicalFrame, FaultError> {
        self.with_current_space(|space| space.handle_fault(va))
    }

    #[must_use]
    pub fn current_task(&self) -> Option<TaskId> {
        self.state.lock().current
    }

    #[must_use]
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.state.lock().tasks.get(&id).map(|task| task.state)
    }

    #[must_use]
    pub fn parent_of(&self, id: TaskId) -> Option<TaskId> {
        self.state.lock().tasks.get(&id).and_then(|task| task.parent)
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    #[must_use]
    pub fn is_timer_masked(&self) -> bool {
        self.state.lock().timer_masked
    }

    /// Spawns a kernel task starting at `entry` on its own kernel stack.
    ///
    /// # Errors
    /// If every task id is taken.
    pub fn new_kernel_task(&self, entry: VirtualAddress) -> Result<TaskId, SpawnError> {
        let mut state = self.state.lock();
        let id = state.allocate_id()?;
        let context = TaskContext::kernel(entry, id.kernel_stack_top());
        let parent = state.current;
        self.add_task(&mut state, id, parent, context, None, FileTable::new());
        Ok(id)
    }

    /// Spawns a user task running `entry` in `space`, with a fresh user stack
    /// mapped just below [`USER_STACK_TOP`].
    ///
    /// # Errors
    /// If every task id is taken.
    pub fn new_user_task(&self, space: Space<P>, entry: VirtualAddress) -> Result<TaskId, SpawnError> {
        let mut state = self.state.lock();
        let id = state.allocate_id()?;
        space.map_range(
            VirtualAddress::new(USER_STACK_TOP - STACK_SIZE),
            STACK_PAGES,
            PageFlags::USER_DATA,
        );
        let context = TaskContext::user(entry, VirtualAddress::new(USER_STACK_TOP));
        let parent = state.current;
        self.add_task(&mut state, id, parent, context, Some(space), FileTable::new());
        Ok(id)
    }

    /// Registers a new runnable task and maps its kernel stack.
    fn add_task(
        &self,
        state: &mut State<P>,
        id: TaskId,
        parent: Option<TaskId>,
        context: TaskContext,
        space: Option<Space<P>>,
        files: FileTable,
    ) {
        let stack_top = id.kernel_stack_top();
        state.kernel.map_range(
            VirtualAddress::new(stack_top.as_u64() - STACK_SIZE),
            STACK_PAGES,
            PageFlags::KERNEL_DATA,
        );

        let mut task = Box::new(Task {
            id,
            parent,
            state: TaskState::Runnable,
            context,
            kernel: KernelContext::default(),
            space: space.map(Arc::new),
            exit: Arc::new(ExitSignal::new()),
            files,
        });
        let entry = &raw const task.context;
        // SAFETY: the task is boxed, so its context keeps its address until
        // the task is reaped.
        unsafe {
            self.platform
                .prepare_entry(id, &mut task.kernel, stack_top, entry);
        }
        log::debug!("new task {id}: {task:?}");
        state.tasks.insert(id, task);
        state.do_interrupt_masking(self.platform);
    }

    /// Leaves the boot context for the first runnable task.
    ///
    /// Returns only if the platform ever hands control back to the boot
    /// context.
    ///
    /// # Panics
    /// If no task exists or the scheduler is already running.
    pub fn start(&self) {
        let _irq = IrqGuard::new();
        {
            let state = self.state.lock();
            assert!(state.current.is_none(), "scheduler already started");
            let mmu = self.platform.mmu();
            if mmu.active_root() != state.kernel.root() {
                // SAFETY: the boot code populated the kernel space before
                // starting the scheduler.
                unsafe { mmu.load_root(state.kernel.root()) };
            }
            log::info!("starting scheduler with {} tasks", state.tasks.len());
        }
        self.schedule_next();
    }

    /// Hands the CPU to the next runnable task in round-robin order.
    ///
    /// Returns once the caller is chosen again, which may be immediately.
    pub fn schedule_next(&self) {
        let _irq = IrqGuard::new();
        loop {
            let state = self.state.lock();
            let Some(next) = state.pick_next() else {
                state.check_idle_allowed();
                drop(state);
                self.platform.wait_for_interrupt();
                continue;
            };
            if Some(next) != state.current {
                self.switch_to(state, next);
            }
            return;
        }
    }

    /// Gives up the CPU while staying runnable.
    pub fn yield_now(&self) {
        self.schedule_next();
    }

    fn switch_to(&self, mut guard: IrqSpinLockGuard<'_, State<P>>, next: TaskId) {
        let state = &mut *guard;
        let (prev, probe) = match state.current {
            Some(id) => {
                let task = state.task_mut(id);
                (&raw mut task.kernel, task.stack_probe())
            }
            None => (&raw mut state.boot, state.task(next).stack_probe()),
        };

        state.space_of(next).activate(self.platform.mmu(), probe);
        let target = state.task(next);
        self.platform.set_kernel_stack(target.kernel_stack_top());
        let next_context = &raw const target.kernel;
        log::trace!(
            "switching {:?} -> {next} (rip {:#x})",
            state.current,
            target.context.rip
        );
        state.current = Some(next);
        drop(guard);

        // SAFETY: interrupts are masked by the caller; both contexts live in
        // boxed tasks (or the scheduler) that outlive the switch.
        unsafe { self.platform.switch(prev, next_context, next) };
    }

    /// Continues the running task from its saved context, e.g. after
    /// [`Scheduler::downgrade_current_task`].
    ///
    /// # Panics
    /// From the boot context.
    pub fn reschedule_self(&self) -> ! {
        let _irq = IrqGuard::new();
        let context = {
            let state = self.state.lock();
            let task = state.current_task();
            log::trace!("restoring task {} with rip {:#x}", task.id, task.context.rip);
            &raw const task.context
        };
        // SAFETY: the running task's context describes code mapped in the
        // active space; the task cannot be reaped while it runs.
        unsafe { self.platform.resume(context) }
    }

    /// Turns the running kernel task into a user task entering `entry`.
    ///
    /// A task without a private address space gets one, with a user stack.
    ///
    /// # Panics
    /// From the boot context.
    pub fn downgrade_current_task(&self, entry: VirtualAddress) -> ! {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let id = state.current_id();
            let kernel = &state.kernel;
            let mmu = self.platform.mmu();
            let Some(task) = state.tasks.get_mut(&id) else {
                panic!("unknown task {id}");
            };
            if task.space.is_none() {
                let space = kernel.new_process();
                space.map_range(
                    VirtualAddress::new(USER_STACK_TOP - STACK_SIZE),
                    STACK_PAGES,
                    PageFlags::USER_DATA,
                );
                space.activate(mmu, task.stack_probe());
                task.space = Some(Arc::new(space));
            }
            task.context.rip = entry.as_u64();
            task.context.rsp = USER_STACK_TOP;
            task.context.rflags = INITIAL_RFLAGS;
            task.context.downgrade();
            log::debug!("task {id} drops to user mode at {entry:?}");
        }
        self.reschedule_self()
    }

    /// Records the trap frame of the running task. Frames from kernel mode
    /// belong to the interrupted kernel code and are not recorded.
    ///
    /// # Panics
    /// If the frame shows user code running with interrupts disabled.
    pub fn save_current_task(&self, frame: &TaskContext) {
        let mut state = self.state.lock();
        let Some(id) = state.current else {
            return;
        };
        if !frame.is_user() {
            return;
        }
        if !frame.interrupts_enabled() {
            log::error!("task {id} ran in user mode with interrupts disabled: {frame:?}");
            panic!("user mode with interrupts disabled");
        }
        state.task_mut(id).context = *frame;
    }

    /// Timer interrupt entry: records `frame` and preempts the running task.
    pub fn on_timer_tick(&self, frame: &TaskContext) {
        if self.current_task().is_none() {
            return;
        }
        self.save_current_task(frame);
        self.schedule_next();
    }

    /// Checks, with the sleep window closed, whether the running task has to
    /// give up the CPU.
    ///
    /// # Panics
    /// From the boot context.
    pub fn yield_point(&self) -> YieldOutcome {
        match self.state.lock().current_task().state {
            TaskState::Runnable => YieldOutcome::Resumed,
            TaskState::Sleeping | TaskState::Zombie => YieldOutcome::GoingToSleep,
        }
    }

    /// Duplicates the running task. `frame` is its trap-time state; the
    /// child starts from a copy with `rax` zeroed and a full copy of the
    /// parent's private memory.
    ///
    /// The copy is made with the scheduler unlocked, so other tasks keep
    /// running meanwhile; concurrent clones take turns on the copy window.
    ///
    /// # Errors
    /// - [`SpawnError::KernelFrame`] if `frame` was not taken in user mode.
    /// - [`SpawnError::NoTaskIdsLeft`] if every task id is taken.
    ///
    /// # Panics
    /// From the boot context.
    pub fn clone(&self, frame: &TaskContext) -> Result<TaskId, SpawnError> {
        if !frame.is_user() {
            log::warn!("refusing to clone kernel-mode code at {:#x}", frame.rip);
            return Err(SpawnError::KernelFrame);
        }
        let (parent_id, kernel, parent_space, files) = {
            let state = self.state.lock();
            let parent = state.current_task();
            (
                parent.id,
                Arc::clone(&state.kernel),
                parent.space.clone(),
                parent.files.clone(),
            )
        };

        let space = match parent_space {
            Some(parent_space) => {
                let window = self.copy_window.lock(self);
                parent_space.duplicate(&kernel, &window, self.platform.mmu())
            }
            None => kernel.new_process(),
        };
        let mut context = *frame;
        context.rax = 0;

        let mut state = self.state.lock();
        let id = state.allocate_id()?;
        self.add_task(&mut state, id, Some(parent_id), context, Some(space), files);
        log::debug!("task {parent_id} cloned into {id}");
        Ok(id)
    }

    /// Ends the running task with `status`.
    ///
    /// The kernel address space is installed before the task's own is
    /// destroyed. The task stays a zombie until collected by
    /// [`Scheduler::wait`].
    ///
    /// # Panics
    /// From the boot context.
    pub fn terminate_current_task(&self, status: i32) -> ! {
        let signal = Arc::clone(&self.state.lock().current_task().exit);
        let mut published = signal.status.lock(self);

        // A zombie holding `published` must not be preempted.
        let _irq = IrqGuard::new();
        let id = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let id = state.current_id();
            let mmu = self.platform.mmu();
            let Some(task) = state.tasks.get_mut(&id) else {
                panic!("unknown task {id}");
            };
            state.kernel.activate(mmu, task.stack_probe());
            // Only a clone in progress shares the space, and that would be
            // this very task.
            if let Some(space) = task.space.take().and_then(Arc::into_inner) {
                space.destroy(mmu);
            }
            task.state = TaskState::Zombie;
            for child in state.tasks.values_mut() {
                if child.parent == Some(id) {
                    child.parent = None;
                }
            }
            state.do_interrupt_masking(self.platform);
            id
        };
        log::debug!("task {id} exited with status {status}");

        *published = Some(status);
        signal.done.notify_all(self);
        drop(published);

        self.schedule_next();
        log::error!("zombie task {id} was scheduled again");
        panic!("zombie task {id} was scheduled again");
    }

    /// Blocks until task `id` has exited, removes it, and returns its status.
    ///
    /// # Errors
    /// - [`WaitError::SelfWait`] for the caller's own id.
    /// - [`WaitError::NoSuchTask`] if `id` never existed or was already collected.
    /// - [`WaitError::NotAChild`] if `id` has a parent other than the caller.
    pub fn wait(&self, id: TaskId) -> Result<i32, WaitError> {
        let signal = {
            let state = self.state.lock();
            if state.current == Some(id) {
                return Err(WaitError::SelfWait);
            }
            let task = state.tasks.get(&id).ok_or(WaitError::NoSuchTask(id))?;
            if task.parent.is_some() && task.parent != state.current {
                return Err(WaitError::NotAChild);
            }
            Arc::clone(&task.exit)
        };

        let mut status = signal.status.lock(self);
        while status.is_none() {
            status = signal.done.wait(status);
        }
        let Some(code) = *status else {
            unreachable!();
        };
        drop(status);

        if self.reap(id) {
            Ok(code)
        } else {
            Err(WaitError::NoSuchTask(id))
        }
    }

    /// Removes zombie `id` and releases its kernel stack. `false` if another
    /// waiter got there first.
    fn reap(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        let Some(task) = state.tasks.remove(&id) else {
            return false;
        };
        if task.state != TaskState::Zombie {
            log::error!("reaping task {id}, which is {:?}", task.state);
            panic!("reaping task {id}, which has not exited");
        }

        let stack = VirtualAddress::new(task.kernel_stack_top().as_u64() - STACK_SIZE);
        for page in 0..STACK_PAGES {
            let va = stack.add_pages(page);
            let frame = state.kernel.unmap_page(va);
            self.platform.mmu().flush_page(va);
            self.platform.frames().free(frame);
        }
        log::debug!("reaped task {id}");
        true
    }
}

impl<P: Platform> Sleeper for Scheduler<P> {
    fn current(&self) -> TaskId {
        self.state.lock().current_id()
    }

    fn prepare_me_for_sleep(&self) {
        let mut state = self.state.lock();
        let task = state.current_task_mut();
        if task.state == TaskState::Runnable {
            task.state = TaskState::Sleeping;
        }
        state.do_interrupt_masking(self.platform);
    }

    fn put_me_to_sleep(&self) -> bool {
        match self.yield_point() {
            YieldOutcome::GoingToSleep => {
                self.schedule_next();
                true
            }
            YieldOutcome::Resumed => false,
        }
    }

    fn wake_up_task(&self, id: TaskId) {
        let mut state = self.state.lock();
        let Some(task) = state.tasks.get_mut(&id) else {
            log::error!("wake-up for unknown task {id}");
            panic!("wake of unknown task {id}");
        };
        match task.state {
            TaskState::Sleeping => task.state = TaskState::Runnable,
            TaskState::Runnable => {}
            TaskState::Zombie => log::warn!("ignoring wake-up of zombie task {id}"),
        }
        state.do_interrupt_masking(self.platform);
    }
}

impl<P: Platform> core::fmt::Debug for Scheduler<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Scheduler")
            .field("current", &state.current)
            .field("tasks", &state.tasks.values().collect::<alloc::vec::Vec<_>>())
            .field("timer_masked", &state.timer_masked)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[(u32, TaskState)]) -> impl Iterator<Item = (TaskId, TaskState)> + '_ {
        list.iter().map(|&(id, state)| (TaskId::new(id), state))
    }

    const R: TaskState = TaskState::Runnable;
    const S: TaskState = TaskState::Sleeping;
    const Z: TaskState = TaskState::Zombie;

    #[test]
    fn round_robin_in_id_order() {
        let tasks = [(1, R), (3, R), (4, R)];
        assert_eq!(pick_next(ids(&tasks), Some(TaskId::new(3))), Some(TaskId::new(4)));
        assert_eq!(pick_next(ids(&tasks), Some(TaskId::new(4))), Some(TaskId::new(1)));
        assert_eq!(pick_next(ids(&tasks), Some(TaskId::new(1))), Some(TaskId::new(3)));
        assert_eq!(pick_next(ids(&tasks), None), Some(TaskId::new(1)));
    }

    #[test]
    fn skips_tasks_that_cannot_run() {
        let tasks = [(1, S), (2, Z), (5, R), (7, S)];
        assert_eq!(pick_next(ids(&tasks), Some(TaskId::new(5))), Some(TaskId::new(5)));
        assert_eq!(pick_next(ids(&tasks), Some(TaskId::new(7))), Some(TaskId::new(5)));
        assert_eq!(pick_next(ids(&[(1, S), (2, Z)]), Some(TaskId::new(1))), None);
    }
}
