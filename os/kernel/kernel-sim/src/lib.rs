//! # Simulated CPU
//!
//! A [`Platform`] for running the scheduler on a host, in tests.
//!
//! Every task gets a host thread, but only the thread holding the *baton*
//! executes; a switch passes the baton and blocks until it comes back. That
//! reproduces a single core: tasks interleave only at switches, and a
//! blocked task resumes exactly where it switched out.
//!
//! Task code is a Rust closure registered with [`Sim::program`], which hands
//! out the fake instruction pointer a task context starts at. Interrupts are
//! simulated too:
//!
//! - [`Sim::tick`] is a point where the timer may fire; it does when the
//!   timer is unmasked and the calling task has interrupts enabled.
//! - [`Sim::raise`] queues an interrupt that is delivered the next time the
//!   CPU idles. Idling without a queued interrupt is a deadlock and panics.
//!
//! The thread that created the scheduler plays the boot context.
//! [`Sim::finish`] hands the baton back to it, which makes
//! [`Scheduler::start`](kernel_sched::Scheduler::start) return. A panic on
//! any task thread is re-raised on the boot thread.

#![allow(unsafe_code)]

mod mmu;

pub use mmu::SimMmu;

use kernel_alloc::FrameArena;
use kernel_sched::{KernelContext, Platform, TaskContext, TaskId};
use kernel_sync::IrqGuard;
use kernel_sync::irq::{cli_stop_interrupts, interrupts_enabled, sti_enable_interrupts};
use kernel_vmem::VirtualAddress;
use std::any::Any;
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};

/// Token of the boot context.
const BOOT: u64 = 0;

/// Where [`Sim::program`] places the first program.
const PROGRAM_BASE: u64 = 0x0000_0000_0040_0000;

thread_local! {
    static TOKEN: Cell<u64> = const { Cell::new(BOOT) };
    static FRAME: Cell<TaskContext> = Cell::new(TaskContext::default());
}

type Program = Arc<dyn Fn(TaskContext) + Send + Sync>;
type Irq = Box<dyn FnOnce() + Send>;
type TimerHandler = Box<dyn Fn(&TaskContext) + Send + Sync>;

pub struct Sim {
    inner: Arc<Inner>,
    arena: &'static FrameArena,
    mmu: SimMmu,
}

struct Inner {
    baton: Mutex<Baton>,
    turn: Condvar,
    programs: Mutex<HashMap<u64, Program>>,
    next_program: AtomicU64,
    irqs: Mutex<VecDeque<Irq>>,
    timer: OnceLock<TimerHandler>,
    timer_masked: AtomicBool,
    kernel_stack: AtomicU64,
    ticks: AtomicUsize,
    switches: AtomicUsize,
}

struct Baton {
    running: u64,
    next_token: u64,
    threads: HashMap<TaskId, u64>,
    failure: Option<Box<dyn Any + Send>>,
}

/// A task context address handed to the task's thread.
struct StartPtr(*const TaskContext);

// SAFETY: the thread only reads through it once it holds the baton, while the
// scheduler keeps the task alive.
unsafe impl Send for StartPtr {}

impl Sim {
    /// A simulated machine with `frames` frames of physical memory.
    #[must_use]
    pub fn new(frames: usize) -> &'static Self {
        let arena: &'static FrameArena = Box::leak(Box::new(FrameArena::new(frames)));
        Box::leak(Box::new(Self {
            inner: Arc::new(Inner {
                baton: Mutex::new(Baton {
                    running: BOOT,
                    next_token: BOOT + 1,
                    threads: HashMap::new(),
                    failure: None,
                }),
                turn: Condvar::new(),
                programs: Mutex::new(HashMap::new()),
                next_program: AtomicU64::new(PROGRAM_BASE),
                irqs: Mutex::new(VecDeque::new()),
                timer: OnceLock::new(),
                timer_masked: AtomicBool::new(true),
                kernel_stack: AtomicU64::new(0),
                ticks: AtomicUsize::new(0),
                switches: AtomicUsize::new(0),
            }),
            arena,
            mmu: SimMmu::new(arena),
        }))
    }

    #[must_use]
    pub const fn arena(&self) -> &'static FrameArena {
        self.arena
    }

    /// Registers task code and returns the address a context enters it at.
    pub fn program(&self, code: impl Fn(TaskContext) + Send + Sync + 'static) -> VirtualAddress {
        let rip = self.inner.next_program.fetch_add(0x1000, Ordering::Relaxed);
        lock(&self.inner.programs).insert(rip, Arc::new(code));
        VirtualAddress::new(rip)
    }

    /// Installs the timer interrupt handler.
    ///
    /// # Panics
    /// If a handler is already installed.
    pub fn on_timer(&self, handler: impl Fn(&TaskContext) + Send + Sync + 'static) {
        assert!(
            self.inner.timer.set(Box::new(handler)).is_ok(),
            "timer handler already installed"
        );
    }

    /// A point where the timer interrupt may arrive.
    pub fn tick(&self) {
        if self.inner.timer_masked.load(Ordering::Acquire) || !interrupts_enabled() {
            return;
        }
        let Some(handler) = self.inner.timer.get() else {
            return;
        };
        let tick = self.inner.ticks.fetch_add(1, Ordering::Relaxed);
        log::trace!("timer tick {tick}");
        let mut frame = FRAME.get();
        frame.rflags |= kernel_sched::config::RFLAGS_IF;
        let _irq = IrqGuard::new();
        handler(&frame);
    }

    /// Queues an interrupt for the next time the CPU idles.
    pub fn raise(&self, irq: impl FnOnce() + Send + 'static) {
        lock(&self.inner.irqs).push_back(Box::new(irq));
    }

    /// Hands the CPU back to the boot context for good.
    pub fn finish(&self) -> ! {
        log::debug!("returning to the boot context");
        let mut baton = lock(&self.inner.baton);
        baton.running = BOOT;
        self.inner.turn.notify_all();
        loop {
            baton = self
                .inner
                .turn
                .wait(baton)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// The context the calling task was last entered with.
    #[must_use]
    pub fn frame(&self) -> TaskContext {
        FRAME.get()
    }

    #[must_use]
    pub fn timer_masked(&self) -> bool {
        self.inner.timer_masked.load(Ordering::Acquire)
    }

    /// Last stack top passed to [`Platform::set_kernel_stack`].
    #[must_use]
    pub fn kernel_stack(&self) -> VirtualAddress {
        VirtualAddress::new(self.inner.kernel_stack.load(Ordering::Acquire))
    }

    /// Timer interrupts delivered so far.
    #[must_use]
    pub fn ticks(&self) -> usize {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    /// Context switches so far.
    #[must_use]
    pub fn switches(&self) -> usize {
        self.inner.switches.load(Ordering::Relaxed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    /// Blocks the calling thread until `token` holds the baton. The boot
    /// context also wakes up to re-raise a task's panic.
    fn wait_turn(&self, token: u64) {
        let mut baton = lock(&self.baton);
        loop {
            // A failing task also hands the baton to the boot context, so the
            // failure has to be looked at first.
            if token == BOOT
                && let Some(payload) = baton.failure.take()
            {
                drop(baton);
                resume_unwind(payload);
            }
            if baton.running == token {
                return;
            }
            baton = self.turn.wait(baton).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn fail(&self, payload: Box<dyn Any + Send>) {
        let mut baton = lock(&self.baton);
        baton.failure = Some(payload);
        baton.running = BOOT;
        self.turn.notify_all();
    }

    fn enter(&self, context: *const TaskContext) -> ! {
        // SAFETY: the scheduler keeps the context alive while the task runs.
        let context = unsafe { *context };
        FRAME.set(context);
        if context.interrupts_enabled() {
            sti_enable_interrupts();
        } else {
            cli_stop_interrupts();
        }
        let program = lock(&self.programs).get(&context.rip).cloned();
        let Some(program) = program else {
            panic!("no program at rip {:#x}", context.rip);
        };
        program(context);
        panic!("task returned from its entry point at {:#x}", context.rip);
    }
}

impl Platform for Sim {
    type Mapper = FrameArena;
    type Frames = FrameArena;
    type Mmu = SimMmu;

    fn mapper(&self) -> &'static FrameArena {
        self.arena
    }

    fn frames(&self) -> &'static FrameArena {
        self.arena
    }

    fn mmu(&self) -> &SimMmu {
        &self.mmu
    }

    fn set_timer_masked(&self, masked: bool) {
        self.inner.timer_masked.store(masked, Ordering::Release);
    }

    fn set_kernel_stack(&self, top: VirtualAddress) {
        self.inner.kernel_stack.store(top.as_u64(), Ordering::Release);
    }

    fn wait_for_interrupt(&self) {
        let pending: Vec<Irq> = lock(&self.inner.irqs).drain(..).collect();
        assert!(
            !pending.is_empty(),
            "deadlock: nothing is runnable and no interrupt is pending"
        );
        for irq in pending {
            irq();
        }
    }

    unsafe fn prepare_entry(
        &self,
        task: TaskId,
        kernel: &mut KernelContext,
        stack_top: VirtualAddress,
        context: *const TaskContext,
    ) {
        kernel.stack_top = stack_top.as_u64();
        kernel.start = context as u64;

        let token = {
            let mut baton = lock(&self.inner.baton);
            let token = baton.next_token;
            baton.next_token += 1;
            baton.threads.insert(task, token);
            token
        };

        let inner = Arc::clone(&self.inner);
        let start = StartPtr(context);
        std::thread::Builder::new()
            .name(format!("task-{task}"))
            .spawn(move || {
                let start = start;
                TOKEN.set(token);
                inner.wait_turn(token);
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| inner.enter(start.0))) {
                    inner.fail(payload);
                }
            })
            .unwrap_or_else(|e| panic!("cannot spawn thread for task {task}: {e}"));
    }

    unsafe fn switch(&self, _prev: *mut KernelContext, _next: *const KernelContext, next_task: TaskId) {
        let me = TOKEN.get();
        {
            let mut baton = lock(&self.inner.baton);
            let token = baton.threads.get(&next_task).copied();
            let Some(token) = token else {
                drop(baton);
                panic!("switch to task {next_task}, which has no thread");
            };
            log::trace!("baton {me} -> {token} (task {next_task})");
            baton.running = token;
            self.inner.switches.fetch_add(1, Ordering::Relaxed);
            self.inner.turn.notify_all();
        }
        self.inner.wait_turn(me);
    }

    unsafe fn resume(&self, context: *const TaskContext) -> ! {
        self.inner.enter(context)
    }
}
