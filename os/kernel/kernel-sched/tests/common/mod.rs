#![allow(dead_code)]

use kernel_sched::{Scheduler, TaskContext, TaskId};
use kernel_sim::Sim;
use kernel_vmem::{PhysMapper, VirtualAddress};
use std::sync::atomic::{AtomicUsize, Ordering};

pub type Sched = Scheduler<Sim>;

/// A simulated machine with a scheduler wired to its timer.
#[derive(Clone, Copy)]
pub struct World {
    pub sim: &'static Sim,
    pub sched: &'static Sched,
}

impl World {
    pub fn new() -> Self {
        let sim = Sim::new(2048);
        let sched: &'static Sched = Box::leak(Box::new(Scheduler::new(sim)));
        sim.on_timer(move |frame| sched.on_timer_tick(frame));
        Self { sim, sched }
    }

    pub fn kernel_task(&self, code: impl Fn(TaskContext) + Send + Sync + 'static) -> TaskId {
        let entry = self.sim.program(code);
        self.sched.new_kernel_task(entry).expect("task id")
    }

    /// The running task's id.
    pub fn me(&self) -> TaskId {
        self.sched.current_task().expect("running task")
    }

    /// Ends the running task; the last of `left` tasks ends the simulation.
    pub fn retire(&self, left: &AtomicUsize) -> ! {
        if left.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.sim.finish()
        }
        self.sched.terminate_current_task(0)
    }

    /// Reads a byte of the running task's memory.
    pub fn peek(&self, va: VirtualAddress) -> u8 {
        let pa = self
            .sched
            .with_current_space(|space| space.resolve(va))
            .expect("mapped");
        // SAFETY: the arena owns the frame; tests run one task at a time.
        unsafe { self.sim.arena().frame_bytes(pa.frame())[pa.frame_offset() as usize] }
    }

    /// Writes a byte of the running task's memory.
    pub fn poke(&self, va: VirtualAddress, value: u8) {
        let pa = self
            .sched
            .with_current_space(|space| space.resolve(va))
            .expect("mapped");
        // SAFETY: see `peek`.
        unsafe { self.sim.arena().frame_bytes(pa.frame())[pa.frame_offset() as usize] = value };
    }
}
