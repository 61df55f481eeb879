use kernel::{Kernel, PageFaultError};
use kernel_info::tasks::FAULT_EXIT_STATUS;
use kernel_sched::{Space, TaskContext, TaskId, TaskState};
use kernel_sim::Sim;
use kernel_syscall::{Errno, MapFlags, Sysno};
use kernel_vmem::{PageFlags, PhysMapper, VirtualAddress};

const DATA: VirtualAddress = VirtualAddress::new(0x0000_0000_1000_0000);
const UNMAPPED: VirtualAddress = VirtualAddress::new(0x0000_0000_3000_0000);

#[derive(Clone, Copy)]
struct World {
    sim: &'static Sim,
    kernel: &'static Kernel<Sim>,
}

impl World {
    fn new() -> Self {
        let sim = Sim::new(2048);
        let kernel: &'static Kernel<Sim> = Box::leak(Box::new(Kernel::new(sim)));
        sim.on_timer(move |frame| kernel.on_timer(frame));
        Self { sim, kernel }
    }

    fn user_task(
        &self,
        setup: impl FnOnce(&Space<Sim>),
        code: impl Fn(TaskContext) + Send + Sync + 'static,
    ) {
        let sched = self.kernel.scheduler();
        let space = sched.new_address_space();
        setup(&space);
        sched
            .new_user_task(space, self.sim.program(code))
            .expect("task id");
    }

    fn syscall(&self, ctx: &TaskContext, sysno: Sysno, rdi: u64, rsi: u64, rdx: u64) -> u64 {
        let mut frame = TaskContext {
            rax: sysno as u64,
            rdi,
            rsi,
            rdx,
            ..*ctx
        };
        self.kernel.on_syscall(&mut frame);
        frame.rax
    }

    fn write_user(&self, va: VirtualAddress, data: &[u8]) {
        let pa = self
            .kernel
            .scheduler()
            .with_current_space(|space| space.resolve(va))
            .expect("mapped");
        let offset = pa.frame_offset() as usize;
        // SAFETY: the page belongs to the running task.
        let bytes = unsafe { self.sim.arena().frame_bytes(pa.frame()) };
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }
}

fn errno(e: Errno) -> u64 {
    -(e as i64) as u64
}

fn user_fault() -> PageFaultError {
    PageFaultError::new().with_user(true).with_write(true)
}

#[test]
fn deferred_page_fault_resumes_the_task() {
    let w = World::new();
    w.user_task(
        |space| {
            space.map_page(DATA, PageFlags::USER_DATA | PageFlags::DEFER);
        },
        move |ctx| {
            let sched = w.kernel.scheduler();
            assert!(sched.with_current_space(|s| s.resolve(DATA)).is_none());
            w.kernel.on_page_fault(&ctx, DATA, user_fault());
            assert!(sched.with_current_space(|s| s.resolve(DATA)).is_some());
            w.sim.finish()
        },
    );
    w.kernel.scheduler().start();
}

#[test]
fn user_fault_kills_only_the_faulting_task() {
    let w = World::new();
    w.user_task(
        |_| {},
        move |ctx| {
            w.kernel.on_page_fault(&ctx, UNMAPPED, user_fault());
            unreachable!("faulting task kept running");
        },
    );
    let watcher = w.sim.program(move |_| {
        let sched = w.kernel.scheduler();
        assert_eq!(sched.task_state(TaskId::new(1)), Some(TaskState::Zombie));
        assert_eq!(sched.wait(TaskId::new(1)), Ok(FAULT_EXIT_STATUS));
        w.sim.finish()
    });
    w.kernel.scheduler().new_kernel_task(watcher).expect("task id");

    w.kernel.scheduler().start();
    assert_eq!(w.kernel.scheduler().task_count(), 1);
}

#[test]
#[should_panic(expected = "unhandled page fault in kernel mode")]
fn kernel_fault_is_fatal() {
    let w = World::new();
    let entry = w.sim.program(move |ctx| {
        w.kernel.on_page_fault(&ctx, UNMAPPED, PageFaultError::new());
        w.sim.finish()
    });
    w.kernel.scheduler().new_kernel_task(entry).expect("task id");
    w.kernel.scheduler().start();
}

#[test]
fn syscalls_map_log_clone_wait_and_exit() {
    let w = World::new();
    w.user_task(
        |_| {},
        move |ctx| {
            if ctx.rbx == 1 {
                assert_eq!(ctx.rax, 0);
                w.syscall(&ctx, Sysno::Exit, 42, 0, 0);
                unreachable!("exit returned");
            }

            let writable = MapFlags::WRITABLE.bits();
            assert_eq!(w.syscall(&ctx, Sysno::Map, DATA.as_u64(), 2, writable), 0);
            assert_eq!(
                w.syscall(&ctx, Sysno::Map, DATA.as_u64() + 0x1000, 1, writable),
                errno(Errno::Invalid)
            );
            assert_eq!(
                w.syscall(&ctx, Sysno::Map, 0xffff_9000_0000_0000, 1, writable),
                errno(Errno::Invalid)
            );

            let text = b"hello from user\n";
            w.write_user(DATA, text);
            assert_eq!(
                w.syscall(&ctx, Sysno::Log, DATA.as_u64(), text.len() as u64, 0),
                text.len() as u64
            );
            assert_eq!(
                w.syscall(&ctx, Sysno::Log, UNMAPPED.as_u64(), 4, 0),
                errno(Errno::Invalid)
            );

            let child = w.syscall(&TaskContext { rbx: 1, ..ctx }, Sysno::Clone, 0, 0, 0);
            assert_eq!(child, 2);
            assert_eq!(w.syscall(&ctx, Sysno::Wait, child, 0, 0), 42);
            assert_eq!(w.syscall(&ctx, Sysno::Wait, child, 0, 0), errno(Errno::Child));
            assert_eq!(w.syscall(&ctx, Sysno::Wait, 1, 0, 0), errno(Errno::Deadlock));
            w.sim.finish()
        },
    );
    w.kernel.scheduler().start();
}

#[test]
fn log_backs_deferred_buffers() {
    let w = World::new();
    w.user_task(
        |space| {
            space.map_page(DATA, PageFlags::USER_DATA | PageFlags::DEFER);
        },
        move |ctx| {
            assert_eq!(w.syscall(&ctx, Sysno::Log, DATA.as_u64() + 0xff8, 16, 0), errno(Errno::Invalid));
            assert!(
                w.kernel
                    .scheduler()
                    .with_current_space(|s| s.is_page_mapped(DATA))
            );
            assert_eq!(w.syscall(&ctx, Sysno::Log, DATA.as_u64(), 8, 0), 8);
            w.sim.finish()
        },
    );
    w.kernel.scheduler().start();
}

#[test]
fn kernel_tasks_cannot_map_user_pages() {
    let w = World::new();
    let entry = w.sim.program(move |ctx| {
        let flags = MapFlags::WRITABLE.bits();
        assert_eq!(w.syscall(&ctx, Sysno::Map, DATA.as_u64(), 1, flags), errno(Errno::Invalid));
        w.sim.finish()
    });
    w.kernel.scheduler().new_kernel_task(entry).expect("task id");
    w.kernel.scheduler().start();
}
