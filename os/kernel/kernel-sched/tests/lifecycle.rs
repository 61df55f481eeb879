mod common;

use common::World;
use kernel_sched::config::{STACK_SIZE, USER_STACK_TOP};
use kernel_sched::{Platform, SpawnError, TaskContext, TaskId, TaskState, WaitError};
use kernel_vmem::{FaultError, Mmu, PageFlags, VirtualAddress};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const DATA: VirtualAddress = VirtualAddress::new(0x0000_0000_1000_0000);

#[test]
fn wait_collects_the_exit_status_once() {
    let w = World::new();
    let frames_after = Arc::new(AtomicUsize::new(0));
    let frames_before = Arc::new(AtomicUsize::new(0));

    let (before, after) = (Arc::clone(&frames_before), Arc::clone(&frames_after));
    let parent = w.kernel_task(move |_| {
        before.store(w.sim.arena().allocated_frames(), Ordering::Release);
        let child = w
            .sched
            .new_kernel_task(w.sim.program(move |_| w.sched.terminate_current_task(7)))
            .expect("task id");
        assert_eq!(w.sched.parent_of(child), Some(w.me()));

        assert_eq!(w.sched.wait(child), Ok(7));
        assert_eq!(w.sched.wait(child), Err(WaitError::NoSuchTask(child)));
        assert_eq!(w.sched.task_state(child), None);
        after.store(w.sim.arena().allocated_frames(), Ordering::Release);

        // Boot-created tasks may be collected by anyone.
        assert_eq!(w.sched.wait(TaskId::new(2)), Ok(3));
        w.sim.finish()
    });
    w.kernel_task(move |_| w.sched.terminate_current_task(3));

    w.sched.start();
    assert_eq!(w.sched.task_count(), 1);
    assert_eq!(w.sched.task_state(parent), Some(TaskState::Runnable));
    assert_eq!(
        frames_after.load(Ordering::Acquire),
        frames_before.load(Ordering::Acquire)
    );
}

#[test]
fn wait_rejects_invalid_targets() {
    let w = World::new();
    let owner = w.kernel_task(move |_| {
        let child = w
            .sched
            .new_kernel_task(w.sim.program(move |_| w.sched.terminate_current_task(5)))
            .expect("task id");
        assert_eq!(child, TaskId::new(3));
        assert_eq!(w.sched.wait(child), Ok(5));
        w.sim.finish()
    });
    w.kernel_task(move |_| {
        let me = w.me();
        assert_eq!(w.sched.wait(TaskId::new(3)), Err(WaitError::NotAChild));
        assert_eq!(w.sched.wait(me), Err(WaitError::SelfWait));
        assert_eq!(
            w.sched.wait(TaskId::new(99)),
            Err(WaitError::NoSuchTask(TaskId::new(99)))
        );
        assert_eq!(w.sched.parent_of(me), None);
        w.sched.terminate_current_task(0)
    });

    w.sched.start();
    assert_eq!(w.sched.task_state(owner), Some(TaskState::Runnable));
    assert_eq!(w.sched.task_state(TaskId::new(3)), None);
}

#[test]
fn orphans_lose_their_parent() {
    let w = World::new();
    let orphan = TaskId::new(3);

    w.kernel_task(move |_| {
        let child = w
            .sched
            .new_kernel_task(w.sim.program(move |_| w.sched.terminate_current_task(9)))
            .expect("task id");
        assert_eq!(child, orphan);
        assert_eq!(w.sched.parent_of(child), Some(w.me()));
        w.sched.terminate_current_task(0)
    });
    w.kernel_task(move |_| {
        assert_eq!(w.sched.parent_of(orphan), None);
        assert_eq!(w.sched.wait(orphan), Ok(9));
        assert_eq!(w.sched.wait(TaskId::new(1)), Ok(0));
        w.sim.finish()
    });

    w.sched.start();
    assert_eq!(w.sched.task_count(), 1);
}

#[test]
fn clone_gives_the_child_a_private_copy() {
    let w = World::new();
    let child_frame = Arc::new(AtomicU64::new(0));

    let space = w.sched.new_address_space();
    space.map_page(DATA, PageFlags::USER_DATA);
    let parent_root = space.root();

    let seen = Arc::clone(&child_frame);
    let entry = w.sim.program(move |ctx| {
        if ctx.rbx == 1 {
            // Child: sees the copy taken at clone time.
            assert_eq!(ctx.rax, 0);
            assert_ne!(w.sched.with_current_space(|s| s.root()), parent_root);
            let pa = w.sched.with_current_space(|s| s.resolve(DATA)).expect("copied");
            seen.store(pa.as_u64(), Ordering::Release);
            let value = w.peek(DATA);
            w.poke(DATA, 0x33);
            w.sched.terminate_current_task(i32::from(value));
        }

        assert!(ctx.is_user());
        w.poke(DATA, 0x11);
        let mut frame = w.sim.frame();
        frame.rax = 57;
        frame.rbx = 1;
        let child = w.sched.clone(&frame).expect("task id");
        assert_eq!(w.sched.parent_of(child), Some(w.me()));
        w.poke(DATA, 0x22);

        assert_eq!(w.sched.wait(child), Ok(0x11));
        assert_eq!(w.peek(DATA), 0x22);
        w.sim.finish()
    });
    w.sched.new_user_task(space, entry).expect("task id");

    w.sched.start();
    assert_ne!(child_frame.load(Ordering::Acquire), 0);
}

#[test]
fn clone_refuses_kernel_mode_frames() {
    let w = World::new();
    w.kernel_task(move |ctx| {
        assert_eq!(w.sched.clone(&ctx), Err(SpawnError::KernelFrame));
        w.sched.yield_now();
        unreachable!("the user task ends the run");
    });
    let space = w.sched.new_address_space();
    let entry = w.sim.program(move |ctx| {
        let frame = TaskContext::kernel(VirtualAddress::new(ctx.rip), w.me().kernel_stack_top());
        assert!(!frame.is_user());
        assert_eq!(w.sched.clone(&frame), Err(SpawnError::KernelFrame));
        w.sim.finish()
    });
    w.sched.new_user_task(space, entry).expect("task id");

    w.sched.start();
    assert_eq!(w.sched.task_count(), 2);
}

#[test]
fn exiting_frees_the_space_once_the_kernel_space_is_installed() {
    let w = World::new();
    let kernel_root = w.sched.with_kernel_space(|space| space.root());
    let space = w.sched.new_address_space();
    space.map_range(DATA, 4, PageFlags::USER_DATA);
    let entry = w.sim.program(move |_| w.sched.terminate_current_task(5));
    let child = w.sched.new_user_task(space, entry).expect("task id");
    let after_exit = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&after_exit);
    w.kernel_task(move |_| {
        assert_eq!(w.sched.wait(child), Ok(5));
        assert_eq!(w.sim.mmu().active_root(), kernel_root);
        seen.store(w.sim.arena().allocated_frames(), Ordering::Release);
        w.sim.finish()
    });
    let before = w.sim.arena().allocated_frames();

    w.sched.start();
    // Data pages, user stack and tables of the child are gone.
    assert!(after_exit.load(Ordering::Acquire) + 4 < before);
}

#[test]
fn downgrade_enters_user_mode_with_a_fresh_space() {
    let w = World::new();
    let kernel_root = w.sched.with_kernel_space(|space| space.root());
    let user = w.sim.program(move |ctx| {
        assert!(ctx.is_user());
        assert!(ctx.interrupts_enabled());
        assert_eq!(ctx.rsp, USER_STACK_TOP);
        let root = w.sched.with_current_space(|space| space.root());
        assert_ne!(root, kernel_root);
        assert_eq!(w.sim.mmu().active_root(), root);
        w.sched.with_current_space(|space| {
            assert!(space.is_page_mapped(VirtualAddress::new(USER_STACK_TOP - 8)));
            assert!(space.is_page_mapped(VirtualAddress::new(USER_STACK_TOP - STACK_SIZE)));
        });
        w.sim.finish()
    });
    w.kernel_task(move |ctx| {
        assert!(!ctx.is_user());
        w.sched.downgrade_current_task(user)
    });

    w.sched.start();
}

#[test]
fn deferred_pages_are_backed_on_first_fault() {
    let w = World::new();
    let space = w.sched.new_address_space();
    space.map_page(DATA, PageFlags::USER_DATA | PageFlags::DEFER);
    let entry = w.sim.program(move |_| {
        assert_eq!(w.sched.with_current_space(|s| s.resolve(DATA)), None);
        w.sched.handle_page_fault(DATA).expect("deferred");
        assert_eq!(w.peek(DATA), 0);
        assert_eq!(
            w.sched.handle_page_fault(DATA),
            Err(FaultError::AlreadyPresent(DATA))
        );
        let stray = VirtualAddress::new(0x0000_0000_2000_0000);
        assert_eq!(w.sched.handle_page_fault(stray), Err(FaultError::NotMapped(stray)));
        w.sim.finish()
    });
    w.sched.new_user_task(space, entry).expect("task id");

    w.sched.start();
}

#[test]
fn timer_preempts_user_tasks() {
    let w = World::new();
    let left = Arc::new(AtomicUsize::new(2));
    for _ in 0..2 {
        let left = Arc::clone(&left);
        let entry = w.sim.program(move |ctx| {
            w.sched.save_current_task(&ctx);
            w.sim.tick();
            w.retire(&left)
        });
        let space = w.sched.new_address_space();
        w.sched.new_user_task(space, entry).expect("task id");
    }

    w.sched.start();
    assert_eq!(w.sim.ticks(), 2);
    assert_eq!(w.sim.switches(), 4);
}

#[test]
#[should_panic(expected = "user mode with interrupts disabled")]
fn user_frame_without_interrupts_is_fatal() {
    let w = World::new();
    let entry = w.sim.program(move |ctx| {
        let mut frame = ctx;
        frame.rflags = 0;
        w.sched.save_current_task(&frame);
        w.sim.finish()
    });
    let space = w.sched.new_address_space();
    w.sched.new_user_task(space, entry).expect("task id");
    w.sched.start();
}
