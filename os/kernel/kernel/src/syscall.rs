use crate::Kernel;
use kernel_info::memory::PAGE_SIZE;
use kernel_info::tasks::MAX_LOG_BYTES;
use kernel_sched::{Platform, TaskContext, TaskId};
use kernel_syscall::{SyscallError, SyscallHandler};
use kernel_vmem::{PageFlags, SpaceKind, VirtualAddress};

impl<P: Platform> SyscallHandler for Kernel<P> {
    fn exit(&self, status: i32) -> ! {
        self.sched.terminate_current_task(status)
    }

    fn clone(&self, frame: &TaskContext) -> Result<TaskId, SyscallError> {
        Ok(self.sched.clone(frame)?)
    }

    fn wait(&self, task: TaskId) -> Result<i32, SyscallError> {
        Ok(self.sched.wait(task)?)
    }

    fn map(&self, va: VirtualAddress, pages: u64, flags: PageFlags) -> Result<(), SyscallError> {
        pages
            .checked_mul(PAGE_SIZE)
            .and_then(|len| va.as_u64().checked_add(len))
            .ok_or(SyscallError::InvalidArgument)?;

        self.sched.with_current_space(|space| {
            if space.kind() != SpaceKind::Process {
                return Err(SyscallError::InvalidArgument);
            }
            for page in 0..pages {
                let page = va.add_pages(page);
                space.check_mapping(page, flags)?;
                if space.leaf_entry(page).is_some_and(|entry| !entry.is_unused()) {
                    return Err(SyscallError::InvalidArgument);
                }
            }
            space.map_range(va, pages, flags);
            Ok(())
        })
    }

    fn log(&self, buf: VirtualAddress, len: usize) -> Result<usize, SyscallError> {
        let mut storage = [0u8; MAX_LOG_BYTES];
        let bytes = &mut storage[..len.min(MAX_LOG_BYTES)];
        self.copy_from_user(buf, bytes)?;

        let task = self.sched.current_task().map_or(0, TaskId::as_u32);
        match core::str::from_utf8(bytes) {
            Ok(text) => log::info!(target: "user", "[{task}] {}", text.trim_end()),
            Err(_) => log::info!(target: "user", "[{task}] {bytes:02x?}"),
        }
        Ok(bytes.len())
    }
}
