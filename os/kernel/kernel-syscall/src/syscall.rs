use crate::error::SyscallError;
use bitflags::bitflags;
use kernel_info::tasks::{MAX_LOG_BYTES, MAX_MAP_PAGES};
use kernel_sched::{TaskContext, TaskId};
use kernel_vmem::{PageFlags, VirtualAddress};

#[repr(u64)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Sysno {
    /// End the calling task with a status.
    Exit = 1,
    /// Duplicate the calling task, memory included.
    Clone = 2,
    /// Collect the exit status of a task.
    Wait = 3,
    /// Map fresh private pages.
    Map = 4,
    /// Print a user buffer to the kernel log.
    Log = 5,
}

impl TryFrom<u64> for Sysno {
    type Error = SyscallError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            x if x == Self::Exit as u64 => Self::Exit,
            x if x == Self::Clone as u64 => Self::Clone,
            x if x == Self::Wait as u64 => Self::Wait,
            x if x == Self::Map as u64 => Self::Map,
            x if x == Self::Log as u64 => Self::Log,
            _ => return Err(SyscallError::UnknownSyscall(value)),
        })
    }
}

bitflags! {
    /// Protection requested by [`Sysno::Map`].
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct MapFlags: u64 {
        const WRITABLE = 1 << 0;
        const EXECUTABLE = 1 << 1;
        /// Reserve only; frames are allocated on first touch.
        const DEFER = 1 << 2;
    }
}

impl MapFlags {
    /// Leaf flags for a private user page.
    #[must_use]
    pub const fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::USER;
        if self.contains(Self::WRITABLE) {
            flags = flags.union(PageFlags::WRITABLE);
        }
        if !self.contains(Self::EXECUTABLE) {
            flags = flags.union(PageFlags::NO_EXECUTE);
        }
        if self.contains(Self::DEFER) {
            flags = flags.union(PageFlags::DEFER);
        }
        flags
    }
}

/// A decoded system call.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Syscall {
    Exit { status: i32 },
    Clone,
    Wait { task: TaskId },
    Map { va: VirtualAddress, pages: u64, flags: MapFlags },
    /// `len` is already capped at [`MAX_LOG_BYTES`].
    Log { buf: VirtualAddress, len: usize },
}

impl Syscall {
    /// Reads the call number and arguments from a trap frame.
    ///
    /// # Errors
    /// [`SyscallError::UnknownSyscall`] or [`SyscallError::InvalidArgument`].
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn decode(frame: &TaskContext) -> Result<Self, SyscallError> {
        Ok(match Sysno::try_from(frame.rax)? {
            // Only the low half of the register carries the status.
            Sysno::Exit => Self::Exit {
                status: frame.rdi as u32 as i32,
            },
            Sysno::Clone => Self::Clone,
            Sysno::Wait => {
                let id = u32::try_from(frame.rdi).map_err(|_| SyscallError::InvalidArgument)?;
                if id == 0 {
                    return Err(SyscallError::InvalidArgument);
                }
                Self::Wait { task: TaskId::new(id) }
            }
            Sysno::Map => {
                let va = VirtualAddress::new(frame.rdi);
                let pages = frame.rsi;
                let flags = MapFlags::from_bits(frame.rdx).ok_or(SyscallError::InvalidArgument)?;
                if !va.is_page_aligned() || pages == 0 || pages > MAX_MAP_PAGES {
                    return Err(SyscallError::InvalidArgument);
                }
                Self::Map { va, pages, flags }
            }
            Sysno::Log => Self::Log {
                buf: VirtualAddress::new(frame.rdi),
                len: usize::try_from(frame.rsi).map_or(MAX_LOG_BYTES, |len| len.min(MAX_LOG_BYTES)),
            },
        })
    }
}

/// What the kernel provides to system calls. All of them act on the
/// running task.
pub trait SyscallHandler {
    fn exit(&self, status: i32) -> !;

    /// `frame` is the caller's state; the child resumes from it.
    ///
    /// # Errors
    /// If the child cannot be created.
    fn clone(&self, frame: &TaskContext) -> Result<TaskId, SyscallError>;

    /// # Errors
    /// If `task` cannot be waited for.
    fn wait(&self, task: TaskId) -> Result<i32, SyscallError>;

    /// # Errors
    /// If any page is outside the private range or already in use.
    fn map(&self, va: VirtualAddress, pages: u64, flags: PageFlags) -> Result<(), SyscallError>;

    /// # Errors
    /// If the buffer is not readable user memory.
    fn log(&self, buf: VirtualAddress, len: usize) -> Result<usize, SyscallError>;
}

/// Decodes the call in `frame`, runs it, and stores the result in `frame.rax`.
pub fn dispatch(handler: &impl SyscallHandler, frame: &mut TaskContext) {
    let sysno = frame.rax;
    let caller = *frame;
    let result = Syscall::decode(&caller).and_then(|call| {
        log::trace!("syscall {call:?}");
        match call {
            Syscall::Exit { status } => handler.exit(status),
            Syscall::Clone => handler.clone(&caller).map(|id| u64::from(id.as_u32())),
            #[allow(clippy::cast_sign_loss)]
            Syscall::Wait { task } => handler.wait(task).map(|status| u64::from(status as u32)),
            Syscall::Map { va, pages, flags } => handler.map(va, pages, flags.page_flags()).map(|()| 0),
            Syscall::Log { buf, len } => handler.log(buf, len).map(|n| n as u64),
        }
    });

    frame.rax = match result {
        Ok(value) => value,
        Err(e) => {
            log::debug!("syscall {sysno} failed: {e}");
            e.to_return_value()
        }
    };
}
