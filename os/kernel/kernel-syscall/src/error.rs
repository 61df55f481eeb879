use kernel_sched::{SpawnError, WaitError};
use kernel_vmem::MapError;

/// Error numbers returned (negated) to user code.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(i64)]
pub enum Errno {
    /// No child to wait for.
    Child = 10,
    /// Out of task ids.
    Again = 11,
    /// The call itself is malformed.
    Invalid = 22,
    /// Waiting would never finish.
    Deadlock = 35,
    /// No such system call.
    NoSys = 38,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum SyscallError {
    #[error("unknown system call {0}")]
    UnknownSyscall(u64),
    #[error("invalid argument")]
    InvalidArgument,
    #[error(transparent)]
    Wait(#[from] WaitError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

impl From<MapError> for SyscallError {
    fn from(_: MapError) -> Self {
        Self::InvalidArgument
    }
}

impl SyscallError {
    #[must_use]
    pub const fn errno(self) -> Errno {
        match self {
            Self::UnknownSyscall(_) => Errno::NoSys,
            Self::InvalidArgument => Errno::Invalid,
            Self::Wait(WaitError::NoSuchTask(_) | WaitError::NotAChild) => Errno::Child,
            Self::Wait(WaitError::SelfWait) => Errno::Deadlock,
            Self::Spawn(SpawnError::NoTaskIdsLeft) => Errno::Again,
            Self::Spawn(SpawnError::KernelFrame) => Errno::Invalid,
        }
    }

    /// The value user code finds in `rax`.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn to_return_value(self) -> u64 {
        -(self.errno() as i64) as u64
    }
}
