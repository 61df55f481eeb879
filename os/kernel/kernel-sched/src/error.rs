use crate::task::TaskId;

/// Why `wait` could not collect a task.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum WaitError {
    #[error("no task with id {0}")]
    NoSuchTask(TaskId),
    #[error("task is not a child of the caller")]
    NotAChild,
    #[error("a task cannot wait for itself")]
    SelfWait,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum SpawnError {
    #[error("every task id is in use")]
    NoTaskIdsLeft,
    #[error("only a trap frame from user mode can be cloned")]
    KernelFrame,
}
