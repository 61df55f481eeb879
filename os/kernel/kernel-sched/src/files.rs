//! Per-task table of open handles.
//!
//! The file system itself lives elsewhere; the scheduler only needs to keep
//! each task's handles and pass a copy to cloned children.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;

/// Index into a [`FileTable`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Fd(pub u32);

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum FileError {
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("operation not supported by this handle")]
    Unsupported,
}

/// Something a task can read from or write to.
pub trait FileHandle: Send + Sync {
    /// # Errors
    /// [`FileError::Unsupported`] unless overridden.
    fn read(&self, buf: &mut [u8]) -> Result<usize, FileError> {
        let _ = buf;
        Err(FileError::Unsupported)
    }

    /// # Errors
    /// [`FileError::Unsupported`] unless overridden.
    fn write(&self, buf: &[u8]) -> Result<usize, FileError> {
        let _ = buf;
        Err(FileError::Unsupported)
    }
}

/// Open handles of one task. Cloning shares the handles.
#[derive(Clone, Default)]
pub struct FileTable {
    slots: BTreeMap<Fd, Arc<dyn FileHandle>>,
}

impl FileTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }

    /// Installs `handle` at the lowest free descriptor.
    pub fn open(&mut self, handle: Arc<dyn FileHandle>) -> Fd {
        let fd = (0..)
            .map(Fd)
            .find(|fd| !self.slots.contains_key(fd))
            .unwrap_or(Fd(u32::MAX));
        self.slots.insert(fd, handle);
        fd
    }

    /// # Errors
    /// [`FileError::BadDescriptor`] if `fd` is not open.
    pub fn get(&self, fd: Fd) -> Result<&Arc<dyn FileHandle>, FileError> {
        self.slots.get(&fd).ok_or(FileError::BadDescriptor)
    }

    /// # Errors
    /// [`FileError::BadDescriptor`] if `fd` is not open.
    pub fn close(&mut self, fd: Fd) -> Result<(), FileError> {
        self.slots.remove(&fd).map(drop).ok_or(FileError::BadDescriptor)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for FileTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.slots.keys()).finish()
    }
}
