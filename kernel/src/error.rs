//! Kernel-wide error type shared by the dentry cache, the zone map, and
//! signal dispatch.

use ov6_fs_types::InodeNo;

use crate::dcache::DeviceNo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("dentry for device {0:?} inode {1:?} not found in cache")]
    DentryNotFound(DeviceNo, InodeNo),

    #[error("zone at {0:#x} not found")]
    ZoneNotFound(usize),

    #[error("requested range {start:#x}..{end:#x} overlaps an existing zone")]
    ZoneOverlap { start: usize, end: usize },

    #[error("no placement for a zone of length {0:#x}")]
    ZoneOutOfSpace(usize),

    #[error("signal number {0} is out of range")]
    InvalidSignal(u32),

    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error")]
    IoError,

    #[error("fatal: {0}")]
    Fatal(&'static str),
}
