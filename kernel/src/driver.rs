//! Collaborator interfaces this core consumes but does not implement.
//!
//! Each trait here stands in for a layer that, in a complete kernel,
//! is wired up by boot code and backed by real hardware: an on-disk
//! filesystem driver, a page-table implementation, a scheduler's run
//! queue, and the architecture-specific half of signal delivery. None
//! of that belongs in this crate; what does belong is the contract
//! [`crate::dcache`], [`crate::zonemap`], and [`crate::signal`] expect
//! from it.

use alloc::boxed::Box;
use core::any::Any;

use ov6_fs_types::InodeNo;

use crate::{dcache::DeviceNo, error::KernelError, signal::StackKind};

/// Opaque, driver-owned data a dentry carries alongside its inode.
///
/// The dentry cache never inspects this; it only holds it and hands it
/// back to the driver that produced it.
pub type FsData = Box<dyn Any + Send>;

/// The filesystem driver bound to one device.
///
/// Implemented once per mounted filesystem type; [`crate::dcache`]
/// looks one up by [`DeviceNo`] and calls through it whenever a dentry
/// needs its inode populated, written back, or released.
pub trait FilesystemDriver: Send + Sync {
    /// Reads inode `ino` from disk into a fresh, driver-owned buffer.
    fn read_inode(&self, ino: InodeNo) -> Result<Box<[u8]>, KernelError>;

    /// Writes a possibly-modified inode buffer back to disk.
    fn write_inode(&self, ino: InodeNo, inode: &[u8]) -> Result<(), KernelError>;

    /// Releases an inode whose link count has dropped to zero,
    /// reclaiming its on-disk storage.
    fn free_inode(&self, ino: InodeNo) -> Result<(), KernelError>;

    /// Produces the opaque per-dentry data this driver wants attached
    /// to a freshly allocated dentry for `ino`.
    fn get_fsdata(&self, ino: InodeNo) -> FsData;
}

/// A process's address space, as seen by signal dispatch.
///
/// Setting up a signal handler's stack frame needs to read and write
/// user memory belonging to whatever process owns the target thread;
/// the page-table implementation backing that is not this crate's
/// concern.
pub trait AddressSpace {
    /// Makes this address space the one active on the current hart.
    fn load(&self);

    /// Prepares the page containing `addr` for an in-place kernel
    /// write, breaking copy-on-write sharing if necessary.
    fn prepare_for_write(&self, addr: usize) -> Result<(), KernelError>;
}

/// Architecture-specific half of the signal trampoline protocol.
///
/// The generic state machine in [`crate::signal`] decides *when* a
/// signal is delivered and *what* bookkeeping that requires; it calls
/// through this trait for the part that depends on the actual trapframe
/// layout and calling convention.
pub trait SignalStackOps {
    /// Rewrites the target thread's trapframe so that, once resumed,
    /// it enters the signal-handling trampoline with the right
    /// arguments and a return path back into the kernel.
    ///
    /// Returns whether the handler runs on the thread's existing
    /// trapframe or a freshly built stack, so [`crate::signal`] can
    /// pick the right invariant to check on restore.
    fn prepare_stack(&self, signo: u32, old_sp: usize) -> Result<StackKind, KernelError>;

    /// Reads back whatever [`prepare_stack`](Self::prepare_stack) left
    /// behind, restoring the thread's pre-signal stack pointer.
    fn restore_stack(&self) -> Result<usize, KernelError>;
}

/// The run-queue half of signal delivery.
///
/// A signal delivered to a thread that is blocked (not runnable) needs
/// to cancel that block and make the thread runnable again; conversely,
/// a thread that re-blocks while handling a signal needs to be taken
/// back off the run queue. Both are scheduler operations this crate
/// does not own.
pub trait Scheduler {
    fn enqueue(&self, thread: usize);
    fn dequeue(&self, thread: usize);

    /// Switches away from the current thread without saving its
    /// context, because the caller has already decided this thread
    /// will never run again in its current state.
    fn resched_dont_save_context(&self) -> !;
}
