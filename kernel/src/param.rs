//! Kernel-wide tunable constants.
//!
//! These stand in for the board-specific parameter crate a real boot
//! sequence would supply; values are chosen to match the reference
//! implementation this core was modeled on.

/// Bytes per page.
pub const PAGE_SIZE: usize = 4096;

/// Bits of offset within a page.
pub const PAGE_SHIFT: usize = 12;

/// Highest virtual address available to a process; zones placed by
/// [`crate::zonemap`] never extend past this.
pub const KERNEL_BASE: usize = 0x8000_0000;

/// Number of dentry slots packed into a single cache block.
///
/// Chosen so that `size_of::<DentrySlot>() * DENTRIES_PER_BLOCK` stays
/// close to a page.
pub const DENTRIES_PER_BLOCK: usize = 64;

/// Cached inode bytes above which [`crate::dcache`] stops keeping inode
/// buffers for unreferenced dentries and starts evicting them.
pub const DENTRY_SWAP_THRESHOLD: usize = 16 * 1024;

/// Period between passes of the background dentry flusher, in whatever
/// time unit the scheduler's sleep interface uses.
pub const DENTRY_FLUSHER_PERIOD_SECS: u64 = 2;

/// Number of distinct signal numbers a thread can track.
pub const SIGNALS_CNT: usize = 32;
