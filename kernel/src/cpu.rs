//! Per-hart bookkeeping.
//!
//! Hart bring-up and scheduling live outside this core; what remains
//! here is the minimum [`id()`] primitive the locking layer needs to
//! record which hart is holding a spinlock.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Sentinel stored by a lock that nothing currently holds.
pub const INVALID_CPUID: usize = usize::MAX;

static CURRENT: AtomicUsize = AtomicUsize::new(0);

/// Returns the id of the hart executing this code.
///
/// In a full boot sequence this reads a per-hart register set up at
/// startup; this core is given a single logical hart and exposes it as
/// a settable cell so callers outside of boot can still be tested.
pub fn id() -> usize {
    CURRENT.load(Ordering::Relaxed)
}

/// Overrides the hart id returned by [`id()`].
///
/// Intended for boot code and for tests that want to simulate more
/// than one hart contending for a lock.
pub fn set_id(id: usize) {
    CURRENT.store(id, Ordering::Relaxed);
}
