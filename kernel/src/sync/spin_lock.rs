use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use mutex_api::Mutex;

use crate::{
    cpu::{self, INVALID_CPUID},
    interrupt,
};

#[derive(Default)]
struct RawSpinLock {
    locked: AtomicBool,
    cpuid: UnsafeCell<usize>,
}

unsafe impl Sync for RawSpinLock {}

impl RawSpinLock {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            cpuid: UnsafeCell::new(INVALID_CPUID),
        }
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired.
    fn acquire(&self) {
        // Disable interrupts to avoid deadlocking with an interrupt
        // handler that wants this same lock.
        let int_guard = interrupt::push_disabled();

        assert!(!self.holding());

        while self.locked.swap(true, Ordering::Acquire) {}

        unsafe {
            *self.cpuid.get() = cpu::id();
        }

        int_guard.forget(); // drop re-enables interrupts, so we must forget it here.
    }

    /// Releases the lock.
    fn release(&self) {
        assert!(self.holding());

        unsafe {
            *self.cpuid.get() = INVALID_CPUID;
        }

        self.locked.store(false, Ordering::Release);

        unsafe {
            interrupt::pop_disabled();
        }
    }

    /// Checks whether this hart is holding the lock.
    ///
    /// Interrupts must be off.
    fn holding(&self) -> bool {
        assert!(!interrupt::is_enabled());
        self.locked.load(Ordering::Relaxed) && unsafe { *self.cpuid.get() } == cpu::id()
    }
}

/// A lock that spins until acquired, disabling interrupts while held.
///
/// Mirrors the block lock / dentry lock pair used by the dentry cache:
/// cheap to acquire, never blocks on I/O, and safe to nest as long as
/// acquisition order is respected by the caller.
#[derive(Default)]
pub struct SpinLock<T> {
    lock: RawSpinLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.lock.acquire();
        SpinLockGuard { lock: self }
    }
}

impl<T> Mutex for SpinLock<T> {
    type Data = T;
    type Guard<'a>
        = SpinLockGuard<'a, T>
    where
        T: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.lock()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T> Send for SpinLockGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_excludes_concurrent_mutation() {
        crate::cpu::set_id(0);
        let lock = SpinLock::new(0_u32);
        *lock.lock() += 1;
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 2);
    }
}
