//! Utilities for controlling interrupt enability.
//!
//! The real trap-vectoring and PLIC setup this would gate lives in the
//! platform layer, outside this core. What's kept is the push/pop
//! disabled-depth discipline [`crate::sync::SpinLock`] is built on: a
//! lock must disable interrupts for as long as it is held, and nested
//! acquisitions must not re-enable interrupts early.

use core::{
    mem,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

const NHART: usize = 8;

static CPU_STATE: [CpuState; NHART] = [const { CpuState::new() }; NHART];

/// Enables interrupts on the current hart.
pub fn enable() {
    let cpuid = crate::cpu::id();
    CPU_STATE[cpuid].enabled.store(true, Ordering::Relaxed);
}

/// Disables interrupts on the current hart.
pub fn disable() {
    let cpuid = crate::cpu::id();
    CPU_STATE[cpuid].enabled.store(false, Ordering::Relaxed);
}

/// Returns `true` if interrupts are enabled on the current hart.
pub fn is_enabled() -> bool {
    let cpuid = crate::cpu::id();
    CPU_STATE[cpuid].enabled.load(Ordering::Relaxed)
}

/// Returns depth of [`push_disabled()`] calls.
pub fn disabled_depth() -> usize {
    let cpuid = crate::cpu::id();
    CPU_STATE[cpuid].push_depth.load(Ordering::Relaxed)
}

/// Saves current interrupt enable state and disables interrupts.
pub fn push_disabled() -> Guard {
    let current = is_enabled();
    disable();

    let cpuid = crate::cpu::id();
    CPU_STATE[cpuid].push_disabled(current);
    Guard { cpuid }
}

/// Restores interrupt enable state saved by [`push_disabled()`].
///
/// # Safety
///
/// Must be paired with an earlier [`push_disabled()`] on the same hart.
pub unsafe fn pop_disabled() {
    drop(Guard {
        cpuid: crate::cpu::id(),
    });
}

/// Guard that restores interrupt enable state when dropped.
pub struct Guard {
    cpuid: usize,
}

impl Drop for Guard {
    fn drop(&mut self) {
        let cpuid = crate::cpu::id();
        assert_eq!(self.cpuid, cpuid);
        assert!(!is_enabled());
        if let Some(int_enabled) = CPU_STATE[cpuid].pop_disabled() {
            if int_enabled {
                enable();
            }
        }
    }
}

impl Guard {
    /// Leaks the guard without restoring interrupt state.
    ///
    /// Used when the caller hands off the "interrupts are disabled"
    /// obligation to something else, such as a held lock.
    pub fn forget(self) {
        mem::forget(self);
    }
}

pub fn with_push_disabled<T, F>(f: F) -> T
where
    F: FnOnce() -> T,
{
    let _guard = push_disabled();
    f()
}

struct CpuState {
    push_depth: AtomicUsize,
    enabled: AtomicBool,
}

impl CpuState {
    const fn new() -> Self {
        Self {
            push_depth: AtomicUsize::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    fn push_disabled(&self, int_enabled: bool) {
        let depth = self.push_depth.fetch_add(1, Ordering::Acquire);
        if depth == 0 {
            self.enabled.store(int_enabled, Ordering::Relaxed);
        }
    }

    fn pop_disabled(&self) -> Option<bool> {
        assert!(self.push_depth.load(Ordering::Relaxed) > 0);
        let int_enabled = self.enabled.load(Ordering::Relaxed);
        if self.push_depth.fetch_sub(1, Ordering::Release) == 1 {
            return Some(int_enabled);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_push_pop_restores_outer_state() {
        crate::cpu::set_id(0);
        enable();
        assert!(is_enabled());

        let outer = push_disabled();
        assert!(!is_enabled());
        let inner = push_disabled();
        assert!(!is_enabled());
        drop(inner);
        assert!(!is_enabled());
        drop(outer);
        assert!(is_enabled());
    }
}
