//! Per-thread signal state and dispatch.
//!
//! Delivering a signal to a running thread means rewriting its saved
//! trapframe so that, once resumed, it jumps into a handler instead of
//! back to where it was interrupted. The actual trapframe layout is
//! architecture-specific and lives behind [`SignalStackOps`]; this
//! module owns the part that doesn't change across architectures: which
//! signal to deliver next, whether it's blocked or ignored, and the
//! bookkeeping that lets a later restore detect a corrupted handoff.

use crate::{
    driver::{AddressSpace, Scheduler, SignalStackOps},
    error::KernelError,
    param::SIGNALS_CNT,
};

/// The kill signal. Its default action (terminate) is the only default
/// action this core implements; every other signal with no handler
/// installed is [`Dispatch::NoDefaultAction`]. Can never be blocked,
/// ignored, or caught.
pub const SIGKILL: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Default,
    Ignore,
    Handler(usize),
}

/// Which kind of stack a delivered signal's handler is running on, as
/// decided by the [`SignalStackOps`] implementation that set it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    /// The handler runs on the interrupted thread's own trapframe: the
    /// thread being signalled is the one currently running.
    JustTf,
    /// The thread being signalled was stopped inside the kernel; a
    /// dedicated stack was built on top of its saved context rather
    /// than risk corrupting it.
    NewStack,
}

/// Why a thread is not runnable, and whether a signal may wake it.
pub struct Blocker {
    /// Caller-defined tag for the wait reason (I/O, sleep, a lock…);
    /// opaque to this module.
    pub reason: u32,
    pub should_unblock_for_signal: bool,
}

struct ActiveSignal {
    signo: u32,
    magic: StackKind,
    old_sp: usize,
    checksum: usize,
}

/// Outcome of attempting to dispatch a pending signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing deliverable: `pending & !blocked` was empty.
    None,
    /// `signo` reached its default action of terminate. Only raised
    /// for [`SIGKILL`]; the caller must tear down the process.
    Fatal(u32),
    /// `signo` has no handler and no default action.
    NoDefaultAction(u32),
    /// `signo`'s handler has been entered: the stack is already
    /// rewritten, the caller just resumes the thread.
    Entered(u32),
}

fn signal_bit(signo: u32) -> Result<u32, KernelError> {
    if signo == 0 || signo as usize > SIGNALS_CNT {
        return Err(KernelError::InvalidSignal(signo));
    }
    Ok(1 << (signo - 1))
}

/// Signal state belonging to a single thread.
pub struct SignalState {
    pending: u32,
    /// Signals currently blocked from delivery (the complement of the
    /// original "allowed" mask: `deliverable = pending & !blocked`).
    blocked: u32,
    handlers: [Disposition; SIGNALS_CNT],
    active: Option<ActiveSignal>,
    blocker: Option<Blocker>,
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: 0,
            blocked: 0,
            handlers: [Disposition::Default; SIGNALS_CNT],
            active: None,
            blocker: None,
        }
    }

    /// Marks `signo` as pending. A no-op for signals already pending.
    pub fn raise(&mut self, signo: u32) -> Result<(), KernelError> {
        self.pending |= signal_bit(signo)?;
        Ok(())
    }

    #[must_use]
    pub fn is_pending(&self, signo: u32) -> bool {
        signal_bit(signo).is_ok_and(|bit| self.pending & bit != 0)
    }

    /// Installs `disposition` for `signo`. [`SIGKILL`] can never be
    /// caught or ignored.
    pub fn set_disposition(&mut self, signo: u32, disposition: Disposition) -> Result<(), KernelError> {
        if signo == SIGKILL && disposition != Disposition::Default {
            return Err(KernelError::InvalidSignal(signo));
        }
        signal_bit(signo)?;
        self.handlers[(signo - 1) as usize] = disposition;
        Ok(())
    }

    #[must_use]
    pub fn disposition(&self, signo: u32) -> Disposition {
        signal_bit(signo).map_or(Disposition::Default, |_| self.handlers[(signo - 1) as usize])
    }

    /// Replaces the blocked-signal mask, returning the previous one.
    /// The bit for [`SIGKILL`] is always cleared.
    pub fn set_blocked_mask(&mut self, mask: u32) -> u32 {
        let old = self.blocked;
        self.blocked = mask & !signal_bit(SIGKILL).unwrap();
        old
    }

    #[must_use]
    pub fn blocked_mask(&self) -> u32 {
        self.blocked
    }

    /// Whether a signal is currently being handled on this thread. Only
    /// one delivery is ever in flight at a time.
    #[must_use]
    pub fn is_handling_signal(&self) -> bool {
        self.active.is_some()
    }

    /// Records why this thread is not runnable, and whether a signal
    /// may wake it early.
    pub fn set_blocker(&mut self, blocker: Blocker) {
        self.blocker = Some(blocker);
    }

    /// Clears the thread's blocker once it becomes runnable again.
    pub fn clear_blocker(&mut self) -> Option<Blocker> {
        self.blocker.take()
    }

    #[must_use]
    pub fn blocker(&self) -> Option<&Blocker> {
        self.blocker.as_ref()
    }

    /// Picks the lowest-numbered deliverable pending signal and acts on
    /// its disposition: ignored signals are dropped (and the search
    /// continues), signals with no handler installed resolve against
    /// the default-action table, and signals with a handler get their
    /// stack rewritten via `stack_ops`.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_pending(
        &mut self,
        stack_ops: &dyn SignalStackOps,
        address_space: &dyn AddressSpace,
        previous_address_space: &dyn AddressSpace,
        old_sp: usize,
        trapframe_addr: usize,
    ) -> Result<Dispatch, KernelError> {
        if self.active.is_some() {
            return Ok(Dispatch::None);
        }
        loop {
            let deliverable = self.pending & !self.blocked;
            if deliverable == 0 {
                return Ok(Dispatch::None);
            }
            let signo = deliverable.trailing_zeros() + 1;
            self.pending &= !signal_bit(signo)?;

            match self.handlers[(signo - 1) as usize] {
                Disposition::Ignore => continue,
                Disposition::Default if signo == SIGKILL => return Ok(Dispatch::Fatal(signo)),
                Disposition::Default => return Ok(Dispatch::NoDefaultAction(signo)),
                Disposition::Handler(_) => {
                    let magic = self.setup_stack_to_handle_signal(
                        stack_ops,
                        address_space,
                        previous_address_space,
                        signo,
                        old_sp,
                        trapframe_addr,
                    )?;
                    let checksum = old_sp ^ (signo as usize) ^ (magic as usize);
                    self.active = Some(ActiveSignal {
                        signo,
                        magic,
                        old_sp,
                        checksum,
                    });
                    return Ok(Dispatch::Entered(signo));
                }
            }
        }
    }

    /// Rewrites the thread's stack to enter `signo`'s handler and
    /// records enough to verify the handoff on restore.
    ///
    /// Runs with interrupts disabled and the target process's address
    /// space loaded, since it writes into that process's trapframe page
    /// rather than the caller's own; `previous_address_space` is
    /// reloaded before returning regardless of outcome.
    #[allow(clippy::too_many_arguments)]
    fn setup_stack_to_handle_signal(
        &self,
        stack_ops: &dyn SignalStackOps,
        address_space: &dyn AddressSpace,
        previous_address_space: &dyn AddressSpace,
        signo: u32,
        old_sp: usize,
        trapframe_addr: usize,
    ) -> Result<StackKind, KernelError> {
        crate::interrupt::with_push_disabled(|| {
            address_space.load();
            let result = address_space
                .prepare_for_write(trapframe_addr)
                .and_then(|()| stack_ops.prepare_stack(signo, old_sp));
            previous_address_space.load();
            result
        })
    }

    /// Undoes [`setup_stack_to_handle_signal`](Self::setup_stack_to_handle_signal)
    /// once a handler returns, restoring the thread's pre-signal stack
    /// pointer.
    ///
    /// If the thread has a [`Blocker`] recorded (it was blocked when
    /// the signal interrupted it) or the handler ran on a
    /// [`StackKind::NewStack`], this never returns: it dequeues the
    /// thread and reschedules through `scheduler` instead, matching
    /// the kernel context the handler ran in. Otherwise it returns the
    /// restored stack pointer so the caller can resume the interrupted
    /// syscall normally.
    pub fn restore_thread_after_handling_signal(
        &mut self,
        thread: usize,
        stack_ops: &dyn SignalStackOps,
        scheduler: &dyn Scheduler,
    ) -> Result<usize, KernelError> {
        let active = self
            .active
            .take()
            .ok_or(KernelError::Fatal("signal restore with no signal in flight"))?;
        let restored_sp = stack_ops.restore_stack()?;

        match active.magic {
            // No checksum exists for this path: the handler ran on the
            // thread's own trapframe, nothing was pushed to verify.
            // Divergence is suspect but not fatal.
            StackKind::JustTf => {
                if restored_sp != active.old_sp {
                    crate::println!(
                        "signal: handler stack pointer diverged from the saved trapframe"
                    );
                }
            }
            // A fresh kernel frame was built with a checksum word; a
            // mismatch means the stack was corrupted while the thread
            // was stopped, which is a security-critical invariant.
            StackKind::NewStack => {
                let checksum = restored_sp ^ (active.signo as usize) ^ (active.magic as usize);
                if checksum != active.checksum {
                    return Err(KernelError::Fatal("signal stack checksum mismatch"));
                }
            }
        }

        if self.blocker.is_some() {
            scheduler.dequeue(thread);
            scheduler.resched_dont_save_context();
        }
        if active.magic == StackKind::NewStack {
            scheduler.resched_dont_save_context();
        }
        Ok(active.old_sp)
    }

    /// Dispatches a pending signal to a thread that is currently
    /// blocked (not runnable). Only [`Dispatch::Entered`] requires the
    /// thread to run again, and only if its blocker allows signals to
    /// wake it; every other outcome leaves it blocked.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_to_blocked_thread(
        &mut self,
        thread: usize,
        scheduler: &dyn Scheduler,
        stack_ops: &dyn SignalStackOps,
        address_space: &dyn AddressSpace,
        previous_address_space: &dyn AddressSpace,
        old_sp: usize,
        trapframe_addr: usize,
    ) -> Result<Dispatch, KernelError> {
        let dispatch = self.dispatch_pending(
            stack_ops,
            address_space,
            previous_address_space,
            old_sp,
            trapframe_addr,
        )?;
        if matches!(dispatch, Dispatch::Entered(_))
            && self.blocker.as_ref().is_some_and(|b| b.should_unblock_for_signal)
        {
            scheduler.enqueue(thread);
        }
        Ok(dispatch)
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;

    struct MockStack {
        kind: StackKind,
        restored_sp: Cell<usize>,
    }

    impl SignalStackOps for MockStack {
        fn prepare_stack(&self, _signo: u32, _old_sp: usize) -> Result<StackKind, KernelError> {
            Ok(self.kind)
        }

        fn restore_stack(&self) -> Result<usize, KernelError> {
            Ok(self.restored_sp.get())
        }
    }

    /// Counts `load()` calls so tests can assert the target address
    /// space is entered and the previous one is restored, without
    /// modelling a real page table.
    #[derive(Default)]
    struct MockAddressSpace {
        loads: Cell<usize>,
        fail_prepare: Cell<bool>,
    }

    impl AddressSpace for MockAddressSpace {
        fn load(&self) {
            self.loads.set(self.loads.get() + 1);
        }

        fn prepare_for_write(&self, _addr: usize) -> Result<(), KernelError> {
            if self.fail_prepare.get() {
                return Err(KernelError::Fatal("prepare_for_write failed"));
            }
            Ok(())
        }
    }

    const TRAPFRAME_ADDR: usize = 0x5000;

    struct NullScheduler;

    impl Scheduler for NullScheduler {
        fn enqueue(&self, _thread: usize) {}
        fn dequeue(&self, _thread: usize) {}
        fn resched_dont_save_context(&self) -> ! {
            panic!("resched_dont_save_context called unexpectedly");
        }
    }

    #[test]
    fn raise_then_dispatch_enters_handler() {
        let mut state = SignalState::new();
        state.set_disposition(5, Disposition::Handler(0x4000)).unwrap();
        state.raise(5).unwrap();
        let stack = MockStack {
            kind: StackKind::JustTf,
            restored_sp: Cell::new(0x7000),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        let dispatch = state
            .dispatch_pending(&stack, &target, &previous, 0x7000, TRAPFRAME_ADDR)
            .unwrap();
        assert_eq!(dispatch, Dispatch::Entered(5));
        assert!(state.is_handling_signal());
    }

    #[test]
    fn setup_loads_target_address_space_and_restores_previous() {
        let mut state = SignalState::new();
        state.set_disposition(5, Disposition::Handler(0x4000)).unwrap();
        state.raise(5).unwrap();
        let stack = MockStack {
            kind: StackKind::JustTf,
            restored_sp: Cell::new(0x7000),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        state
            .dispatch_pending(&stack, &target, &previous, 0x7000, TRAPFRAME_ADDR)
            .unwrap();
        assert_eq!(target.loads.get(), 1);
        assert_eq!(previous.loads.get(), 1);
    }

    #[test]
    fn setup_propagates_prepare_for_write_failure() {
        let mut state = SignalState::new();
        state.set_disposition(5, Disposition::Handler(0x4000)).unwrap();
        state.raise(5).unwrap();
        let stack = MockStack {
            kind: StackKind::JustTf,
            restored_sp: Cell::new(0x7000),
        };
        let target = MockAddressSpace::default();
        target.fail_prepare.set(true);
        let previous = MockAddressSpace::default();
        let err = state.dispatch_pending(&stack, &target, &previous, 0x7000, TRAPFRAME_ADDR);
        assert!(err.is_err());
        // The previous address space must still be reloaded even on failure.
        assert_eq!(previous.loads.get(), 1);
        assert!(!state.is_handling_signal());
    }

    #[test]
    fn sigkill_default_disposition_is_fatal() {
        let mut state = SignalState::new();
        state.raise(SIGKILL).unwrap();
        let stack = MockStack {
            kind: StackKind::JustTf,
            restored_sp: Cell::new(0),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        assert_eq!(
            state
                .dispatch_pending(&stack, &target, &previous, 0, TRAPFRAME_ADDR)
                .unwrap(),
            Dispatch::Fatal(SIGKILL)
        );
    }

    #[test]
    fn other_default_disposition_has_no_effect() {
        let mut state = SignalState::new();
        state.raise(5).unwrap();
        let stack = MockStack {
            kind: StackKind::JustTf,
            restored_sp: Cell::new(0),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        assert_eq!(
            state
                .dispatch_pending(&stack, &target, &previous, 0, TRAPFRAME_ADDR)
                .unwrap(),
            Dispatch::NoDefaultAction(5)
        );
    }

    #[test]
    fn ignored_signal_is_dropped_silently() {
        let mut state = SignalState::new();
        state.set_disposition(5, Disposition::Ignore).unwrap();
        state.raise(5).unwrap();
        let stack = MockStack {
            kind: StackKind::JustTf,
            restored_sp: Cell::new(0),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        assert_eq!(
            state
                .dispatch_pending(&stack, &target, &previous, 0, TRAPFRAME_ADDR)
                .unwrap(),
            Dispatch::None
        );
        assert!(!state.is_pending(5));
    }

    #[test]
    fn blocked_signal_is_not_dispatched() {
        let mut state = SignalState::new();
        state.set_disposition(5, Disposition::Handler(0x4000)).unwrap();
        state.set_blocked_mask(signal_bit(5).unwrap());
        state.raise(5).unwrap();
        let stack = MockStack {
            kind: StackKind::JustTf,
            restored_sp: Cell::new(0),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        assert_eq!(
            state
                .dispatch_pending(&stack, &target, &previous, 0, TRAPFRAME_ADDR)
                .unwrap(),
            Dispatch::None
        );
        assert!(state.is_pending(5));
    }

    #[test]
    fn sigkill_cannot_be_ignored_or_blocked() {
        let mut state = SignalState::new();
        assert!(state.set_disposition(SIGKILL, Disposition::Ignore).is_err());
        let old = state.set_blocked_mask(signal_bit(SIGKILL).unwrap());
        assert_eq!(old, 0);
        assert_eq!(state.blocked_mask() & signal_bit(SIGKILL).unwrap(), 0);
    }

    #[test]
    fn restore_after_new_stack_checks_checksum() {
        let mut state = SignalState::new();
        state.set_disposition(3, Disposition::Handler(0x4000)).unwrap();
        state.raise(3).unwrap();
        let stack = MockStack {
            kind: StackKind::NewStack,
            restored_sp: Cell::new(0x9000),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        state
            .dispatch_pending(&stack, &target, &previous, 0x9000, TRAPFRAME_ADDR)
            .unwrap();

        // Tamper with what the driver claims to hand back on restore.
        stack.restored_sp.set(0x9004);
        let err = state.restore_thread_after_handling_signal(0, &stack, &NullScheduler);
        assert!(err.is_err());
    }

    #[test]
    fn restore_after_just_tf_tolerates_sp_divergence() {
        let mut state = SignalState::new();
        state.set_disposition(3, Disposition::Handler(0x4000)).unwrap();
        state.raise(3).unwrap();
        let stack = MockStack {
            kind: StackKind::JustTf,
            restored_sp: Cell::new(0x7000),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        state
            .dispatch_pending(&stack, &target, &previous, 0x7000, TRAPFRAME_ADDR)
            .unwrap();

        stack.restored_sp.set(0x7004);
        let restored = state
            .restore_thread_after_handling_signal(0, &stack, &NullScheduler)
            .unwrap();
        assert_eq!(restored, 0x7000);
    }

    #[test]
    fn restore_after_just_tf_with_no_blocker_returns_old_sp() {
        let mut state = SignalState::new();
        state.set_disposition(3, Disposition::Handler(0x4000)).unwrap();
        state.raise(3).unwrap();
        let stack = MockStack {
            kind: StackKind::JustTf,
            restored_sp: Cell::new(0x7000),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        state
            .dispatch_pending(&stack, &target, &previous, 0x7000, TRAPFRAME_ADDR)
            .unwrap();
        let restored = state
            .restore_thread_after_handling_signal(0, &stack, &NullScheduler)
            .unwrap();
        assert_eq!(restored, 0x7000);
    }

    #[test]
    fn only_one_signal_handled_at_a_time() {
        let mut state = SignalState::new();
        state.set_disposition(3, Disposition::Handler(0x4000)).unwrap();
        state.set_disposition(4, Disposition::Handler(0x4000)).unwrap();
        state.raise(3).unwrap();
        state.raise(4).unwrap();
        let stack = MockStack {
            kind: StackKind::JustTf,
            restored_sp: Cell::new(0x7000),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        assert_eq!(
            state
                .dispatch_pending(&stack, &target, &previous, 0x7000, TRAPFRAME_ADDR)
                .unwrap(),
            Dispatch::Entered(3)
        );
        assert_eq!(
            state
                .dispatch_pending(&stack, &target, &previous, 0x7000, TRAPFRAME_ADDR)
                .unwrap(),
            Dispatch::None
        );
        assert!(state.is_pending(4));
    }

    #[test]
    fn blocked_thread_with_handler_is_reenqueued() {
        struct CountingScheduler {
            enqueued: Cell<usize>,
        }
        impl Scheduler for CountingScheduler {
            fn enqueue(&self, _thread: usize) {
                self.enqueued.set(self.enqueued.get() + 1);
            }
            fn dequeue(&self, _thread: usize) {}
            fn resched_dont_save_context(&self) -> ! {
                panic!("not expected in this test");
            }
        }

        let mut state = SignalState::new();
        state.set_disposition(6, Disposition::Handler(0x4000)).unwrap();
        state.set_blocker(Blocker {
            reason: 0,
            should_unblock_for_signal: true,
        });
        state.raise(6).unwrap();
        let stack = MockStack {
            kind: StackKind::NewStack,
            restored_sp: Cell::new(0x9000),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        let scheduler = CountingScheduler {
            enqueued: Cell::new(0),
        };
        let dispatch = state
            .dispatch_to_blocked_thread(1, &scheduler, &stack, &target, &previous, 0x7000, TRAPFRAME_ADDR)
            .unwrap();
        assert_eq!(dispatch, Dispatch::Entered(6));
        assert_eq!(scheduler.enqueued.get(), 1);
    }

    #[test]
    fn blocked_thread_without_unblock_flag_stays_blocked() {
        struct CountingScheduler {
            enqueued: Cell<usize>,
        }
        impl Scheduler for CountingScheduler {
            fn enqueue(&self, _thread: usize) {
                self.enqueued.set(self.enqueued.get() + 1);
            }
            fn dequeue(&self, _thread: usize) {}
            fn resched_dont_save_context(&self) -> ! {
                panic!("not expected in this test");
            }
        }

        let mut state = SignalState::new();
        state.set_disposition(6, Disposition::Handler(0x4000)).unwrap();
        state.set_blocker(Blocker {
            reason: 0,
            should_unblock_for_signal: false,
        });
        state.raise(6).unwrap();
        let stack = MockStack {
            kind: StackKind::NewStack,
            restored_sp: Cell::new(0x9000),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        let scheduler = CountingScheduler {
            enqueued: Cell::new(0),
        };
        state
            .dispatch_to_blocked_thread(1, &scheduler, &stack, &target, &previous, 0x7000, TRAPFRAME_ADDR)
            .unwrap();
        assert_eq!(scheduler.enqueued.get(), 0);
    }

    #[test]
    fn restore_with_blocker_reschedules_without_returning() {
        let mut state = SignalState::new();
        state.set_disposition(3, Disposition::Handler(0x4000)).unwrap();
        state.set_blocker(Blocker {
            reason: 0,
            should_unblock_for_signal: true,
        });
        state.raise(3).unwrap();
        let stack = MockStack {
            kind: StackKind::JustTf,
            restored_sp: Cell::new(0x7000),
        };
        let target = MockAddressSpace::default();
        let previous = MockAddressSpace::default();
        state
            .dispatch_pending(&stack, &target, &previous, 0x7000, TRAPFRAME_ADDR)
            .unwrap();

        struct PanicOnResched;
        impl Scheduler for PanicOnResched {
            fn enqueue(&self, _thread: usize) {}
            fn dequeue(&self, _thread: usize) {}
            fn resched_dont_save_context(&self) -> ! {
                panic!("reached resched_dont_save_context");
            }
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            state.restore_thread_after_handling_signal(0, &stack, &PanicOnResched)
        }));
        assert!(result.is_err());
    }
}
