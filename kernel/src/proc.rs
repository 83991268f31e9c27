//! Minimal process/thread identities.
//!
//! Scheduling, context switching, and process lifecycle (fork, exec,
//! wait) are run-queue and ELF-loading concerns that live outside this
//! core. What's left here is just enough structure to say which
//! [`ZoneMap`] and which thread's [`SignalState`] a given identifier
//! names, since [`crate::zonemap`] and [`crate::signal`] are otherwise
//! unaware of processes at all.

use alloc::vec::Vec;

use crate::{error::KernelError, signal::SignalState, zonemap::ZoneMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

/// One schedulable thread of execution within a [`Process`].
pub struct Thread {
    id: ThreadId,
    signals: SignalState,
}

impl Thread {
    #[must_use]
    pub const fn new(id: ThreadId) -> Self {
        Self {
            id,
            signals: SignalState::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    pub fn signals(&mut self) -> &mut SignalState {
        &mut self.signals
    }
}

/// A process: one address space shared by one or more [`Thread`]s.
pub struct Process {
    id: ProcessId,
    zones: ZoneMap,
    threads: Vec<Thread>,
}

impl Process {
    #[must_use]
    pub fn new(id: ProcessId) -> Self {
        Self {
            id,
            zones: ZoneMap::new(),
            threads: Vec::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ProcessId {
        self.id
    }

    #[must_use]
    pub const fn zones(&self) -> &ZoneMap {
        &self.zones
    }

    pub fn zones_mut(&mut self) -> &mut ZoneMap {
        &mut self.zones
    }

    pub fn spawn_thread(&mut self, id: ThreadId) -> Result<(), KernelError> {
        if self.threads.iter().any(|t| t.id == id) {
            return Err(KernelError::InvalidArgument);
        }
        self.threads.push(Thread::new(id));
        Ok(())
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.id == id)
    }

    pub fn remove_thread(&mut self, id: ThreadId) -> Option<Thread> {
        let position = self.threads.iter().position(|t| t.id == id)?;
        Some(self.threads.remove(position))
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}
