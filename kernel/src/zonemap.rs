//! Per-process virtual memory zone map.
//!
//! A process's address space is a set of non-overlapping zones, each
//! covering `[start, start + len)` and carrying a [`ZoneType`] and
//! permission bits, optionally backed by a file. This module only
//! tracks the zones themselves; the page tables backing them are the
//! caller's [`AddressSpace`][crate::driver::AddressSpace]. Callers
//! (the process manager) are responsible for serializing access to a
//! single process's map — it does no locking of its own.

use alloc::{boxed::Box, vec::Vec};

use bitflags::bitflags;
use strum::{Display, EnumIter};

use crate::{
    dcache::Dentry,
    error::KernelError,
    memory::{page_roundup, page_rounddown},
    param::KERNEL_BASE,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ZoneFlags: u32 {
        const USER = 1 << 0;
        const READABLE = 1 << 1;
        const WRITABLE = 1 << 2;
        const EXECUTABLE = 1 << 3;
        /// Private, copy-on-write mapping shared with a parent zone map
        /// until either side writes to it.
        const COPY_ON_WRITE = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum ZoneType {
    Stack,
    Heap,
    Code,
    Data,
    /// A file-backed or anonymous mapping made on the process's behalf,
    /// not part of its fixed layout.
    Mapped,
    Shared,
}

/// A file backing a zone, and the byte offset into it the zone starts
/// reading from.
pub struct ZoneFile {
    pub dentry: Dentry,
    pub offset: usize,
}

/// A single mapped region of a process's address space.
pub struct ProcZone {
    start: usize,
    len: usize,
    zone_type: ZoneType,
    flags: ZoneFlags,
    file: Option<ZoneFile>,
}

impl ProcZone {
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.len
    }

    #[must_use]
    pub const fn zone_type(&self) -> ZoneType {
        self.zone_type
    }

    #[must_use]
    pub const fn flags(&self) -> ZoneFlags {
        self.flags
    }

    #[must_use]
    pub const fn file(&self) -> Option<&ZoneFile> {
        self.file.as_ref()
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    const fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.end() && self.start < end
    }
}

/// An opaque handle identifying a zone within a [`ZoneMap`].
///
/// Backed by the zone's address, which is stable for its lifetime in
/// the map since zones are heap-boxed rather than stored inline in the
/// map's vector.
#[derive(Clone, Copy)]
pub struct ZoneId(*const ProcZone);

/// The set of virtual memory zones belonging to one process.
///
/// Not sorted: a linear scan is cheap enough for the handful of zones
/// a process typically holds. An interval tree would be the obvious
/// upgrade for processes with many mappings.
pub struct ZoneMap {
    zones: Vec<Box<ProcZone>>,
}

impl Default for ZoneMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneMap {
    #[must_use]
    pub const fn new() -> Self {
        Self { zones: Vec::new() }
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &ProcZone> {
        self.zones.iter().map(Box::as_ref)
    }

    fn zone_ref(&self, id: ZoneId) -> &ProcZone {
        self.zones
            .iter()
            .find(|z| core::ptr::eq(z.as_ref(), id.0))
            .expect("stale ZoneId")
    }

    /// Looks up the zone containing `addr`, if any.
    #[must_use]
    pub fn find_zone(&self, addr: usize) -> Option<ZoneId> {
        self.zones
            .iter()
            .find(|z| z.contains(addr))
            .map(|z| ZoneId(z.as_ref()))
    }

    #[must_use]
    pub fn zone(&self, id: ZoneId) -> &ProcZone {
        self.zone_ref(id)
    }

    fn has_overlap(&self, start: usize, end: usize) -> bool {
        self.zones.iter().any(|z| z.overlaps(start, end))
    }

    fn insert(
        &mut self,
        start: usize,
        len: usize,
        zone_type: ZoneType,
        flags: ZoneFlags,
        file: Option<ZoneFile>,
    ) -> ZoneId {
        let zone = Box::new(ProcZone {
            start,
            len,
            zone_type,
            flags,
            file,
        });
        let id = ZoneId(zone.as_ref());
        self.zones.push(zone);
        id
    }

    /// Page-aligns `start` down and extends `len` up to absorb the
    /// sub-page offset this removes, then adds a zone at the resulting
    /// range. Fails if the (aligned) range overlaps an existing zone or
    /// is empty.
    pub fn new_zone(
        &mut self,
        start: usize,
        len: usize,
        zone_type: ZoneType,
        flags: ZoneFlags,
        file: Option<ZoneFile>,
    ) -> Result<ZoneId, KernelError> {
        let (start, len) = align_range(start, len)?;
        let end = start.checked_add(len).ok_or(KernelError::InvalidArgument)?;
        if self.has_overlap(start, end) {
            return Err(KernelError::ZoneOverlap { start, end });
        }
        Ok(self.insert(start, len, zone_type, flags, file))
    }

    /// Like [`new_zone`](Self::new_zone), but trims the requested range
    /// to avoid overlapping existing zones instead of failing: the
    /// range's low edge is pushed past any zone it collides with if
    /// `start` falls inside or after that zone, otherwise its high
    /// edge is pulled back to meet it. Fails only if trimming leaves
    /// nothing.
    pub fn extend_zone(
        &mut self,
        start: usize,
        len: usize,
        zone_type: ZoneType,
        flags: ZoneFlags,
    ) -> Result<ZoneId, KernelError> {
        let (mut start, mut len) = align_range(start, len)?;

        for zone in &self.zones {
            if !zone.overlaps(start, start + len) {
                continue;
            }
            if start >= zone.start() {
                let old_end = start + len;
                start = zone.end();
                len = old_end.saturating_sub(start);
            } else {
                len = zone.start() - start;
            }
            if len == 0 {
                return Err(KernelError::InvalidArgument);
            }
        }

        self.new_zone(start, len, zone_type, flags, None)
    }

    /// Places a new zone of `len` bytes at the lowest address that
    /// fits: address `0` if free, otherwise the end of whichever
    /// existing zone yields the smallest valid start.
    pub fn new_random_zone(
        &mut self,
        len: usize,
        zone_type: ZoneType,
        flags: ZoneFlags,
    ) -> Result<ZoneId, KernelError> {
        let len = page_roundup(len);
        if len == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if !self.has_overlap(0, len) {
            return self.new_zone(0, len, zone_type, flags, None);
        }
        let mut best = None;
        for zone in &self.zones {
            let candidate = zone.end();
            if candidate.checked_add(len).is_some_and(|end| end <= KERNEL_BASE)
                && !self.has_overlap(candidate, candidate + len)
            {
                best = Some(best.map_or(candidate, |b: usize| b.min(candidate)));
            }
        }
        let start = best.ok_or(KernelError::ZoneOutOfSpace(len))?;
        self.new_zone(start, len, zone_type, flags, None)
    }

    /// Like [`new_random_zone`](Self::new_random_zone), but searches
    /// downward from [`KERNEL_BASE`], for placements (such as thread
    /// stacks) that grow toward lower addresses: tries
    /// `[KERNEL_BASE - len, KERNEL_BASE)` first, otherwise the highest
    /// `zone.start - len` that fits.
    pub fn new_random_zone_backward(
        &mut self,
        len: usize,
        zone_type: ZoneType,
        flags: ZoneFlags,
    ) -> Result<ZoneId, KernelError> {
        let len = page_roundup(len);
        if len == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let top = KERNEL_BASE.checked_sub(len).ok_or(KernelError::ZoneOutOfSpace(len))?;
        if !self.has_overlap(top, top + len) {
            return self.new_zone(top, len, zone_type, flags, None);
        }
        let mut best = None;
        for zone in &self.zones {
            if let Some(candidate) = zone.start().checked_sub(len)
                && !self.has_overlap(candidate, candidate + len)
            {
                best = Some(best.map_or(candidate, |b: usize| b.max(candidate)));
            }
        }
        let start = best.ok_or(KernelError::ZoneOutOfSpace(len))?;
        self.new_zone(start, len, zone_type, flags, None)
    }

    /// Removes `id`'s zone from the map by pointer identity, by
    /// swapping it with the last element and popping (unordered).
    pub fn delete_zone(&mut self, id: ZoneId) -> Result<(), KernelError> {
        let position = self
            .zones
            .iter()
            .position(|z| core::ptr::eq(z.as_ref(), id.0))
            .ok_or(KernelError::ZoneNotFound(id.0 as usize))?;
        self.zones.swap_remove(position);
        Ok(())
    }

    #[must_use]
    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }
}

fn align_range(start: usize, len: usize) -> Result<(usize, usize), KernelError> {
    if len == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let aligned_start = page_rounddown(start);
    let covered = (start - aligned_start)
        .checked_add(len)
        .ok_or(KernelError::InvalidArgument)?;
    let aligned_len = page_roundup(covered);
    if aligned_len == 0 {
        return Err(KernelError::InvalidArgument);
    }
    Ok((aligned_start, aligned_len))
}
