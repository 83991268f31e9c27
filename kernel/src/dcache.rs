//! Dentry / inode cache.
//!
//! Dentries live in fixed-size blocks appended to a growable list, one
//! lock per block guarding slot placement and one finer lock per slot
//! guarding its contents. Lookup and placement always take the block
//! lock before the slot lock inside it, never the other way around.
//!
//! A dentry's identity is the pair `(device, inode)`; inode number `0`
//! marks a slot as free. Slots are reused once their reference count
//! (`d_count`) drops to zero, last-freed-first within a block.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bitflags::bitflags;
use ov6_fs_types::InodeNo;
use ov6_types::os_str::OsString;

use crate::{
    driver::{FilesystemDriver, FsData},
    error::KernelError,
    param::DENTRIES_PER_BLOCK,
    sync::SpinLock,
};

/// Identifies the device (and therefore the [`FilesystemDriver`]) a
/// dentry's inode number is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceNo(u32);

impl DeviceNo {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DentryFlags: u32 {
        /// The cached inode has been modified and not yet written back.
        const DIRTY = 1 << 0;
        /// The inode should be freed on disk once the last reference drops.
        const INODE_TO_BE_DELETED = 1 << 1;
        /// This dentry is synthesized by its driver and has no on-disk
        /// inode of its own; `put` tears it down instead of caching it.
        const CUSTOM = 1 << 2;
        /// A filesystem is mounted on this dentry; `force_put` must not
        /// tear it down.
        const MOUNTPOINT = 1 << 3;
    }
}

struct SlotData {
    dev: DeviceNo,
    ino: InodeNo,
    d_count: usize,
    flags: DentryFlags,
    inode: Option<Box<[u8]>>,
    filename: Option<OsString>,
    parent: Option<Dentry>,
    fsdata: Option<FsData>,
}

impl SlotData {
    const fn empty() -> Self {
        Self {
            dev: DeviceNo::new(0),
            ino: InodeNo::new(0),
            d_count: 0,
            flags: DentryFlags::empty(),
            inode: None,
            filename: None,
            parent: None,
            fsdata: None,
        }
    }
}

struct DentrySlot {
    data: SpinLock<SlotData>,
}

impl DentrySlot {
    const fn new() -> Self {
        Self {
            data: SpinLock::new(SlotData::empty()),
        }
    }
}

struct Block {
    /// Serializes lookup and placement scans within this block; taken
    /// before any of `slots`' own locks.
    scan_lock: SpinLock<()>,
    slots: [DentrySlot; DENTRIES_PER_BLOCK],
}

impl Block {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            scan_lock: SpinLock::new(()),
            slots: core::array::from_fn(|_| DentrySlot::new()),
        })
    }
}

/// A reference-counted handle to a cached dentry.
///
/// Unlike most Rust handles, `Dentry` does not drop its reference
/// automatically: the cache's eviction and writeback behavior depends
/// on exactly when a reference is released, so callers release it
/// explicitly with [`DCache::put`] or [`DCache::force_put`].
pub struct Dentry {
    block: Arc<Block>,
    index: usize,
}

impl core::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dentry").field("index", &self.index).finish()
    }
}

impl Dentry {
    fn slot(&self) -> &DentrySlot {
        &self.block.slots[self.index]
    }

    #[must_use]
    pub fn device(&self) -> DeviceNo {
        self.slot().data.lock().dev
    }

    #[must_use]
    pub fn inode_no(&self) -> InodeNo {
        self.slot().data.lock().ino
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.slot().data.lock().d_count
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.slot().data.lock().flags.contains(DentryFlags::DIRTY)
    }

    #[must_use]
    pub fn filename(&self) -> Option<OsString> {
        self.slot().data.lock().filename.clone()
    }

    fn handle(&self) -> Self {
        Self {
            block: Arc::clone(&self.block),
            index: self.index,
        }
    }
}

pub struct DCache {
    blocks: SpinLock<Vec<Arc<Block>>>,
    /// Number of dentries with `d_count > 0`.
    active_count: AtomicUsize,
    /// Bytes currently held in cached (but not necessarily referenced)
    /// inode buffers.
    cached_inode_bytes: AtomicUsize,
    can_cache_inodes: AtomicBool,
}

impl Default for DCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DCache {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            blocks: SpinLock::new(Vec::new()),
            active_count: AtomicUsize::new(0),
            cached_inode_bytes: AtomicUsize::new(0),
            can_cache_inodes: AtomicBool::new(true),
        }
    }

    /// Number of currently-referenced dentries.
    #[must_use]
    pub fn stat_cached_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    fn snapshot_blocks(&self) -> Vec<Arc<Block>> {
        self.blocks.lock().clone()
    }

    fn grow(&self) {
        self.blocks.lock().push(Block::new());
    }

    fn find_existing(&self, dev: DeviceNo, ino: InodeNo) -> Option<Dentry> {
        for block in self.snapshot_blocks() {
            let _scan = block.scan_lock.lock();
            for (index, slot) in block.slots.iter().enumerate() {
                let mut data = slot.data.lock();
                if data.dev == dev && data.ino == ino {
                    let was_unreferenced = data.d_count == 0;
                    data.d_count += 1;
                    drop(data);
                    if was_unreferenced {
                        self.active_count.fetch_add(1, Ordering::Relaxed);
                    }
                    return Some(Dentry {
                        block: Arc::clone(&block),
                        index,
                    });
                }
            }
        }
        None
    }

    /// Finds a slot to place a new dentry in: a fully-free slot if one
    /// exists, otherwise the first unreferenced (but still cached) slot
    /// found, growing the cache only if neither exists.
    fn find_slot_for_placement(&self) -> Dentry {
        loop {
            let mut fallback = None;
            for block in self.snapshot_blocks() {
                let _scan = block.scan_lock.lock();
                for (index, slot) in block.slots.iter().enumerate() {
                    let data = slot.data.lock();
                    if data.ino.is_free() {
                        drop(data);
                        return Dentry {
                            block: Arc::clone(&block),
                            index,
                        };
                    }
                    if data.d_count == 0 && fallback.is_none() {
                        drop(data);
                        fallback = Some(Dentry {
                            block: Arc::clone(&block),
                            index,
                        });
                    }
                }
            }
            if let Some(d) = fallback {
                return d;
            }
            self.grow();
        }
    }

    /// Claims a slot for `(dev, ino)`, evicting whatever it previously
    /// cached, then optionally reads the inode through `driver`.
    ///
    /// If the read fails, the allocation is fully undone: the slot
    /// is returned to the free state rather than left half-populated.
    fn allocate_new(
        &self,
        driver: &dyn FilesystemDriver,
        dev: DeviceNo,
        ino: InodeNo,
        read_inode: bool,
    ) -> Result<Dentry, KernelError> {
        if ino.is_free() {
            return Err(KernelError::InvalidArgument);
        }

        let handle = self.find_slot_for_placement();
        {
            let mut data = handle.slot().data.lock();
            if !data.ino.is_free() {
                if let Some(old) = data.inode.take() {
                    self.cached_inode_bytes
                        .fetch_sub(old.len(), Ordering::Relaxed);
                }
                data.filename = None;
                data.parent = None;
                data.fsdata = None;
                data.flags = DentryFlags::empty();
            }
            data.dev = dev;
            data.ino = ino;
            data.d_count = 1;
        }
        self.active_count.fetch_add(1, Ordering::Relaxed);

        if read_inode {
            match driver.read_inode(ino) {
                Ok(buf) => {
                    let fsdata = driver.get_fsdata(ino);
                    let mut data = handle.slot().data.lock();
                    self.cached_inode_bytes
                        .fetch_add(buf.len(), Ordering::Relaxed);
                    data.inode = Some(buf);
                    data.fsdata = Some(fsdata);
                }
                Err(err) => {
                    let mut data = handle.slot().data.lock();
                    data.ino = InodeNo::new(0);
                    data.d_count = 0;
                    drop(data);
                    self.active_count.fetch_sub(1, Ordering::Relaxed);
                    return Err(err);
                }
            }
        }

        Ok(handle)
    }

    /// Returns the cached dentry for `(dev, ino)`, reading its inode
    /// through `driver` if this is the first reference to it.
    pub fn get(
        &self,
        driver: &dyn FilesystemDriver,
        dev: DeviceNo,
        ino: InodeNo,
    ) -> Result<Dentry, KernelError> {
        if ino.is_free() {
            return Err(KernelError::InvalidArgument);
        }
        if let Some(d) = self.find_existing(dev, ino) {
            return Ok(d);
        }
        self.allocate_new(driver, dev, ino, true)
    }

    /// Like [`get`](Self::get), but never reads the inode from disk.
    /// Returns whether the dentry was already in the cache.
    pub fn get_no_inode(
        &self,
        driver: &dyn FilesystemDriver,
        dev: DeviceNo,
        ino: InodeNo,
    ) -> Result<(Dentry, bool), KernelError> {
        if ino.is_free() {
            return Err(KernelError::InvalidArgument);
        }
        if let Some(d) = self.find_existing(dev, ino) {
            return Ok((d, true));
        }
        let d = self.allocate_new(driver, dev, ino, false)?;
        Ok((d, false))
    }

    /// Adds a reference to an already-held dentry.
    pub fn duplicate(&self, d: &Dentry) -> Dentry {
        let mut data = d.slot().data.lock();
        let was_unreferenced = data.d_count == 0;
        data.d_count += 1;
        drop(data);
        if was_unreferenced {
            self.active_count.fetch_add(1, Ordering::Relaxed);
        }
        d.handle()
    }

    /// Returns a new reference to `d`'s parent, if it has one.
    pub fn get_parent(&self, d: &Dentry) -> Option<Dentry> {
        let parent = d.slot().data.lock().parent.as_ref().map(Dentry::handle);
        parent.map(|p| self.duplicate(&p))
    }

    pub fn set_parent(&self, d: &Dentry, parent: Dentry) {
        d.slot().data.lock().parent = Some(parent);
    }

    pub fn set_filename(&self, d: &Dentry, name: OsString) {
        d.slot().data.lock().filename = Some(name);
    }

    /// Attaches an inode buffer and driver-private data to `d`,
    /// replacing whatever it held before.
    pub fn set_inode(&self, d: &Dentry, inode: Box<[u8]>, fsdata: FsData) {
        let mut data = d.slot().data.lock();
        let old_len = data.inode.as_ref().map_or(0, |b| b.len());
        self.cached_inode_bytes
            .fetch_sub(old_len, Ordering::Relaxed);
        self.cached_inode_bytes
            .fetch_add(inode.len(), Ordering::Relaxed);
        data.inode = Some(inode);
        data.fsdata = Some(fsdata);
    }

    pub fn set_flag(&self, d: &Dentry, flag: DentryFlags) {
        d.slot().data.lock().flags.insert(flag);
    }

    #[must_use]
    pub fn test_flag(&self, d: &Dentry, flag: DentryFlags) -> bool {
        d.slot().data.lock().flags.contains(flag)
    }

    pub fn rem_flag(&self, d: &Dentry, flag: DentryFlags) {
        d.slot().data.lock().flags.remove(flag);
    }

    /// Marks `d`'s cached inode as modified, so the next flush writes
    /// it back.
    pub fn mark_dirty(&self, d: &Dentry) {
        self.set_flag(d, DentryFlags::DIRTY);
    }

    fn flush_locked(&self, driver: &dyn FilesystemDriver, d: &Dentry) -> Result<(), KernelError> {
        let mut data = d.slot().data.lock();
        if let Some(inode) = &data.inode {
            driver.write_inode(data.ino, inode)?;
            data.flags.remove(DentryFlags::DIRTY);
        }
        Ok(())
    }

    /// Writes `d`'s cached inode back to disk if it is dirty.
    pub fn flush(&self, driver: &dyn FilesystemDriver, d: &Dentry) -> Result<(), KernelError> {
        self.flush_locked(driver, d)
    }

    /// One pass of the background flusher: visits every cached dentry
    /// and writes back any whose inode is dirty.
    ///
    /// The loop that calls this repeatedly on a timer belongs to the
    /// scheduler, not this cache.
    pub fn flush_pass(&self, driver: &dyn FilesystemDriver) {
        for block in self.snapshot_blocks() {
            let _scan = block.scan_lock.lock();
            for slot in &block.slots {
                let mut data = slot.data.lock();
                if data.ino.is_free() {
                    continue;
                }
                if data.flags.contains(DentryFlags::DIRTY)
                    && let Some(inode) = &data.inode
                    && driver.write_inode(data.ino, inode).is_ok()
                {
                    data.flags.remove(DentryFlags::DIRTY);
                }
            }
        }
    }

    /// Erases a slot back to the free state, releasing its cached
    /// inode bytes and filename.
    fn erase(&self, d: &Dentry) {
        let mut data = d.slot().data.lock();
        data.ino = InodeNo::new(0);
        if let Some(inode) = data.inode.take() {
            self.cached_inode_bytes
                .fetch_sub(inode.len(), Ordering::Relaxed);
        }
        data.filename = None;
        data.fsdata = None;
        data.flags = DentryFlags::empty();
        drop(data);

        if self.cached_inode_bytes.load(Ordering::Relaxed) < crate::param::DENTRY_SWAP_THRESHOLD {
            self.can_cache_inodes.store(true, Ordering::Relaxed);
        }
    }

    /// Frees the cached inode buffer of every currently-unreferenced
    /// dentry, to bring memory use back under the swap threshold.
    fn evict_unreferenced_inodes(&self) {
        for block in self.snapshot_blocks() {
            let _scan = block.scan_lock.lock();
            for slot in &block.slots {
                let mut data = slot.data.lock();
                if data.d_count == 0
                    && let Some(inode) = data.inode.take()
                {
                    self.cached_inode_bytes
                        .fetch_sub(inode.len(), Ordering::Relaxed);
                    data.fsdata = None;
                }
            }
        }
        if self.cached_inode_bytes.load(Ordering::Relaxed) < crate::param::DENTRY_SWAP_THRESHOLD {
            self.can_cache_inodes.store(true, Ordering::Relaxed);
        }
    }

    /// Called once a dentry's reference count reaches zero and it is
    /// neither `CUSTOM` nor `INODE_TO_BE_DELETED`: either caches it for
    /// fast re-lookup, or erases it, depending on the cache's current
    /// memory pressure.
    fn prefree(&self, d: &Dentry) {
        if !self.can_cache_inodes.load(Ordering::Relaxed) {
            self.erase(d);
        } else if self.cached_inode_bytes.load(Ordering::Relaxed) >= crate::param::DENTRY_SWAP_THRESHOLD {
            self.can_cache_inodes.store(false, Ordering::Relaxed);
            self.evict_unreferenced_inodes();
        }
        self.active_count.fetch_sub(1, Ordering::Relaxed);
    }

    fn finish_put(&self, driver: &dyn FilesystemDriver, d: Dentry) {
        let parent = d.slot().data.lock().parent.take();

        let flags = d.slot().data.lock().flags;
        if flags.contains(DentryFlags::CUSTOM) {
            let ino = d.slot().data.lock().ino;
            let _ = driver.free_inode(ino);
            let mut data = d.slot().data.lock();
            data.ino = InodeNo::new(0);
            data.fsdata = None;
        } else if flags.contains(DentryFlags::INODE_TO_BE_DELETED) {
            let ino = d.slot().data.lock().ino;
            let _ = driver.free_inode(ino);
            self.erase(&d);
        } else {
            if flags.contains(DentryFlags::DIRTY) {
                let _ = self.flush_locked(driver, &d);
            }
            self.prefree(&d);
        }

        if let Some(parent) = parent {
            self.put(driver, parent);
        }
    }

    /// Releases a reference to `d`, running eviction/writeback and
    /// recursing into its parent once the last reference is gone.
    pub fn put(&self, driver: &dyn FilesystemDriver, d: Dentry) {
        let reached_zero = {
            let mut data = d.slot().data.lock();
            assert!(data.d_count > 0, "put on dentry with no outstanding references");
            data.d_count -= 1;
            data.d_count == 0
        };
        if reached_zero {
            self.finish_put(driver, d);
        }
    }

    /// Drops every outstanding reference to `d` at once and runs the
    /// same teardown [`put`](Self::put) would on the last one.
    ///
    /// A no-op on mountpoints, which must only ever be unmounted
    /// explicitly.
    pub fn force_put(&self, driver: &dyn FilesystemDriver, d: Dentry) {
        if d.slot().data.lock().flags.contains(DentryFlags::MOUNTPOINT) {
            return;
        }
        d.slot().data.lock().d_count = 0;
        self.finish_put(driver, d);
    }

    /// Force-puts every dentry currently bound to `dev`, used when a
    /// device is being ejected.
    pub fn put_all_dentries_of_device(&self, driver: &dyn FilesystemDriver, dev: DeviceNo) {
        let mut matches = Vec::new();
        for block in self.snapshot_blocks() {
            let _scan = block.scan_lock.lock();
            for (index, slot) in block.slots.iter().enumerate() {
                let data = slot.data.lock();
                if data.dev == dev && !data.ino.is_free() {
                    matches.push(Dentry {
                        block: Arc::clone(&block),
                        index,
                    });
                }
            }
        }
        for d in matches {
            self.force_put(driver, d);
        }
    }
}
