//! Inodes.
//!
//! An inode describes a single unnamed file: its length and the sectors
//! holding its content, reached through 12 direct slots, one indirect
//! sector, and one doubly-indirect sector. The on-disk form occupies
//! exactly one sector ([`opin_fs_types::DiskInode`]).
//!
//! There is no in-memory copy of the on-disk inode. Every metadata
//! access reads or writes a field at a fixed offset inside the inode's
//! own sector, through the block cache; the cache is what makes that
//! cheap. The in-memory [`Inode`] carries only bookkeeping that never
//! touches the disk: the open count, the removed flag, and the
//! deny-write count.
//!
//! The kernel keeps a registry of open inodes so that opening the same
//! sector twice yields the same in-memory inode; the removed flag, the
//! deny-write count, and the per-inode lock are thereby shared by all
//! openers. When the open count falls to zero and the inode was removed,
//! its data sectors, its indirect metadata sectors, and finally the
//! inode sector itself are freed.
//!
//! The per-inode lock serializes length changes: a writer that extends
//! the file holds it from the first tail allocation until the new length
//! is on disk, so `length` observers never see a length the sectors
//! cannot back. Non-extending writes do not take it.

use std::sync::{Arc, Mutex};

use dataview::PodMethods as _;
use opin_fs_types::{
    DIRECT_SLOTS, DOUBLY_SLOT_OFFSET, INDIRECT_SLOT_OFFSET, INODE_MAGIC, IndirectBlock,
    LENGTH_OFFSET, MAGIC_OFFSET, MAX_FILE_BYTES, SECTOR_SIZE, Sector, SLOTS_PER_INDIRECT,
    direct_slot_offset, indirect_slot_offset,
};

use crate::error::KernelError;

use super::Filesys;

/// An open inode. Obtained from [`Filesys::open_inode`], shared by every
/// opener of the same sector, released with [`Filesys::close_inode`].
pub struct Inode {
    sector: Sector,
    meta: Mutex<InodeMeta>,
}

struct InodeMeta {
    open_cnt: u32,
    removed: bool,
    deny_write: u32,
}

/// Registry of open inodes, keyed by inode sector.
pub struct InodeTable {
    open: Mutex<Vec<Arc<Inode>>>,
}

impl InodeTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            open: Mutex::new(Vec::new()),
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u32(fs: &Filesys, sector: Sector, ofs: usize) -> u32 {
    let mut bytes = [0u8; 4];
    let Ok(()) = fs.cache.read(sector.index(), ofs, &mut bytes);
    u32::from_le_bytes(bytes)
}

fn write_u32(fs: &Filesys, sector: Sector, ofs: usize, value: u32) {
    let Ok(()) = fs.cache.write(sector.index(), ofs, &value.to_le_bytes());
}

fn nonzero(slot: u32) -> Option<Sector> {
    if slot == 0 { None } else { Some(Sector::new(slot)) }
}

/// Reads the slot holding sector number `v` at `ofs` in `holder`; if the
/// slot is empty and `alloc` is set, allocates and installs a zeroed
/// metadata sector there.
fn meta_at(
    fs: &Filesys,
    holder: Sector,
    ofs: usize,
    alloc: bool,
) -> Result<Option<Sector>, KernelError> {
    if let Some(s) = nonzero(read_u32(fs, holder, ofs)) {
        return Ok(Some(s));
    }
    if !alloc {
        return Ok(None);
    }
    let meta = fs.free_map.allocate().ok_or(KernelError::OutOfBlocks)?;
    let Ok(()) = fs.cache.write_zeros(meta.index());
    write_u32(fs, holder, ofs, meta.value());
    Ok(Some(meta))
}

/// Finds where logical sector `k` of the inode at `isec` is recorded:
/// the sector holding the slot, and the slot's byte offset in it.
///
/// With `alloc`, missing indirect and doubly-indirect metadata sectors
/// are created on the way; without it, a missing metadata sector makes
/// the whole range a hole (`None`).
///
/// # Panics
///
/// Panics if `k` is beyond the largest representable file; callers
/// bound-check against [`MAX_FILE_BYTES`] first.
fn locate_slot(
    fs: &Filesys,
    isec: Sector,
    k: usize,
    alloc: bool,
) -> Result<Option<(Sector, usize)>, KernelError> {
    if k < DIRECT_SLOTS {
        return Ok(Some((isec, direct_slot_offset(k))));
    }
    let k = k - DIRECT_SLOTS;
    if k < SLOTS_PER_INDIRECT {
        let ind = meta_at(fs, isec, INDIRECT_SLOT_OFFSET, alloc)?;
        return Ok(ind.map(|s| (s, indirect_slot_offset(k))));
    }
    let k = k - SLOTS_PER_INDIRECT;
    assert!(
        k < SLOTS_PER_INDIRECT * SLOTS_PER_INDIRECT,
        "logical sector out of range"
    );
    let (hi, lo) = (k / SLOTS_PER_INDIRECT, k % SLOTS_PER_INDIRECT);
    let Some(dbl) = meta_at(fs, isec, DOUBLY_SLOT_OFFSET, alloc)? else {
        return Ok(None);
    };
    let Some(ind) = meta_at(fs, dbl, indirect_slot_offset(hi), alloc)? else {
        return Ok(None);
    };
    Ok(Some((ind, indirect_slot_offset(lo))))
}

/// Translates logical sector `k` to its physical sector, or `None` for a
/// hole.
fn slot_lookup(fs: &Filesys, isec: Sector, k: usize) -> Option<Sector> {
    let (holder, ofs) = locate_slot(fs, isec, k, false).unwrap()?;
    nonzero(read_u32(fs, holder, ofs))
}

/// Allocates a zeroed data sector for logical sector `k` and records it.
///
/// The slot must currently be a hole; the per-inode lock serializes
/// growers.
fn grow_one(fs: &Filesys, isec: Sector, k: usize) -> Result<Sector, KernelError> {
    let (holder, ofs) = locate_slot(fs, isec, k, true)?.unwrap();
    assert_eq!(read_u32(fs, holder, ofs), 0, "growing an allocated slot");
    let data = fs.free_map.allocate().ok_or(KernelError::OutOfBlocks)?;
    let Ok(()) = fs.cache.write_zeros(data.index());
    write_u32(fs, holder, ofs, data.value());
    Ok(data)
}

/// Clears the slot for logical sector `k` (extension rollback).
fn clear_slot(fs: &Filesys, isec: Sector, k: usize) {
    let (holder, ofs) = locate_slot(fs, isec, k, false)
        .unwrap()
        .expect("rolled-back slot has no metadata sector");
    write_u32(fs, holder, ofs, 0);
}

fn release_indirect(fs: &Filesys, ind: Sector) {
    let mut blk = IndirectBlock::zeroed();
    let Ok(()) = fs.cache.read(ind.index(), 0, blk.as_bytes_mut());
    for s in blk.slots() {
        fs.free_map.release(s);
    }
    fs.free_map.release(ind);
}

/// Frees every data sector and metadata sector the inode references,
/// clearing each slot as it goes so a repeated walk finds nothing.
/// The inode sector itself stays allocated; the caller owns it.
pub(super) fn free_blocks(fs: &Filesys, isec: Sector) {
    for k in 0..DIRECT_SLOTS {
        if let Some(s) = nonzero(read_u32(fs, isec, direct_slot_offset(k))) {
            fs.free_map.release(s);
            write_u32(fs, isec, direct_slot_offset(k), 0);
        }
    }
    if let Some(ind) = nonzero(read_u32(fs, isec, INDIRECT_SLOT_OFFSET)) {
        release_indirect(fs, ind);
        write_u32(fs, isec, INDIRECT_SLOT_OFFSET, 0);
    }
    if let Some(dbl) = nonzero(read_u32(fs, isec, DOUBLY_SLOT_OFFSET)) {
        let mut blk = IndirectBlock::zeroed();
        let Ok(()) = fs.cache.read(dbl.index(), 0, blk.as_bytes_mut());
        for ind in blk.slots() {
            release_indirect(fs, ind);
        }
        fs.free_map.release(dbl);
        write_u32(fs, isec, DOUBLY_SLOT_OFFSET, 0);
    }
}

impl Filesys {
    /// Initializes an inode of `length` bytes at `sector`, preallocating
    /// every sector of the initial contents.
    ///
    /// On allocation failure every sector acquired so far is freed and
    /// the error is returned; `sector` itself remains the caller's to
    /// release.
    pub fn create_inode(&self, sector: Sector, length: usize) -> Result<(), KernelError> {
        if length > MAX_FILE_BYTES {
            return Err(KernelError::FileTooLarge);
        }
        let Ok(()) = self.cache.write_zeros(sector.index());
        write_u32(self, sector, LENGTH_OFFSET, u32::try_from(length).unwrap());
        write_u32(self, sector, MAGIC_OFFSET, INODE_MAGIC);
        for k in 0..length.div_ceil(SECTOR_SIZE) {
            if let Err(e) = grow_one(self, sector, k) {
                free_blocks(self, sector);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Opens the inode at `sector`, sharing the in-memory inode with any
    /// existing opener.
    ///
    /// # Panics
    ///
    /// Panics if the sector does not carry the inode magic.
    pub fn open_inode(&self, sector: Sector) -> Arc<Inode> {
        let mut open = self.inodes.open.lock().unwrap();
        if let Some(ip) = open.iter().find(|ip| ip.sector == sector) {
            ip.meta.lock().unwrap().open_cnt += 1;
            return Arc::clone(ip);
        }
        assert_eq!(
            read_u32(self, sector, MAGIC_OFFSET),
            INODE_MAGIC,
            "corrupt inode magic at sector {sector}"
        );
        let ip = Arc::new(Inode {
            sector,
            meta: Mutex::new(InodeMeta {
                open_cnt: 1,
                removed: false,
                deny_write: 0,
            }),
        });
        open.push(Arc::clone(&ip));
        ip
    }

    /// Takes another reference to an already-open inode.
    pub fn reopen_inode(&self, ip: &Arc<Inode>) -> Arc<Inode> {
        ip.meta.lock().unwrap().open_cnt += 1;
        Arc::clone(ip)
    }

    /// Drops one reference. The last close of a removed inode frees its
    /// content and its own sector.
    pub fn close_inode(&self, ip: Arc<Inode>) {
        let mut open = self.inodes.open.lock().unwrap();
        let removed = {
            let mut meta = ip.meta.lock().unwrap();
            meta.open_cnt -= 1;
            if meta.open_cnt > 0 {
                return;
            }
            meta.removed
        };
        open.retain(|entry| !Arc::ptr_eq(entry, &ip));
        drop(open);

        if removed {
            free_blocks(self, ip.sector);
            self.free_map.release(ip.sector);
        }
    }
}

impl Inode {
    #[must_use]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    /// Current file length in bytes.
    ///
    /// Takes the per-inode lock, so a concurrent extension is observed
    /// either entirely or not at all.
    pub fn length(&self, fs: &Filesys) -> usize {
        let _meta = self.meta.lock().unwrap();
        read_u32(fs, self.sector, LENGTH_OFFSET) as usize
    }

    /// Number of openers, shared across all handles to this sector.
    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.meta.lock().unwrap().open_cnt
    }

    /// Marks the inode for deletion at last close.
    pub fn remove(&self) {
        self.meta.lock().unwrap().removed = true;
    }

    /// Disables writes. May be called once per opener.
    pub fn deny_write(&self) {
        let mut meta = self.meta.lock().unwrap();
        meta.deny_write += 1;
        assert!(meta.deny_write <= meta.open_cnt);
    }

    /// Re-enables writes; pairs with one earlier [`Inode::deny_write`].
    pub fn allow_write(&self) {
        let mut meta = self.meta.lock().unwrap();
        assert!(meta.deny_write > 0);
        meta.deny_write -= 1;
    }

    /// Reads up to `buf.len()` bytes at `ofs`.
    ///
    /// Returns the number of bytes read, short at end of file. Holes and
    /// never-written sectors read as zeros without device I/O.
    pub fn read_at(&self, fs: &Filesys, buf: &mut [u8], ofs: usize) -> usize {
        let length = self.length(fs);
        if ofs >= length {
            return 0;
        }
        let n = usize::min(buf.len(), length - ofs);
        let mut done = 0;
        while done < n {
            let pos = ofs + done;
            let chunk = usize::min(n - done, SECTOR_SIZE - pos % SECTOR_SIZE);
            match slot_lookup(fs, self.sector, pos / SECTOR_SIZE) {
                Some(s) => {
                    let Ok(()) =
                        fs.cache
                            .read(s.index(), pos % SECTOR_SIZE, &mut buf[done..done + chunk]);
                }
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        n
    }

    /// Writes `buf` at `ofs`, extending the file when the write ends past
    /// the current length.
    ///
    /// Extension allocates exactly the missing tail sectors (and any
    /// metadata sectors they need) under the per-inode lock, performs the
    /// writes, then stamps the new length, so concurrent extenders
    /// serialize and length observers never outrun allocation. On
    /// allocation failure nothing is committed.
    pub fn write_at(&self, fs: &Filesys, buf: &[u8], ofs: usize) -> Result<usize, KernelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let meta = self.meta.lock().unwrap();
        if meta.deny_write > 0 {
            return Err(KernelError::WriteDenied(self.sector));
        }
        let end = ofs.checked_add(buf.len()).ok_or(KernelError::InvalidArgument)?;
        if end > MAX_FILE_BYTES {
            return Err(KernelError::FileTooLarge);
        }
        let length = read_u32(fs, self.sector, LENGTH_OFFSET) as usize;
        let extending = end > length;
        let meta = if extending {
            self.extend(fs, length, end)?;
            Some(meta)
        } else {
            drop(meta);
            None
        };

        let mut done = 0;
        while done < buf.len() {
            let pos = ofs + done;
            let chunk = usize::min(buf.len() - done, SECTOR_SIZE - pos % SECTOR_SIZE);
            let k = pos / SECTOR_SIZE;
            let sector = match slot_lookup(fs, self.sector, k) {
                Some(s) => s,
                // Writing a hole allocates and fills.
                None if meta.is_some() => grow_one(fs, self.sector, k)?,
                None => self.fill_hole(fs, k)?,
            };
            let Ok(()) = fs.cache.write(
                sector.index(),
                pos % SECTOR_SIZE,
                &buf[done..done + chunk],
            );
            done += chunk;
        }

        if let Some(meta) = meta {
            write_u32(fs, self.sector, LENGTH_OFFSET, u32::try_from(end).unwrap());
            drop(meta);
        }
        Ok(buf.len())
    }

    /// Allocates the tail sectors `[ceil(old/512), ceil(new/512))`.
    /// Caller holds the per-inode lock. Rolls back on failure.
    fn extend(&self, fs: &Filesys, old_len: usize, new_len: usize) -> Result<(), KernelError> {
        let mut added = Vec::new();
        for k in old_len.div_ceil(SECTOR_SIZE)..new_len.div_ceil(SECTOR_SIZE) {
            match grow_one(fs, self.sector, k) {
                Ok(s) => added.push((k, s)),
                Err(e) => {
                    for (k, s) in added {
                        clear_slot(fs, self.sector, k);
                        fs.free_map.release(s);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Allocates a hole below the recorded length, serializing racing
    /// hole writers on the per-inode lock.
    fn fill_hole(&self, fs: &Filesys, k: usize) -> Result<Sector, KernelError> {
        let _meta = self.meta.lock().unwrap();
        if let Some(s) = slot_lookup(fs, self.sector, k) {
            return Ok(s);
        }
        grow_one(fs, self.sector, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use opin_fs_types::MAX_FILE_SECTORS;

    use crate::{device::VirtualDisk, param::CACHE_SLOTS};

    fn test_fs(sectors: usize) -> Filesys {
        Filesys::new(Arc::new(VirtualDisk::new(sectors)), CACHE_SLOTS, true).unwrap()
    }

    fn fresh_inode(fs: &Filesys, length: usize) -> Arc<Inode> {
        let sector = fs.free_map.allocate().unwrap();
        fs.create_inode(sector, length).unwrap();
        fs.open_inode(sector)
    }

    #[test]
    fn test_round_trip_at_offset() {
        let fs = test_fs(512);
        let ip = fresh_inode(&fs, 0);

        assert_eq!(ip.write_at(&fs, b"hello, inode", 1000).unwrap(), 12);
        assert_eq!(ip.length(&fs), 1012);

        let mut buf = [0u8; 12];
        assert_eq!(ip.read_at(&fs, &mut buf, 1000), 12);
        assert_eq!(&buf, b"hello, inode");
        fs.close_inode(ip);
    }

    #[test]
    fn test_preallocated_reads_zeros() {
        let fs = test_fs(512);
        let ip = fresh_inode(&fs, 3 * SECTOR_SIZE);

        assert_eq!(ip.length(&fs), 3 * SECTOR_SIZE);
        let mut buf = vec![0xffu8; 3 * SECTOR_SIZE];
        assert_eq!(ip.read_at(&fs, &mut buf, 0), 3 * SECTOR_SIZE);
        assert!(buf.iter().all(|&b| b == 0));
        fs.close_inode(ip);
    }

    #[test]
    fn test_read_past_eof_is_short() {
        let fs = test_fs(512);
        let ip = fresh_inode(&fs, 0);
        ip.write_at(&fs, &[7; 100], 0).unwrap();

        let mut buf = [0u8; 200];
        assert_eq!(ip.read_at(&fs, &mut buf, 0), 100);
        assert_eq!(ip.read_at(&fs, &mut buf, 100), 0);
        assert_eq!(ip.read_at(&fs, &mut buf, 50), 50);
        fs.close_inode(ip);
    }

    #[test]
    fn test_extension_through_indirect() {
        let fs = test_fs(1024);
        let ip = fresh_inode(&fs, 0);

        // Past the direct slots and into the indirect range.
        let ofs = (DIRECT_SLOTS + 3) * SECTOR_SIZE + 17;
        ip.write_at(&fs, &[0x5a; 600], ofs).unwrap();
        assert_eq!(ip.length(&fs), ofs + 600);

        let mut buf = [0u8; 600];
        assert_eq!(ip.read_at(&fs, &mut buf, ofs), 600);
        assert!(buf.iter().all(|&b| b == 0x5a));

        // The skipped-over range was allocated, not left as holes, and
        // reads back zeroed.
        let mut gap = [0xffu8; SECTOR_SIZE];
        assert_eq!(ip.read_at(&fs, &mut gap, 4 * SECTOR_SIZE), SECTOR_SIZE);
        assert!(gap.iter().all(|&b| b == 0));
        assert!(slot_lookup(&fs, ip.sector(), 4).is_some());
        fs.close_inode(ip);
    }

    #[test]
    fn test_doubly_indirect_translation() {
        let fs = test_fs(2048);
        let ip = fresh_inode(&fs, 0);

        let k = DIRECT_SLOTS + SLOTS_PER_INDIRECT + 5;
        let ofs = k * SECTOR_SIZE;
        ip.write_at(&fs, b"deep water", ofs).unwrap();

        let mut buf = [0u8; 10];
        assert_eq!(ip.read_at(&fs, &mut buf, ofs), 10);
        assert_eq!(&buf, b"deep water");

        // Metadata chain is in place: doubly-indirect, then indirect.
        assert!(nonzero(read_u32(&fs, ip.sector(), DOUBLY_SLOT_OFFSET)).is_some());
        assert!(slot_lookup(&fs, ip.sector(), k).is_some());
        fs.close_inode(ip);
    }

    #[test]
    fn test_length_monotonic_under_writes() {
        let fs = test_fs(512);
        let ip = fresh_inode(&fs, 0);

        let mut last = 0;
        for i in 0..20 {
            ip.write_at(&fs, &[1; 300], i * 300).unwrap();
            let len = ip.length(&fs);
            assert!(len >= last);
            last = len;
        }
        assert_eq!(last, 6000);
        fs.close_inode(ip);
    }

    #[test]
    fn test_remove_frees_every_sector() {
        let fs = test_fs(1024);
        let used_before = fs.free_map.used();

        let sector = fs.free_map.allocate().unwrap();
        fs.create_inode(sector, 0).unwrap();
        let ip = fs.open_inode(sector);
        // Spans direct, indirect, and doubly-indirect metadata.
        let ofs = (DIRECT_SLOTS + SLOTS_PER_INDIRECT + 2) * SECTOR_SIZE;
        ip.write_at(&fs, &[9; SECTOR_SIZE], ofs).unwrap();
        assert!(fs.free_map.used() > used_before);

        ip.remove();
        fs.close_inode(ip);
        assert_eq!(fs.free_map.used(), used_before);
    }

    #[test]
    fn test_removed_waits_for_last_close() {
        let fs = test_fs(512);
        let used_before = fs.free_map.used();

        let ip = fresh_inode(&fs, SECTOR_SIZE);
        let ip2 = fs.reopen_inode(&ip);
        ip.remove();
        fs.close_inode(ip);
        // Still open once; nothing freed yet.
        assert!(fs.free_map.used() > used_before);

        ip2.write_at(&fs, b"still usable", 0).unwrap();
        fs.close_inode(ip2);
        assert_eq!(fs.free_map.used(), used_before);
    }

    #[test]
    fn test_deny_write() {
        let fs = test_fs(512);
        let ip = fresh_inode(&fs, 0);

        ip.deny_write();
        assert!(matches!(
            ip.write_at(&fs, b"no", 0),
            Err(KernelError::WriteDenied(_))
        ));
        ip.allow_write();
        assert_eq!(ip.write_at(&fs, b"yes", 0).unwrap(), 3);
        fs.close_inode(ip);
    }

    #[test]
    fn test_open_is_idempotent() {
        let fs = test_fs(512);
        let ip = fresh_inode(&fs, 0);
        let again = fs.open_inode(ip.sector());
        assert!(Arc::ptr_eq(&ip, &again));
        assert_eq!(ip.open_count(), 2);
        fs.close_inode(again);
        assert_eq!(ip.open_count(), 1);
        fs.close_inode(ip);
    }

    #[test]
    fn test_create_preallocation_rollback() {
        // 64 sectors total; asking for more content than the device has
        // must fail without leaking anything.
        let fs = test_fs(64);
        let used_before = fs.free_map.used();
        let sector = fs.free_map.allocate().unwrap();
        assert_eq!(
            fs.create_inode(sector, 200 * SECTOR_SIZE),
            Err(KernelError::OutOfBlocks)
        );
        fs.free_map.release(sector);
        assert_eq!(fs.free_map.used(), used_before);
    }

    #[test]
    fn test_max_file_size_enforced() {
        let fs = test_fs(512);
        let ip = fresh_inode(&fs, 0);
        assert_eq!(
            ip.write_at(&fs, &[0; 16], MAX_FILE_BYTES - 8),
            Err(KernelError::FileTooLarge)
        );
        assert_eq!(MAX_FILE_SECTORS * SECTOR_SIZE, MAX_FILE_BYTES);
        fs.close_inode(ip);
    }
}
