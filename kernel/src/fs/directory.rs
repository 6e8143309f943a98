//! Directories.
//!
//! A directory is an ordinary file whose contents are an array of
//! fixed-size entries ([`DirEntry`]). The first two slots are reserved
//! for `.` and `..`, written at creation and never removed.

use std::sync::Arc;

use arrayvec::ArrayVec;
use dataview::PodMethods as _;
use opin_fs_types::{DIR_ENTRY_SIZE, DirEntry, NAME_MAX, Sector};

use crate::error::KernelError;

use super::{Filesys, inode::Inode};

/// An open directory handle with a private read position.
pub struct Dir {
    inode: Arc<Inode>,
    pos: usize,
}

impl Dir {
    /// Creates a directory at `sector`, seeded with `.` pointing at
    /// itself and `..` at `parent` (the root's parent is the root), with
    /// room for `capacity` further entries before the file must grow.
    pub fn create(
        fs: &Filesys,
        sector: Sector,
        parent: Sector,
        capacity: usize,
    ) -> Result<(), KernelError> {
        fs.create_inode(sector, (2 + capacity) * DIR_ENTRY_SIZE)?;
        let dir = Self::open(fs, sector);
        let res = dir
            .write_entry(fs, 0, &DirEntry::new(b".", sector, true))
            .and_then(|()| dir.write_entry(fs, 1, &DirEntry::new(b"..", parent, true)));
        dir.close(fs);
        res
    }

    pub fn open(fs: &Filesys, sector: Sector) -> Self {
        Self {
            inode: fs.open_inode(sector),
            pos: 2,
        }
    }

    pub fn close(self, fs: &Filesys) {
        fs.close_inode(self.inode);
    }

    #[must_use]
    pub fn sector(&self) -> Sector {
        self.inode.sector()
    }

    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    fn entry_count(&self, fs: &Filesys) -> usize {
        self.inode.length(fs) / DIR_ENTRY_SIZE
    }

    fn entry_at(&self, fs: &Filesys, idx: usize) -> Option<DirEntry> {
        let mut entry = DirEntry::zeroed();
        let n = self
            .inode
            .read_at(fs, entry.as_bytes_mut(), idx * DIR_ENTRY_SIZE);
        (n == DIR_ENTRY_SIZE).then_some(entry)
    }

    fn write_entry(&self, fs: &Filesys, idx: usize, entry: &DirEntry) -> Result<(), KernelError> {
        self.inode
            .write_at(fs, entry.as_bytes(), idx * DIR_ENTRY_SIZE)?;
        Ok(())
    }

    /// Finds the live entry named `name`.
    pub fn lookup(&self, fs: &Filesys, name: &[u8]) -> Option<(usize, DirEntry)> {
        (0..self.entry_count(fs)).find_map(|idx| {
            let entry = self.entry_at(fs, idx)?;
            entry.is_same_name(name).then_some((idx, entry))
        })
    }

    /// Adds an entry, reusing the first cleared slot or appending.
    pub fn add(
        &self,
        fs: &Filesys,
        name: &[u8],
        child: Sector,
        is_dir: bool,
    ) -> Result<(), KernelError> {
        if name.is_empty() || name.contains(&b'/') || name.contains(&0) {
            return Err(KernelError::InvalidArgument);
        }
        if name.len() > NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        if self.lookup(fs, name).is_some() {
            return Err(KernelError::AlreadyExists);
        }
        let count = self.entry_count(fs);
        let idx = (2..count)
            .find(|&idx| self.entry_at(fs, idx).is_some_and(|e| !e.in_use()))
            .unwrap_or(count);
        self.write_entry(fs, idx, &DirEntry::new(name, child, is_dir))
    }

    /// Removes the entry named `name` and marks the child inode for
    /// deletion.
    ///
    /// A subdirectory is refused while it has other openers, while it is
    /// non-empty, or while `dir_busy` says some process still needs it
    /// (its working directory).
    pub fn remove(
        &self,
        fs: &Filesys,
        name: &[u8],
        dir_busy: &dyn Fn(Sector) -> bool,
    ) -> Result<(), KernelError> {
        if name == b"." || name == b".." {
            return Err(KernelError::InvalidArgument);
        }
        let (idx, entry) = self.lookup(fs, name).ok_or(KernelError::EntryNotFound)?;
        let child = fs.open_inode(entry.sector());

        if entry.is_dir() {
            let verdict = if child.open_count() > 1 || dir_busy(entry.sector()) {
                Err(KernelError::DirectoryInUse(entry.sector()))
            } else if !inode_dir_is_empty(fs, &child) {
                Err(KernelError::DirectoryNotEmpty)
            } else {
                Ok(())
            };
            if let Err(e) = verdict {
                fs.close_inode(child);
                return Err(e);
            }
        }

        let mut cleared = entry;
        cleared.clear();
        self.write_entry(fs, idx, &cleared)?;
        child.remove();
        fs.close_inode(child);
        Ok(())
    }

    /// Returns the next entry name after the read position, skipping `.`
    /// and `..`.
    pub fn readdir(&mut self, fs: &Filesys) -> Option<ArrayVec<u8, NAME_MAX>> {
        while let Some(entry) = self.entry_at(fs, self.pos) {
            self.pos += 1;
            if entry.in_use() {
                let mut name = ArrayVec::new();
                name.try_extend_from_slice(entry.name()).unwrap();
                return Some(name);
            }
        }
        None
    }
}

/// True if a directory inode holds nothing but `.` and `..`.
fn inode_dir_is_empty(fs: &Filesys, ip: &Arc<Inode>) -> bool {
    let count = ip.length(fs) / DIR_ENTRY_SIZE;
    (2..count).all(|idx| {
        let mut entry = DirEntry::zeroed();
        let n = ip.read_at(fs, entry.as_bytes_mut(), idx * DIR_ENTRY_SIZE);
        n < DIR_ENTRY_SIZE || !entry.in_use()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{device::VirtualDisk, param::CACHE_SLOTS};

    fn test_fs() -> Filesys {
        Filesys::new(Arc::new(VirtualDisk::new(1024)), CACHE_SLOTS, true).unwrap()
    }

    fn never_busy(_: Sector) -> bool {
        false
    }

    fn mkdir(fs: &Filesys, parent: Sector) -> Sector {
        let sector = fs.free_map.allocate().unwrap();
        Dir::create(fs, sector, parent, 4).unwrap();
        sector
    }

    #[test]
    fn test_create_seeds_dot_entries() {
        let fs = test_fs();
        let sector = mkdir(&fs, Sector::ROOT_DIR);
        let dir = Dir::open(&fs, sector);

        let (_, dot) = dir.lookup(&fs, b".").unwrap();
        assert_eq!(dot.sector(), sector);
        assert!(dot.is_dir());
        let (_, dotdot) = dir.lookup(&fs, b"..").unwrap();
        assert_eq!(dotdot.sector(), Sector::ROOT_DIR);
        dir.close(&fs);
    }

    #[test]
    fn test_add_lookup_remove() {
        let fs = test_fs();
        let dir = Dir::open(&fs, Sector::ROOT_DIR);
        let child = fs.free_map.allocate().unwrap();
        fs.create_inode(child, 0).unwrap();

        dir.add(&fs, b"a.txt", child, false).unwrap();
        let (_, entry) = dir.lookup(&fs, b"a.txt").unwrap();
        assert_eq!(entry.sector(), child);
        assert!(!entry.is_dir());

        assert_eq!(
            dir.add(&fs, b"a.txt", child, false),
            Err(KernelError::AlreadyExists)
        );

        dir.remove(&fs, b"a.txt", &never_busy).unwrap();
        assert!(dir.lookup(&fs, b"a.txt").is_none());
        assert_eq!(
            dir.remove(&fs, b"a.txt", &never_busy),
            Err(KernelError::EntryNotFound)
        );
        dir.close(&fs);
    }

    #[test]
    fn test_remove_nonempty_dir_refused() {
        let fs = test_fs();
        let root = Dir::open(&fs, Sector::ROOT_DIR);
        let sub = mkdir(&fs, Sector::ROOT_DIR);
        root.add(&fs, b"sub", sub, true).unwrap();

        let subdir = Dir::open(&fs, sub);
        let file = fs.free_map.allocate().unwrap();
        fs.create_inode(file, 0).unwrap();
        subdir.add(&fs, b"inner", file, false).unwrap();
        subdir.close(&fs);

        assert_eq!(
            root.remove(&fs, b"sub", &never_busy),
            Err(KernelError::DirectoryNotEmpty)
        );

        let subdir = Dir::open(&fs, sub);
        subdir.remove(&fs, b"inner", &never_busy).unwrap();
        subdir.close(&fs);
        root.remove(&fs, b"sub", &never_busy).unwrap();
        root.close(&fs);
    }

    #[test]
    fn test_remove_open_dir_refused() {
        let fs = test_fs();
        let root = Dir::open(&fs, Sector::ROOT_DIR);
        let sub = mkdir(&fs, Sector::ROOT_DIR);
        root.add(&fs, b"sub", sub, true).unwrap();

        let held = Dir::open(&fs, sub);
        assert!(matches!(
            root.remove(&fs, b"sub", &never_busy),
            Err(KernelError::DirectoryInUse(_))
        ));
        held.close(&fs);
        root.remove(&fs, b"sub", &never_busy).unwrap();
        root.close(&fs);
    }

    #[test]
    fn test_remove_cwd_refused() {
        let fs = test_fs();
        let root = Dir::open(&fs, Sector::ROOT_DIR);
        let sub = mkdir(&fs, Sector::ROOT_DIR);
        root.add(&fs, b"sub", sub, true).unwrap();

        let busy = |s: Sector| s == sub;
        assert!(matches!(
            root.remove(&fs, b"sub", &busy),
            Err(KernelError::DirectoryInUse(_))
        ));
        root.remove(&fs, b"sub", &never_busy).unwrap();
        root.close(&fs);
    }

    #[test]
    fn test_slot_reuse_and_append() {
        let fs = test_fs();
        let sector = mkdir(&fs, Sector::ROOT_DIR);
        let dir = Dir::open(&fs, sector);

        // Fill past the preallocated capacity to force an append.
        for i in 0..8u8 {
            let child = fs.free_map.allocate().unwrap();
            fs.create_inode(child, 0).unwrap();
            dir.add(&fs, &[b'f', b'0' + i], child, false).unwrap();
        }
        let grown = dir.inode().length(&fs);
        assert!(grown > (2 + 4) * DIR_ENTRY_SIZE);

        // Removing one and adding another reuses the cleared slot.
        dir.remove(&fs, b"f3", &never_busy).unwrap();
        let child = fs.free_map.allocate().unwrap();
        fs.create_inode(child, 0).unwrap();
        dir.add(&fs, b"f9", child, false).unwrap();
        assert_eq!(dir.inode().length(&fs), grown);
        dir.close(&fs);
    }

    #[test]
    fn test_readdir_skips_dots_and_free() {
        let fs = test_fs();
        let sector = mkdir(&fs, Sector::ROOT_DIR);
        let mut dir = Dir::open(&fs, sector);

        for name in [b"aa".as_slice(), b"bb", b"cc"] {
            let child = fs.free_map.allocate().unwrap();
            fs.create_inode(child, 0).unwrap();
            dir.add(&fs, name, child, false).unwrap();
        }
        dir.remove(&fs, b"bb", &never_busy).unwrap();

        let mut seen = Vec::new();
        while let Some(name) = dir.readdir(&fs) {
            seen.push(name.to_vec());
        }
        assert_eq!(seen, [b"aa".to_vec(), b"cc".to_vec()]);
        dir.close(&fs);
    }

    #[test]
    fn test_name_limits() {
        let fs = test_fs();
        let dir = Dir::open(&fs, Sector::ROOT_DIR);
        let child = fs.free_map.allocate().unwrap();
        fs.create_inode(child, 0).unwrap();

        assert_eq!(
            dir.add(&fs, &[b'n'; NAME_MAX + 1], child, false),
            Err(KernelError::NameTooLong)
        );
        assert_eq!(
            dir.add(&fs, b"", child, false),
            Err(KernelError::InvalidArgument)
        );
        dir.add(&fs, &[b'n'; NAME_MAX], child, false).unwrap();
        dir.close(&fs);
    }
}
