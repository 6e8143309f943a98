//! File system implementation.
//!
//! Four layers, bottom up:
//!
//! * the shared block cache (`block_cache` crate) over the raw device;
//! * the free-sector map ([`free_map`]), itself persisted as a file;
//! * inodes ([`inode`]): extensible files addressed by inode sector;
//! * directories ([`directory`]): files holding name -> inode entries.
//!
//! This module owns the [`Filesys`] context the layers share, boot-time
//! formatting/loading, and the thin path-walk glue between syscalls and
//! directories. Sector 0 of the device holds the free-map file's inode,
//! sector 1 the root directory's.

pub mod directory;
pub mod free_map;
pub mod inode;

use std::sync::Arc;

use block_cache::BlockCache;
use opin_fs_types::{SECTOR_SIZE, Sector};

use crate::{device::VirtualDisk, error::KernelError, param::DIR_CAPACITY};

use self::{
    directory::Dir,
    free_map::FreeMap,
    inode::{Inode, InodeTable},
};

pub type SectorCache = BlockCache<Arc<VirtualDisk>, SECTOR_SIZE>;

/// The file system context: cache, allocator, and open-inode registry.
pub struct Filesys {
    pub cache: SectorCache,
    pub free_map: FreeMap,
    pub inodes: InodeTable,
}

/// What a path resolved to.
pub enum OpenNode {
    File(Arc<Inode>),
    Dir(Dir),
}

impl Filesys {
    /// Mounts the file system on `disk`, formatting it first if asked.
    pub fn new(
        disk: Arc<VirtualDisk>,
        cache_slots: usize,
        format: bool,
    ) -> Result<Self, KernelError> {
        let sectors = disk.size();
        let fs = Self {
            cache: BlockCache::new(disk, cache_slots),
            free_map: FreeMap::new(sectors),
            inodes: InodeTable::new(),
        };
        if format {
            fs.format()?;
        } else {
            fs.load_free_map();
        }
        Ok(fs)
    }

    fn format(&self) -> Result<(), KernelError> {
        self.free_map.mark(Sector::FREE_MAP);
        self.free_map.mark(Sector::ROOT_DIR);
        self.create_inode(Sector::FREE_MAP, self.free_map.byte_len())?;
        Dir::create(self, Sector::ROOT_DIR, Sector::ROOT_DIR, DIR_CAPACITY)?;
        self.store_free_map()
    }

    fn load_free_map(&self) {
        let ip = self.open_inode(Sector::FREE_MAP);
        let mut bytes = vec![0u8; self.free_map.byte_len()];
        let n = ip.read_at(self, &mut bytes, 0);
        assert_eq!(n, bytes.len(), "truncated free-map file");
        self.free_map.load_bytes(&bytes);
        self.close_inode(ip);
    }

    /// Writes the in-memory free map into its backing file.
    pub fn store_free_map(&self) -> Result<(), KernelError> {
        let ip = self.open_inode(Sector::FREE_MAP);
        let bytes = self.free_map.to_bytes();
        let res = ip.write_at(self, &bytes, 0).map(|_| ());
        self.close_inode(ip);
        res
    }

    /// Unmounts: persists the free map and flushes the cache. All other
    /// users must be done.
    pub fn close(&self) -> Result<(), KernelError> {
        self.store_free_map()?;
        let Ok(()) = self.cache.shutdown();
        Ok(())
    }

    fn start(&self, cwd: Sector, path: &[u8]) -> Sector {
        if path.first() == Some(&b'/') {
            Sector::ROOT_DIR
        } else {
            cwd
        }
    }

    /// Follows `comps` from `start`. `.` and `..` are ordinary on-disk
    /// entries, so they need no special handling here.
    fn walk(&self, start: Sector, comps: &[&[u8]]) -> Result<(Sector, bool), KernelError> {
        let mut cur = (start, true);
        for comp in comps {
            if !cur.1 {
                return Err(KernelError::NotADirectory);
            }
            let dir = Dir::open(self, cur.0);
            let found = dir
                .lookup(self, comp)
                .map(|(_, entry)| (entry.sector(), entry.is_dir()));
            dir.close(self);
            cur = found.ok_or(KernelError::EntryNotFound)?;
        }
        Ok(cur)
    }

    /// Resolves `path` to its inode sector and directory-ness.
    pub fn lookup_path(&self, cwd: Sector, path: &[u8]) -> Result<(Sector, bool), KernelError> {
        let comps: Vec<&[u8]> = components(path).collect();
        if comps.is_empty() && !path.starts_with(b"/") {
            // The empty path names nothing; "/" alone names the root.
            return Err(KernelError::EntryNotFound);
        }
        self.walk(self.start(cwd, path), &comps)
    }

    /// Opens the directory that would contain `path`'s last component.
    fn resolve_parent<'p>(
        &self,
        cwd: Sector,
        path: &'p [u8],
    ) -> Result<(Dir, &'p [u8]), KernelError> {
        let comps: Vec<&[u8]> = components(path).collect();
        let Some((&name, parents)) = comps.split_last() else {
            return Err(KernelError::InvalidArgument);
        };
        let (sector, is_dir) = self.walk(self.start(cwd, path), parents)?;
        if !is_dir {
            return Err(KernelError::NotADirectory);
        }
        Ok((Dir::open(self, sector), name))
    }

    /// Creates an ordinary file of `size` bytes at `path`.
    pub fn create_path(&self, cwd: Sector, path: &[u8], size: usize) -> Result<(), KernelError> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let res = (|| {
            let sector = self.free_map.allocate().ok_or(KernelError::OutOfBlocks)?;
            if let Err(e) = self.create_inode(sector, size) {
                self.free_map.release(sector);
                return Err(e);
            }
            if let Err(e) = parent.add(self, name, sector, false) {
                inode::free_blocks(self, sector);
                self.free_map.release(sector);
                return Err(e);
            }
            Ok(())
        })();
        parent.close(self);
        res
    }

    /// Creates a directory at `path`.
    pub fn mkdir_path(&self, cwd: Sector, path: &[u8]) -> Result<(), KernelError> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let res = (|| {
            let sector = self.free_map.allocate().ok_or(KernelError::OutOfBlocks)?;
            if let Err(e) = Dir::create(self, sector, parent.sector(), DIR_CAPACITY) {
                // Dir::create unwinds its own allocations.
                self.free_map.release(sector);
                return Err(e);
            }
            if let Err(e) = parent.add(self, name, sector, true) {
                inode::free_blocks(self, sector);
                self.free_map.release(sector);
                return Err(e);
            }
            Ok(())
        })();
        parent.close(self);
        res
    }

    /// Removes the file or empty directory at `path`. `dir_busy` reports
    /// whether a directory sector is some process's working directory.
    pub fn remove_path(
        &self,
        cwd: Sector,
        path: &[u8],
        dir_busy: &dyn Fn(Sector) -> bool,
    ) -> Result<(), KernelError> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let res = parent.remove(self, name, dir_busy);
        parent.close(self);
        res
    }

    /// Opens whatever `path` names.
    pub fn open_path(&self, cwd: Sector, path: &[u8]) -> Result<OpenNode, KernelError> {
        let (sector, is_dir) = self.lookup_path(cwd, path)?;
        Ok(if is_dir {
            OpenNode::Dir(Dir::open(self, sector))
        } else {
            OpenNode::File(self.open_inode(sector))
        })
    }

    /// Resolves `path` for `chdir`; it must name a directory.
    pub fn chdir_lookup(&self, cwd: Sector, path: &[u8]) -> Result<Sector, KernelError> {
        let (sector, is_dir) = self.lookup_path(cwd, path)?;
        if !is_dir {
            return Err(KernelError::NotADirectory);
        }
        Ok(sector)
    }
}

fn components(path: &[u8]) -> impl Iterator<Item = &[u8]> {
    path.split(|&b| b == b'/').filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::param::CACHE_SLOTS;

    const ROOT: Sector = Sector::ROOT_DIR;

    fn never_busy(_: Sector) -> bool {
        false
    }

    fn test_fs() -> Filesys {
        Filesys::new(Arc::new(VirtualDisk::new(2048)), CACHE_SLOTS, true).unwrap()
    }

    #[test]
    fn test_create_open_remove() {
        let fs = test_fs();
        fs.create_path(ROOT, b"/a", 0).unwrap();
        assert_eq!(
            fs.create_path(ROOT, b"/a", 0),
            Err(KernelError::AlreadyExists)
        );

        let OpenNode::File(ip) = fs.open_path(ROOT, b"/a").unwrap() else {
            panic!("expected a file");
        };
        ip.write_at(&fs, b"contents", 0).unwrap();
        fs.close_inode(ip);

        fs.remove_path(ROOT, b"/a", &never_busy).unwrap();
        assert_eq!(
            fs.lookup_path(ROOT, b"/a"),
            Err(KernelError::EntryNotFound)
        );
    }

    #[test]
    fn test_nested_paths_and_cwd() {
        let fs = test_fs();
        fs.mkdir_path(ROOT, b"/d").unwrap();
        let d = fs.chdir_lookup(ROOT, b"/d").unwrap();

        // Relative creation from inside /d.
        fs.mkdir_path(d, b"sub").unwrap();
        assert_eq!(fs.mkdir_path(ROOT, b"/d/sub"), Err(KernelError::AlreadyExists));

        let (sub, is_dir) = fs.lookup_path(ROOT, b"/d/sub").unwrap();
        assert!(is_dir);
        assert_eq!(fs.lookup_path(d, b"sub").unwrap().0, sub);

        // Dot entries resolve through the walk.
        assert_eq!(fs.lookup_path(d, b".").unwrap().0, d);
        assert_eq!(fs.lookup_path(d, b"..").unwrap().0, ROOT);
        assert_eq!(fs.lookup_path(ROOT, b"/d/sub/../..").unwrap().0, ROOT);

        fs.remove_path(ROOT, b"/d/sub", &never_busy).unwrap();
        fs.remove_path(ROOT, b"/d", &never_busy).unwrap();
    }

    #[test]
    fn test_path_edge_cases() {
        let fs = test_fs();
        assert_eq!(fs.lookup_path(ROOT, b"/").unwrap(), (ROOT, true));
        assert_eq!(fs.lookup_path(ROOT, b""), Err(KernelError::EntryNotFound));
        assert_eq!(
            fs.create_path(ROOT, b"/", 0),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            fs.lookup_path(ROOT, b"/missing/x"),
            Err(KernelError::EntryNotFound)
        );

        fs.create_path(ROOT, b"/file", 0).unwrap();
        assert_eq!(
            fs.lookup_path(ROOT, b"/file/x"),
            Err(KernelError::NotADirectory)
        );
        // The root's parent is the root.
        assert_eq!(fs.lookup_path(ROOT, b"/..").unwrap().0, ROOT);
    }

    #[test]
    fn test_free_map_persists_across_mounts() {
        let disk = Arc::new(VirtualDisk::new(2048));
        let used = {
            let fs = Filesys::new(Arc::clone(&disk), CACHE_SLOTS, true).unwrap();
            fs.create_path(ROOT, b"/keep", 3 * SECTOR_SIZE).unwrap();
            let used = fs.free_map.used();
            fs.close().unwrap();
            used
        };

        let fs = Filesys::new(disk, CACHE_SLOTS, false).unwrap();
        assert_eq!(fs.free_map.used(), used);
        let OpenNode::File(ip) = fs.open_path(ROOT, b"/keep").unwrap() else {
            panic!("expected a file");
        };
        assert_eq!(ip.length(&fs), 3 * SECTOR_SIZE);
        fs.close_inode(ip);
        fs.close().unwrap();
    }
}
