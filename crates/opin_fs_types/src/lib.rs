//! Data types for the opin file system.
//!
//! The on-disk layout:
//!
//! | sector          | content                  | type                  |
//! |-----------------|--------------------------|-----------------------|
//! | 0               | free-map file inode      | [`DiskInode`]         |
//! | 1               | root directory inode     | [`DiskInode`]         |
//! | everything else | inodes, metadata, data   | allocated on demand   |
//!
//! Every inode occupies exactly one sector. File content is addressed
//! through 12 direct slots, one indirect sector (128 further slots), and
//! one doubly-indirect sector (128 indirect sectors). A slot holding 0
//! means "unallocated": sector 0 is always occupied by the free-map inode,
//! so 0 can never name file data.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use dataview::Pod;

/// Fixed unit of device I/O, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector slots directly referenced by an inode.
pub const DIRECT_SLOTS: usize = 12;

/// Sector slots held by one indirect sector.
pub const SLOTS_PER_INDIRECT: usize = SECTOR_SIZE / size_of::<u32>();

/// Largest file, in sectors: direct + indirect + doubly indirect.
pub const MAX_FILE_SECTORS: usize =
    DIRECT_SLOTS + SLOTS_PER_INDIRECT + SLOTS_PER_INDIRECT * SLOTS_PER_INDIRECT;

/// Largest file, in bytes (a little over 8 MiB).
pub const MAX_FILE_BYTES: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Longest directory entry name, in bytes.
pub const NAME_MAX: usize = 14;

/// Byte offset of direct slot `k` inside an inode sector.
#[must_use]
pub const fn direct_slot_offset(k: usize) -> usize {
    assert!(k < DIRECT_SLOTS);
    k * size_of::<u32>()
}

/// Byte offset of the indirect slot inside an inode sector.
pub const INDIRECT_SLOT_OFFSET: usize = DIRECT_SLOTS * size_of::<u32>();

/// Byte offset of the doubly-indirect slot inside an inode sector.
pub const DOUBLY_SLOT_OFFSET: usize = INDIRECT_SLOT_OFFSET + size_of::<u32>();

/// Byte offset of the file length inside an inode sector.
pub const LENGTH_OFFSET: usize = DOUBLY_SLOT_OFFSET + size_of::<u32>();

/// Byte offset of the magic word inside an inode sector.
pub const MAGIC_OFFSET: usize = LENGTH_OFFSET + size_of::<u32>();

/// Byte offset of slot `i` inside an indirect (or doubly-indirect) sector.
#[must_use]
pub const fn indirect_slot_offset(i: usize) -> usize {
    assert!(i < SLOTS_PER_INDIRECT);
    i * size_of::<u32>()
}

/// A device sector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct Sector(u32);

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sector {
    /// The free-map file's inode.
    pub const FREE_MAP: Self = Self::new(0);
    /// The root directory's inode.
    pub const ROOT_DIR: Self = Self::new(1);

    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// On-disk inode. Exactly one sector.
#[derive(Pod)]
#[repr(C)]
pub struct DiskInode {
    /// Direct data sector slots; 0 is a hole.
    pub direct: [u32; DIRECT_SLOTS],
    /// Indirect sector slot; 0 if absent.
    pub indirect: u32,
    /// Doubly-indirect sector slot; 0 if absent.
    pub doubly_indirect: u32,
    /// File length in bytes.
    pub length: u32,
    /// Must be [`INODE_MAGIC`].
    pub magic: u32,
    pub unused: [u32; 112],
}
const _: () = assert!(size_of::<DiskInode>() == SECTOR_SIZE);

/// A sector full of sector slots, the body of an indirect or
/// doubly-indirect block.
#[derive(Pod)]
#[repr(transparent)]
pub struct IndirectBlock([u32; SLOTS_PER_INDIRECT]);
const _: () = assert!(size_of::<IndirectBlock>() == SECTOR_SIZE);

impl IndirectBlock {
    #[must_use]
    pub fn get(&self, i: usize) -> Option<Sector> {
        if self.0[i] == 0 {
            None
        } else {
            Some(Sector::new(self.0[i]))
        }
    }

    pub fn set(&mut self, i: usize, sector: Option<Sector>) {
        self.0[i] = sector.map_or(0, |s| s.value());
    }

    /// Iterates the allocated slots.
    pub fn slots(&self) -> impl Iterator<Item = Sector> + '_ {
        self.0.iter().filter(|&&s| s != 0).map(|&s| Sector::new(s))
    }
}

/// On-disk directory entry.
#[derive(Clone, Pod)]
#[repr(C)]
pub struct DirEntry {
    in_use: u32,
    sector: u32,
    is_dir: u32,
    name: [u8; NAME_MAX + 1],
    _pad: [u8; 1],
}
const _: () = assert!(size_of::<DirEntry>() == 28);

/// Size of one directory entry on disk.
pub const DIR_ENTRY_SIZE: usize = size_of::<DirEntry>();

impl DirEntry {
    /// Builds a live entry. `name` must be 1..=[`NAME_MAX`] bytes with no
    /// NUL or `/`.
    #[must_use]
    pub fn new(name: &[u8], sector: Sector, is_dir: bool) -> Self {
        assert!(!name.is_empty() && name.len() <= NAME_MAX);
        let mut bytes = [0; NAME_MAX + 1];
        bytes[..name.len()].copy_from_slice(name);
        Self {
            in_use: 1,
            sector: sector.value(),
            is_dir: u32::from(is_dir),
            name: bytes,
            _pad: [0],
        }
    }

    #[must_use]
    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    pub fn clear(&mut self) {
        self.in_use = 0;
    }

    #[must_use]
    pub fn sector(&self) -> Sector {
        Sector::new(self.sector)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    /// The stored name, NUL padding stripped.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }

    #[must_use]
    pub fn is_same_name(&self, name: &[u8]) -> bool {
        self.in_use() && self.name() == name
    }
}
