//! Free-sector allocator.
//!
//! One bit per device sector. The map itself is persisted as an ordinary
//! file whose inode lives at [`Sector::FREE_MAP`]; it is loaded at boot
//! and written back at shutdown.

use std::sync::Mutex;

use bitmap::Bitmap;
use opin_fs_types::Sector;

pub struct FreeMap {
    map: Mutex<Bitmap>,
}

impl FreeMap {
    #[must_use]
    pub fn new(sectors: usize) -> Self {
        Self {
            map: Mutex::new(Bitmap::new(sectors)),
        }
    }

    /// Claims the lowest free sector, or `None` if the device is full.
    pub fn allocate(&self) -> Option<Sector> {
        let i = self.map.lock().unwrap().scan_and_flip()?;
        Some(Sector::new(u32::try_from(i).unwrap()))
    }

    /// Returns a sector to the pool.
    ///
    /// # Panics
    ///
    /// Panics on double free.
    pub fn release(&self, sector: Sector) {
        let mut map = self.map.lock().unwrap();
        assert!(map.test(sector.index()), "freeing free sector {sector}");
        map.clear(sector.index());
    }

    /// Marks a well-known sector (free-map inode, root directory) as used
    /// during formatting.
    pub fn mark(&self, sector: Sector) {
        let mut map = self.map.lock().unwrap();
        assert!(!map.test(sector.index()));
        map.set(sector.index());
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.map.lock().unwrap().count_set()
    }

    /// Size of the on-disk representation, in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.map.lock().unwrap().as_bytes().len()
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.map.lock().unwrap().as_bytes().to_vec()
    }

    /// Replaces the in-memory map with the persisted representation.
    pub fn load_bytes(&self, bytes: &[u8]) {
        let mut map = self.map.lock().unwrap();
        *map = Bitmap::from_bytes(map.len(), bytes);
    }
}
