//! The raw block device, simulated in memory.

use std::{convert::Infallible, sync::Mutex};

use block_cache::BlockDevice;
use opin_fs_types::SECTOR_SIZE;

/// Which device a subsystem is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskRole {
    FileSys,
    Swap,
}

/// A flat array of 512-byte sectors with blocking read/write.
///
/// Stands in for the hardware disk; all sectors start zeroed.
pub struct VirtualDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl VirtualDisk {
    #[must_use]
    pub fn new(sectors: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sectors]),
        }
    }

    /// Device size in sectors.
    #[must_use]
    pub fn size(&self) -> usize {
        self.sectors.lock().unwrap().len()
    }
}

impl BlockDevice<SECTOR_SIZE> for VirtualDisk {
    type Error = Infallible;

    fn read(&self, index: usize, data: &mut [u8; SECTOR_SIZE]) -> Result<(), Infallible> {
        data.copy_from_slice(&self.sectors.lock().unwrap()[index]);
        Ok(())
    }

    fn write(&self, index: usize, data: &[u8; SECTOR_SIZE]) -> Result<(), Infallible> {
        self.sectors.lock().unwrap()[index].copy_from_slice(data);
        Ok(())
    }
}
