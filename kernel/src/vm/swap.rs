//! Swap device.
//!
//! The swap disk is divided into page-sized slots of 8 consecutive
//! sectors, managed by a bitmap and nothing else. Swap I/O goes straight
//! to the device; evicted pages have no business in the block cache.

use std::sync::{Arc, Mutex};

use bitmap::Bitmap;
use block_cache::BlockDevice as _;
use opin_fs_types::SECTOR_SIZE;

use crate::{
    device::VirtualDisk,
    error::KernelError,
    param::{PAGE_SIZE, SECTORS_PER_PAGE},
};

pub struct SwapTable {
    disk: Arc<VirtualDisk>,
    slots: Mutex<Bitmap>,
}

impl SwapTable {
    #[must_use]
    pub fn new(disk: Arc<VirtualDisk>) -> Self {
        let slots = disk.size() / SECTORS_PER_PAGE;
        Self {
            disk,
            slots: Mutex::new(Bitmap::new(slots)),
        }
    }

    /// Writes a page into a free slot and returns the slot index.
    pub fn write_page(&self, page: &[u8; PAGE_SIZE]) -> Result<usize, KernelError> {
        let slot = self
            .slots
            .lock()
            .unwrap()
            .scan_and_flip()
            .ok_or(KernelError::OutOfSwap)?;
        for i in 0..SECTORS_PER_PAGE {
            let sector: &[u8; SECTOR_SIZE] =
                page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].try_into().unwrap();
            let Ok(()) = self.disk.write(slot * SECTORS_PER_PAGE + i, sector);
        }
        Ok(slot)
    }

    /// Reads a slot back into `page` and frees it.
    pub fn read_page(&self, slot: usize, page: &mut [u8; PAGE_SIZE]) {
        for i in 0..SECTORS_PER_PAGE {
            let sector: &mut [u8; SECTOR_SIZE] = (&mut page
                [i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
                .try_into()
                .unwrap();
            let Ok(()) = self.disk.read(slot * SECTORS_PER_PAGE + i, sector);
        }
        self.free(slot);
    }

    /// Releases a slot without reading it.
    ///
    /// # Panics
    ///
    /// Panics on double free.
    pub fn free(&self, slot: usize) {
        let mut slots = self.slots.lock().unwrap();
        assert!(slots.test(slot), "freeing free swap slot {slot}");
        slots.clear(slot);
    }

    /// Slots currently holding pages.
    #[must_use]
    pub fn used_slots(&self) -> usize {
        self.slots.lock().unwrap().count_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pages: usize) -> SwapTable {
        SwapTable::new(Arc::new(VirtualDisk::new(pages * SECTORS_PER_PAGE)))
    }

    #[test]
    fn test_swap_round_trip() {
        let swap = table(4);
        let mut page = [0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let slot = swap.write_page(&page).unwrap();
        assert_eq!(swap.used_slots(), 1);

        let mut back = [0u8; PAGE_SIZE];
        swap.read_page(slot, &mut back);
        assert_eq!(page, back);
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    fn test_swap_exhaustion_and_reuse() {
        let swap = table(2);
        let page = [7u8; PAGE_SIZE];
        let a = swap.write_page(&page).unwrap();
        let _b = swap.write_page(&page).unwrap();
        assert_eq!(swap.write_page(&page), Err(KernelError::OutOfSwap));

        swap.free(a);
        assert_eq!(swap.write_page(&page).unwrap(), a);
    }

    #[test]
    #[should_panic(expected = "freeing free swap slot")]
    fn test_swap_double_free_is_fatal() {
        let swap = table(2);
        let slot = swap.write_page(&[0u8; PAGE_SIZE]).unwrap();
        swap.free(slot);
        swap.free(slot);
    }
}
