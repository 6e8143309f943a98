//! Simulated hardware page directory.
//!
//! Holds the translations the MMU would consult: user page -> physical
//! frame plus the writable, accessed, and dirty bits. The accessed and
//! dirty bits are set by the user-memory access paths the way the
//! hardware would set them on a real load or store, and inspected by the
//! clock sweep and the eviction policy.
//!
//! Every method takes and releases the internal lock by itself; no lock
//! is ever held while calling out, so the page directory can be touched
//! from any locking context.

use std::{collections::HashMap, sync::Mutex};

use bitflags::bitflags;

use crate::vm::VirtPage;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY = 1 << 2;
    }
}

struct Pte {
    frame: usize,
    flags: PteFlags,
}

pub struct PageDir {
    entries: Mutex<HashMap<VirtPage, Pte>>,
}

impl PageDir {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Installs a translation. A fresh mapping starts with accessed and
    /// dirty clear.
    pub fn map(&self, upage: VirtPage, frame: usize, writable: bool) {
        let flags = if writable {
            PteFlags::WRITABLE
        } else {
            PteFlags::empty()
        };
        self.entries
            .lock()
            .unwrap()
            .insert(upage, Pte { frame, flags });
    }

    /// Removes the translation; returns whether it existed and whether
    /// it was dirty.
    pub fn clear(&self, upage: VirtPage) -> (bool, bool) {
        match self.entries.lock().unwrap().remove(&upage) {
            Some(pte) => (true, pte.flags.contains(PteFlags::DIRTY)),
            None => (false, false),
        }
    }

    pub fn lookup(&self, upage: VirtPage) -> Option<(usize, PteFlags)> {
        let entries = self.entries.lock().unwrap();
        let pte = entries.get(&upage)?;
        Some((pte.frame, pte.flags))
    }

    /// Reads and clears the accessed bit, the clock sweep's second
    /// chance. An unmapped page reports not-accessed.
    pub fn test_and_clear_accessed(&self, upage: VirtPage) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(pte) = entries.get_mut(&upage) else {
            return false;
        };
        let was = pte.flags.contains(PteFlags::ACCESSED);
        pte.flags.remove(PteFlags::ACCESSED);
        was
    }

    /// What the MMU does on a user load or store.
    pub fn mark_access(&self, upage: VirtPage, write: bool) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(pte) = entries.get_mut(&upage) {
            pte.flags.insert(PteFlags::ACCESSED);
            if write {
                pte.flags.insert(PteFlags::DIRTY);
            }
        }
    }
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: VirtPage = VirtPage::new(0x8000_0000);

    #[test]
    fn test_map_lookup_clear() {
        let pd = PageDir::new();
        assert!(pd.lookup(P).is_none());

        pd.map(P, 3, true);
        let (frame, flags) = pd.lookup(P).unwrap();
        assert_eq!(frame, 3);
        assert!(flags.contains(PteFlags::WRITABLE));
        assert!(!flags.contains(PteFlags::ACCESSED));

        assert_eq!(pd.clear(P), (true, false));
        assert_eq!(pd.clear(P), (false, false));
    }

    #[test]
    fn test_accessed_and_dirty_bits() {
        let pd = PageDir::new();
        pd.map(P, 0, true);

        pd.mark_access(P, false);
        assert!(pd.test_and_clear_accessed(P));
        assert!(!pd.test_and_clear_accessed(P));

        pd.mark_access(P, true);
        assert_eq!(pd.clear(P), (true, true));
    }
}
