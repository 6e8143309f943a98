//! Supplemental page tables.
//!
//! Each process keeps a map from user page to a [`PageEntry`] describing
//! where that page's contents live right now (nowhere, a physical frame,
//! or a swap slot) and where they originally come from (zeros, an
//! executable image, a memory-mapped file). The hardware page table only
//! ever holds translations for resident pages; everything else faults
//! and is materialized here.
//!
//! The table lock covers insert/lookup/remove only. Each entry has its
//! own lock ordering the map / evict / unmap transitions; eviction (which
//! arrives from another thread via the frame table) only ever try-locks
//! an entry and walks away if it is busy.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    error::KernelError,
    fs::inode::Inode,
    param::PAGE_SIZE,
    proc::Process,
    system::System,
    vm::frame::FrameState,
};

use super::VirtPage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Stack,
    Exec,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLoc {
    /// Contents not materialized; fill from the backing source.
    Unmapped,
    /// Resident in this physical frame.
    Resident(usize),
    /// Evicted to this swap slot.
    Swapped(usize),
}

/// Where a lazy page's bytes come from.
pub struct FileBacking {
    pub inode: Arc<Inode>,
    /// Byte offset of this page in the file.
    pub offset: usize,
    /// Valid bytes at that offset; the rest of the page is zero-filled.
    pub len: usize,
}

pub struct PageState {
    pub kind: PageKind,
    pub loc: PageLoc,
    pub writable: bool,
    pub backing: Option<FileBacking>,
    /// An evicted copy has been written to swap at least once; a clean
    /// writable exec page that has been there goes back to swap, not to
    /// the image file.
    pub swapped_once: bool,
}

impl PageState {
    /// A zero-filled, writable stack page.
    #[must_use]
    pub fn stack() -> Self {
        Self {
            kind: PageKind::Stack,
            loc: PageLoc::Unmapped,
            writable: true,
            backing: None,
            swapped_once: false,
        }
    }

    /// One page of an executable image.
    #[must_use]
    pub fn exec(backing: FileBacking, writable: bool) -> Self {
        Self {
            kind: PageKind::Exec,
            loc: PageLoc::Unmapped,
            writable,
            backing: Some(backing),
            swapped_once: false,
        }
    }

    /// One page of a memory-mapped file.
    #[must_use]
    pub fn file(backing: FileBacking, writable: bool) -> Self {
        Self {
            kind: PageKind::File,
            loc: PageLoc::Unmapped,
            writable,
            backing: Some(backing),
            swapped_once: false,
        }
    }
}

pub struct PageEntry {
    state: Mutex<PageState>,
}

impl PageEntry {
    /// Snapshot of (kind, loc, writable) for diagnostics and tests.
    pub fn snapshot(&self) -> (PageKind, PageLoc, bool) {
        let st = self.state.lock().unwrap();
        (st.kind, st.loc, st.writable)
    }
}

/// Per-process map: user page -> entry.
pub struct SupPageTable {
    entries: Mutex<HashMap<VirtPage, Arc<PageEntry>>>,
}

impl SupPageTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Installs a lazy entry. Refuses to overwrite.
    pub fn insert(&self, upage: VirtPage, state: PageState) -> Result<(), KernelError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&upage) {
            return Err(KernelError::MapOverlap);
        }
        entries.insert(
            upage,
            Arc::new(PageEntry {
                state: Mutex::new(state),
            }),
        );
        Ok(())
    }

    pub fn get(&self, upage: VirtPage) -> Option<Arc<PageEntry>> {
        self.entries.lock().unwrap().get(&upage).cloned()
    }

    pub fn take(&self, upage: VirtPage) -> Option<Arc<PageEntry>> {
        self.entries.lock().unwrap().remove(&upage)
    }

    #[must_use]
    pub fn contains(&self, upage: VirtPage) -> bool {
        self.entries.lock().unwrap().contains_key(&upage)
    }

    /// All mapped pages, lowest first.
    #[must_use]
    pub fn pages(&self) -> Vec<VirtPage> {
        let mut pages: Vec<_> = self.entries.lock().unwrap().keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Default for SupPageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Materializes `upage` of `proc`: obtains a frame (evicting if
/// needed), fills it from the entry's source, installs the hardware
/// mapping, and records residency. With `pinned` the frame stays pinned
/// for the caller.
pub fn map(
    sys: &System,
    proc: &Arc<Process>,
    upage: VirtPage,
    pinned: bool,
) -> Result<usize, KernelError> {
    let entry = proc.pages().get(upage).ok_or(KernelError::BadAddress)?;
    let mut st = entry.state.lock().unwrap();

    if let PageLoc::Resident(frame) = st.loc {
        if pinned {
            sys.frames.pin(frame, proc, upage)?;
        }
        return Ok(frame);
    }

    // Keep the frame pinned while it is filled so the clock cannot
    // steal it before the mapping is installed.
    let frame = sys.frames.acquire(sys, proc, upage, true)?;
    match st.loc {
        PageLoc::Swapped(slot) => {
            sys.frames.with_bytes(frame, |bytes| sys.swap.read_page(slot, bytes));
        }
        PageLoc::Unmapped => match &st.backing {
            Some(b) => sys.frames.with_bytes(frame, |bytes| {
                let n = b.inode.read_at(&sys.fs, &mut bytes[..b.len], b.offset);
                bytes[n..].fill(0);
            }),
            None => sys.frames.with_bytes(frame, |bytes| bytes.fill(0)),
        },
        PageLoc::Resident(_) => unreachable!(),
    }
    st.loc = PageLoc::Resident(frame);
    proc.pagedir().map(upage, frame, st.writable);
    if !pinned {
        sys.frames.unpin(frame, proc, upage)?;
    }
    Ok(frame)
}

impl Process {
    /// Installs a lazy entry describing a future page of this process.
    pub fn add_page_entry(&self, upage: VirtPage, state: PageState) -> Result<(), KernelError> {
        self.pages().insert(upage, state)
    }

    /// Evicts `upage` out of `frame`, called by the frame table's clock
    /// sweep with the frame lock and this process's exit lock held.
    ///
    /// The hardware mapping is cleared first so the owner traps on its
    /// next access, then the contents go wherever the page's kind sends
    /// them: stacks to swap, dirty (or previously swapped) writable exec
    /// pages to swap, dirty writable file pages back to their file, and
    /// everything else nowhere at all.
    ///
    /// Returns `Busy` without evicting if the entry is mid-transition.
    pub(crate) fn evict_page(
        &self,
        sys: &System,
        upage: VirtPage,
        frame_idx: usize,
        frame: &mut FrameState,
    ) -> Result<(), KernelError> {
        let entry = self.pages().get(upage).ok_or(KernelError::Busy)?;
        let Ok(mut st) = entry.state.try_lock() else {
            return Err(KernelError::Busy);
        };
        if st.loc != PageLoc::Resident(frame_idx) {
            return Err(KernelError::Busy);
        }

        let (_present, dirty) = self.pagedir().clear(upage);
        let to_swap = match st.kind {
            PageKind::Stack => true,
            PageKind::Exec => st.writable && (dirty || st.swapped_once),
            PageKind::File => false,
        };

        if to_swap {
            match sys.swap.write_page(frame.bytes()) {
                Ok(slot) => {
                    st.loc = PageLoc::Swapped(slot);
                    st.swapped_once = true;
                }
                Err(e) => {
                    self.pagedir().map(upage, frame_idx, st.writable);
                    return Err(e);
                }
            }
        } else {
            if st.kind == PageKind::File && st.writable && dirty {
                let b = st.backing.as_ref().unwrap();
                if let Err(e) = b.inode.write_at(&sys.fs, &frame.bytes()[..b.len], b.offset) {
                    self.pagedir().map(upage, frame_idx, st.writable);
                    return Err(e);
                }
            }
            st.loc = PageLoc::Unmapped;
        }
        Ok(())
    }

    /// Tears a page down: clears the mapping, writes a dirty writable
    /// file page back to its file (pulling the bytes from swap if that
    /// is where the dirty copy went), frees any swap slot and frame, and
    /// removes the entry.
    pub fn unmap_page(&self, sys: &System, upage: VirtPage) {
        let Some(entry) = self.pages().take(upage) else {
            return;
        };
        let mut st = entry.state.lock().unwrap();
        let (_present, dirty) = self.pagedir().clear(upage);

        match st.loc {
            PageLoc::Resident(frame) => {
                if st.kind == PageKind::File && st.writable && dirty {
                    let b = st.backing.as_ref().unwrap();
                    let _ = sys.frames.with_bytes(frame, |bytes| {
                        b.inode.write_at(&sys.fs, &bytes[..b.len], b.offset)
                    });
                }
                sys.frames.release(frame);
            }
            PageLoc::Swapped(slot) => {
                if st.kind == PageKind::File && st.writable {
                    let mut page = Box::new([0u8; PAGE_SIZE]);
                    sys.swap.read_page(slot, &mut page);
                    let b = st.backing.as_ref().unwrap();
                    let _ = b.inode.write_at(&sys.fs, &page[..b.len], b.offset);
                } else {
                    sys.swap.free(slot);
                }
            }
            PageLoc::Unmapped => {}
        }
        st.loc = PageLoc::Unmapped;
    }
}
