//! Physical frame table.
//!
//! A fixed array of user-memory frames, each owning its 4 KiB payload
//! behind a per-frame lock that also guards ownership and the pin flag.
//! Allocation takes from a free list; when that runs dry, a clock hand
//! sweeps the table looking for a victim to evict.
//!
//! The sweep only ever try-locks: a frame whose lock is held, whose pin
//! flag is set, or whose owner is mid-exit is simply skipped. Frames
//! whose hardware accessed bit is set get a second chance (the bit is
//! cleared and the hand moves on). After two full revolutions without a
//! victim the allocation fails rather than spinning forever.

use std::sync::{Arc, Mutex, Weak};

use crate::{
    error::KernelError,
    param::{CLOCK_SWEEPS, PAGE_SIZE},
    proc::Process,
    system::System,
};

use super::VirtPage;

pub struct FrameTable {
    frames: Vec<Frame>,
    alloc: Mutex<FrameAlloc>,
}

struct FrameAlloc {
    free: Vec<usize>,
    hand: usize,
}

struct Frame {
    state: Mutex<FrameState>,
}

pub struct FrameState {
    owner: Option<FrameOwner>,
    pinned: bool,
    bytes: Box<[u8; PAGE_SIZE]>,
}

#[derive(Clone)]
struct FrameOwner {
    process: Weak<Process>,
    upage: VirtPage,
}

impl FrameState {
    pub fn bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.bytes
    }

    fn owned_by(&self, process: &Arc<Process>, upage: VirtPage) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|fo| fo.process.as_ptr() == Arc::as_ptr(process) && fo.upage == upage)
    }

    fn claim(&mut self, process: &Arc<Process>, upage: VirtPage, pinned: bool) {
        self.owner = Some(FrameOwner {
            process: Arc::downgrade(process),
            upage,
        });
        self.pinned = pinned;
    }
}

impl FrameTable {
    /// Builds a table of half of `phys_pages`, capped at `limit`.
    #[must_use]
    pub fn new(phys_pages: usize, limit: usize) -> Self {
        let count = usize::max(usize::min(phys_pages / 2, limit), 1);
        Self {
            frames: (0..count)
                .map(|_| Frame {
                    state: Mutex::new(FrameState {
                        owner: None,
                        pinned: false,
                        bytes: Box::new([0; PAGE_SIZE]),
                    }),
                })
                .collect(),
            alloc: Mutex::new(FrameAlloc {
                free: (0..count).rev().collect(),
                hand: 0,
            }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.alloc.lock().unwrap().free.len()
    }

    /// Hands out a frame owned by (`owner`, `upage`), evicting a victim
    /// if the free list is empty. The caller fills the payload.
    pub fn acquire(
        &self,
        sys: &System,
        owner: &Arc<Process>,
        upage: VirtPage,
        pinned: bool,
    ) -> Result<usize, KernelError> {
        let free = self.alloc.lock().unwrap().free.pop();
        if let Some(i) = free {
            self.frames[i].state.lock().unwrap().claim(owner, upage, pinned);
            return Ok(i);
        }
        self.evict_and_claim(sys, owner, upage, pinned)
    }

    fn evict_and_claim(
        &self,
        sys: &System,
        owner: &Arc<Process>,
        upage: VirtPage,
        pinned: bool,
    ) -> Result<usize, KernelError> {
        let count = self.frames.len();
        let mut alloc = self.alloc.lock().unwrap();
        for _ in 0..CLOCK_SWEEPS * count {
            let i = alloc.hand;
            alloc.hand = (alloc.hand + 1) % count;

            let Ok(mut st) = self.frames[i].state.try_lock() else {
                continue;
            };
            if st.pinned {
                continue;
            }
            let Some(fo) = st.owner.clone() else {
                // Not on the free list yet owned by nobody; take it.
                st.claim(owner, upage, pinned);
                return Ok(i);
            };
            let Some(victim) = fo.process.upgrade() else {
                st.claim(owner, upage, pinned);
                return Ok(i);
            };
            if victim.pagedir().test_and_clear_accessed(fo.upage) {
                // Second chance.
                continue;
            }
            let Some(_exit) = victim.exit_lock_try() else {
                continue;
            };

            // Eviction I/O happens with the allocator lock released so
            // other acquisitions can scan meanwhile.
            drop(alloc);
            match victim.evict_page(sys, fo.upage, i, &mut st) {
                Ok(()) => {
                    st.claim(owner, upage, pinned);
                    return Ok(i);
                }
                Err(_) => {
                    // Entry busy or swap full; pass this frame over.
                    drop(st);
                    alloc = self.alloc.lock().unwrap();
                }
            }
        }
        Err(KernelError::OutOfFrames)
    }

    /// Sets the pin flag, first checking the frame still belongs to the
    /// caller's page.
    pub fn pin(
        &self,
        i: usize,
        owner: &Arc<Process>,
        upage: VirtPage,
    ) -> Result<(), KernelError> {
        let mut st = self.frames[i].state.lock().unwrap();
        if !st.owned_by(owner, upage) {
            return Err(KernelError::BadAddress);
        }
        st.pinned = true;
        Ok(())
    }

    pub fn unpin(
        &self,
        i: usize,
        owner: &Arc<Process>,
        upage: VirtPage,
    ) -> Result<(), KernelError> {
        let mut st = self.frames[i].state.lock().unwrap();
        if !st.owned_by(owner, upage) {
            return Err(KernelError::BadAddress);
        }
        st.pinned = false;
        Ok(())
    }

    /// Returns a frame to the free list.
    pub fn release(&self, i: usize) {
        {
            let mut st = self.frames[i].state.lock().unwrap();
            st.owner = None;
            st.pinned = false;
        }
        self.alloc.lock().unwrap().free.push(i);
    }

    /// Runs `f` over the frame's payload under the frame lock.
    pub fn with_bytes<R>(&self, i: usize, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        f(&mut self.frames[i].state.lock().unwrap().bytes)
    }

    /// Like [`FrameTable::with_bytes`], but refuses if the frame has been
    /// reassigned away from (`owner`, `upage`) — the caller raced an
    /// eviction and must fault the page back in.
    pub fn with_owned_bytes<R>(
        &self,
        i: usize,
        owner: &Arc<Process>,
        upage: VirtPage,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> Result<R, KernelError> {
        let mut st = self.frames[i].state.lock().unwrap();
        if !st.owned_by(owner, upage) {
            return Err(KernelError::Busy);
        }
        Ok(f(&mut st.bytes))
    }
}
