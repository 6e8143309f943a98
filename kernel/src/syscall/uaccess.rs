//! User memory access.
//!
//! Syscalls never dereference user pointers directly. A buffer argument
//! is validated page by page: resident pages get their frame pinned,
//! lazy pages are faulted in pinned, and addresses that smell like stack
//! growth get a fresh stack page. Only then does the kernel copy bytes,
//! and the pins guarantee the clock sweep cannot steal a page mid-copy.
//! Everything is unpinned when the [`PinnedBuffer`] drops.
//!
//! [`user_load`] and [`user_store`] play the MMU for code running "in
//! user mode": they walk the page directory, fault on misses, and set
//! the accessed/dirty bits a real MMU would set.

use std::sync::Arc;

use memchr::memchr;

use crate::{
    error::KernelError,
    param::{PAGE_SIZE, STACK_LIMIT, STACK_SLOP, USER_CEILING},
    proc::{Process, pagedir::PteFlags},
    system::System,
    vm::{VirtPage, page::{self, PageState}},
};

/// Does a miss at `addr` look like the stack growing?
///
/// Anything within [`STACK_SLOP`] bytes below the saved stack pointer,
/// or above it, counts, as long as the total stack stays within
/// [`STACK_LIMIT`] of the ceiling.
fn stack_heuristic(proc: &Process, addr: usize) -> bool {
    addr < USER_CEILING
        && addr >= USER_CEILING - STACK_LIMIT
        && addr + STACK_SLOP >= proc.user_sp()
}

/// A user buffer whose pages are resident and pinned.
pub struct PinnedBuffer<'a> {
    sys: &'a System,
    proc: &'a Arc<Process>,
    addr: usize,
    len: usize,
    pages: Vec<(VirtPage, usize)>,
}

impl Drop for PinnedBuffer<'_> {
    fn drop(&mut self) {
        for &(upage, frame) in &self.pages {
            let _ = self.sys.frames.unpin(frame, self.proc, upage);
        }
    }
}

/// Validates `(addr, len)` for this process and pins every page in the
/// range, faulting lazy pages in and growing the stack where the
/// heuristic allows. With `write`, also checks write permission.
///
/// On failure everything pinned so far is unpinned; the caller is
/// expected to treat the error as a fatal fault for the process.
pub fn validate<'a>(
    sys: &'a System,
    proc: &'a Arc<Process>,
    addr: usize,
    len: usize,
    write: bool,
) -> Result<PinnedBuffer<'a>, KernelError> {
    if addr == 0 {
        return Err(KernelError::BadAddress);
    }
    let end = addr.checked_add(len).ok_or(KernelError::BadAddress)?;
    if end > USER_CEILING {
        return Err(KernelError::BadAddress);
    }

    let mut pinned = PinnedBuffer {
        sys,
        proc,
        addr,
        len,
        pages: Vec::new(),
    };
    let mut cursor = addr;
    while cursor < end {
        let upage = VirtPage::containing(cursor);
        let frame = loop {
            if let Some((frame, _)) = proc.pagedir().lookup(upage) {
                if sys.frames.pin(frame, proc, upage).is_ok() {
                    break frame;
                }
                // Lost the frame to an eviction between lookup and pin;
                // fall through and fault it back in.
            }
            if proc.pages().contains(upage) {
                break page::map(sys, proc, upage, true)?;
            }
            if stack_heuristic(proc, cursor) {
                proc.add_page_entry(upage, PageState::stack())?;
                break page::map(sys, proc, upage, true)?;
            }
            return Err(KernelError::BadAddress);
        };
        pinned.pages.push((upage, frame));

        if write {
            let (_, flags) = proc
                .pagedir()
                .lookup(upage)
                .expect("pinned page lost its mapping");
            if !flags.contains(PteFlags::WRITABLE) {
                return Err(KernelError::BadAddress);
            }
        }
        cursor = upage.add_pages(1).addr();
    }
    Ok(pinned)
}

impl PinnedBuffer<'_> {
    /// Copies `src` into the user buffer.
    pub fn copy_out(&self, src: &[u8]) {
        assert!(src.len() <= self.len);
        self.for_chunks(src.len(), |upage, frame, page_ofs, range| {
            self.sys
                .frames
                .with_owned_bytes(frame, self.proc, upage, |bytes| {
                    bytes[page_ofs..page_ofs + range.len()].copy_from_slice(&src[range]);
                })
                .expect("pinned frame was reassigned");
            self.proc.pagedir().mark_access(upage, true);
        });
    }

    /// Copies the user buffer into `dst`.
    pub fn copy_in(&self, dst: &mut [u8]) {
        let len = usize::min(dst.len(), self.len);
        self.for_chunks(len, |upage, frame, page_ofs, range| {
            self.sys
                .frames
                .with_owned_bytes(frame, self.proc, upage, |bytes| {
                    dst[range.clone()].copy_from_slice(&bytes[page_ofs..page_ofs + range.len()]);
                })
                .expect("pinned frame was reassigned");
            self.proc.pagedir().mark_access(upage, false);
        });
    }

    fn for_chunks(
        &self,
        len: usize,
        mut f: impl FnMut(VirtPage, usize, usize, std::ops::Range<usize>),
    ) {
        let mut done = 0;
        for &(upage, frame) in &self.pages {
            if done >= len {
                break;
            }
            let cur = self.addr + done;
            let page_ofs = cur - upage.addr();
            let chunk = usize::min(len - done, PAGE_SIZE - page_ofs);
            f(upage, frame, page_ofs, done..done + chunk);
            done += chunk;
        }
    }
}

/// Copies a NUL-terminated user string into the kernel, pinning each
/// page only while its bytes are scanned. Fails after `max` bytes
/// without a terminator.
pub fn copy_in_str(
    sys: &System,
    proc: &Arc<Process>,
    addr: usize,
    max: usize,
) -> Result<Vec<u8>, KernelError> {
    if addr == 0 {
        return Err(KernelError::BadAddress);
    }
    let mut out = Vec::new();
    let mut cursor = addr;
    loop {
        if cursor >= USER_CEILING {
            return Err(KernelError::BadAddress);
        }
        let page_end = VirtPage::containing(cursor).add_pages(1).addr();
        let span = usize::min(page_end, USER_CEILING) - cursor;
        let pinned = validate(sys, proc, cursor, span, false)?;
        let mut chunk = vec![0u8; span];
        pinned.copy_in(&mut chunk);
        drop(pinned);

        match memchr(0, &chunk) {
            Some(i) => {
                out.extend_from_slice(&chunk[..i]);
                return Ok(out);
            }
            None => {
                out.extend_from_slice(&chunk);
                if out.len() > max {
                    return Err(KernelError::BadAddress);
                }
                cursor = page_end;
            }
        }
    }
}

/// The page-fault entry: a fault at `addr` either materializes a known
/// page, grows the stack, or is fatal for the process.
pub fn handle_fault(
    sys: &System,
    proc: &Arc<Process>,
    addr: usize,
    write: bool,
) -> Result<(), KernelError> {
    if addr == 0 || addr >= USER_CEILING {
        return Err(KernelError::BadAddress);
    }
    let upage = VirtPage::containing(addr);
    if let Some(entry) = proc.pages().get(upage) {
        let (_, _, writable) = entry.snapshot();
        if write && !writable {
            return Err(KernelError::BadAddress);
        }
        page::map(sys, proc, upage, false)?;
        // The access that faulted completes next; it would leave the
        // accessed bit set, which buys the page one clock revolution.
        proc.pagedir().mark_access(upage, write);
        return Ok(());
    }
    if stack_heuristic(proc, addr) {
        proc.add_page_entry(upage, PageState::stack())?;
        page::map(sys, proc, upage, false)?;
        proc.pagedir().mark_access(upage, write);
        return Ok(());
    }
    Err(KernelError::BadAddress)
}

/// A user-mode store: walks the page directory, faulting as the MMU
/// would, and sets the accessed and dirty bits.
pub fn user_store(
    sys: &System,
    proc: &Arc<Process>,
    addr: usize,
    bytes: &[u8],
) -> Result<(), KernelError> {
    access(sys, proc, addr, bytes.len(), true, |frame_bytes, page_ofs, range| {
        frame_bytes[page_ofs..page_ofs + range.len()].copy_from_slice(&bytes[range]);
    })
}

/// A user-mode load.
pub fn user_load(
    sys: &System,
    proc: &Arc<Process>,
    addr: usize,
    bytes: &mut [u8],
) -> Result<(), KernelError> {
    access(sys, proc, addr, bytes.len(), false, |frame_bytes, page_ofs, range| {
        bytes[range.clone()].copy_from_slice(&frame_bytes[page_ofs..page_ofs + range.len()]);
    })
}

fn access(
    sys: &System,
    proc: &Arc<Process>,
    addr: usize,
    len: usize,
    write: bool,
    mut f: impl FnMut(&mut [u8; PAGE_SIZE], usize, std::ops::Range<usize>),
) -> Result<(), KernelError> {
    if addr == 0 || addr.checked_add(len).is_none_or(|end| end > USER_CEILING) {
        return Err(KernelError::BadAddress);
    }
    let mut done = 0;
    while done < len {
        let cur = addr + done;
        let upage = VirtPage::containing(cur);
        let page_ofs = cur - upage.addr();
        let chunk = usize::min(len - done, PAGE_SIZE - page_ofs);
        loop {
            if let Some((frame, flags)) = proc.pagedir().lookup(upage) {
                if write && !flags.contains(PteFlags::WRITABLE) {
                    return Err(KernelError::BadAddress);
                }
                let copied = sys
                    .frames
                    .with_owned_bytes(frame, proc, upage, |frame_bytes| {
                        f(frame_bytes, page_ofs, done..done + chunk);
                    });
                if copied.is_ok() {
                    proc.pagedir().mark_access(upage, write);
                    break;
                }
                // Raced an eviction; fault the page back in.
            }
            handle_fault(sys, proc, cur, write)?;
        }
        done += chunk;
    }
    Ok(())
}
