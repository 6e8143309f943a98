//! Processes.
//!
//! A process here is the storage/VM view of one: a simulated page
//! directory, a supplemental page table, a file descriptor table, a
//! working directory, the saved user stack pointer, and the mmap region
//! bookkeeping. There is no user code running inside it; syscalls are
//! issued on its behalf by whatever thread drives it.

pub mod pagedir;

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard, atomic::{AtomicUsize, Ordering}},
};

use opin_fs_types::Sector;

use crate::{
    error::KernelError,
    fs::{directory::Dir, inode::Inode},
    param::{NOFILE, USER_CEILING},
    system::System,
    vm::VirtPage,
};

use self::pagedir::PageDir;
use crate::vm::page::SupPageTable;

pub type Pid = u32;

/// Per-fd state. File and directory descriptors carry different state;
/// syscall handlers match on the variant.
pub enum Handle {
    File(FileHandle),
    Dir(DirHandle),
}

pub struct FileHandle {
    pub inode: Arc<Inode>,
    pub pos: usize,
}

pub struct DirHandle {
    pub dir: Dir,
}

pub struct FdTable {
    slots: Vec<Option<Handle>>,
}

impl FdTable {
    fn new() -> Self {
        Self {
            slots: (0..NOFILE).map(|_| None).collect(),
        }
    }

    /// Reserves the lowest free descriptor. 0 and 1 belong to the
    /// console and are never handed out. On a full table the handle is
    /// returned so the caller can close it.
    pub fn alloc(&mut self, handle: Handle) -> Result<usize, Handle> {
        let Some(fd) = (2..NOFILE).find(|&fd| self.slots[fd].is_none()) else {
            return Err(handle);
        };
        self.slots[fd] = Some(handle);
        Ok(fd)
    }

    pub fn get_mut(&mut self, fd: usize) -> Result<&mut Handle, KernelError> {
        self.slots
            .get_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(KernelError::BadFileDescriptor)
    }

    pub fn take(&mut self, fd: usize) -> Result<Handle, KernelError> {
        self.slots
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(KernelError::BadFileDescriptor)
    }

    fn drain(&mut self) -> Vec<Handle> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

/// One memory-mapped file region.
pub struct MmapRegion {
    pub base: VirtPage,
    pub pages: usize,
    pub inode: Arc<Inode>,
}

pub struct MmapTable {
    pub next_id: u32,
    pub regions: HashMap<u32, MmapRegion>,
}

/// The executable image an `exec` mapped, write-denied for the process's
/// lifetime.
pub struct ExecImage {
    pub inode: Arc<Inode>,
    pub base: VirtPage,
    pub pages: usize,
}

pub struct Process {
    pid: Pid,
    pagedir: PageDir,
    pages: SupPageTable,
    fds: Mutex<FdTable>,
    cwd: Mutex<Sector>,
    user_sp: AtomicUsize,
    /// Held for the whole of exit; the clock sweep try-locks it and
    /// passes over frames whose owner is mid-teardown.
    exit_lock: Mutex<()>,
    mmaps: Mutex<MmapTable>,
    image: Mutex<Option<ExecImage>>,
}

impl Process {
    fn new(pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            pid,
            pagedir: PageDir::new(),
            pages: SupPageTable::new(),
            fds: Mutex::new(FdTable::new()),
            cwd: Mutex::new(Sector::ROOT_DIR),
            user_sp: AtomicUsize::new(USER_CEILING),
            exit_lock: Mutex::new(()),
            mmaps: Mutex::new(MmapTable {
                next_id: 1,
                regions: HashMap::new(),
            }),
            image: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn pagedir(&self) -> &PageDir {
        &self.pagedir
    }

    #[must_use]
    pub fn pages(&self) -> &SupPageTable {
        &self.pages
    }

    pub fn fds(&self) -> &Mutex<FdTable> {
        &self.fds
    }

    pub fn mmaps(&self) -> &Mutex<MmapTable> {
        &self.mmaps
    }

    pub fn image(&self) -> &Mutex<Option<ExecImage>> {
        &self.image
    }

    #[must_use]
    pub fn cwd(&self) -> Sector {
        *self.cwd.lock().unwrap()
    }

    pub fn set_cwd(&self, sector: Sector) {
        *self.cwd.lock().unwrap() = sector;
    }

    /// The stack pointer saved on entry to the kernel, consulted by the
    /// stack-growth heuristic.
    #[must_use]
    pub fn user_sp(&self) -> usize {
        self.user_sp.load(Ordering::Relaxed)
    }

    pub fn set_user_sp(&self, sp: usize) {
        self.user_sp.store(sp, Ordering::Relaxed);
    }

    pub fn exit_lock_try(&self) -> Option<MutexGuard<'_, ()>> {
        self.exit_lock.try_lock().ok()
    }

    /// Tears the process down: unmaps every page (writing dirty mmap
    /// pages back, freeing swap slots and frames), closes every open
    /// file and directory, drops mmap and image references, and
    /// publishes the exit status.
    pub fn exit(&self, sys: &System, status: i32) {
        let exit_guard = self.exit_lock.lock().unwrap();

        for upage in self.pages.pages() {
            self.unmap_page(sys, upage);
        }

        let handles = self.fds.lock().unwrap().drain();
        for handle in handles {
            match handle {
                Handle::File(f) => sys.fs.close_inode(f.inode),
                Handle::Dir(d) => d.dir.close(&sys.fs),
            }
        }

        let regions = std::mem::take(&mut self.mmaps.lock().unwrap().regions);
        for region in regions.into_values() {
            sys.fs.close_inode(region.inode);
        }

        if let Some(image) = self.image.lock().unwrap().take() {
            image.inode.allow_write();
            sys.fs.close_inode(image.inode);
        }

        drop(exit_guard);
        sys.procs.retire(self.pid, status);
    }
}

/// The system-wide process registry and exit-status board.
pub struct ProcessTable {
    inner: Mutex<ProcsInner>,
    exited: Condvar,
}

struct ProcsInner {
    next_pid: Pid,
    live: Vec<Arc<Process>>,
    statuses: HashMap<Pid, i32>,
}

impl ProcessTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ProcsInner {
                next_pid: 1,
                live: Vec::new(),
                statuses: HashMap::new(),
            }),
            exited: Condvar::new(),
        }
    }

    /// Creates a process with the root directory as its cwd and the
    /// stack pointer at the user ceiling.
    pub fn spawn(&self) -> Arc<Process> {
        let mut inner = self.inner.lock().unwrap();
        let pid = inner.next_pid;
        inner.next_pid += 1;
        let proc = Process::new(pid);
        inner.live.push(Arc::clone(&proc));
        proc
    }

    /// Whether `sector` is the working directory of a live process other
    /// than `asker`. A process may remove its own working directory; it
    /// is left dangling and further relative lookups in it fail.
    #[must_use]
    pub fn is_cwd_elsewhere(&self, sector: Sector, asker: Pid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .live
            .iter()
            .any(|p| p.pid != asker && p.cwd() == sector)
    }

    #[must_use]
    pub fn find(&self, pid: Pid) -> Option<Arc<Process>> {
        self.inner
            .lock()
            .unwrap()
            .live
            .iter()
            .find(|p| p.pid == pid)
            .cloned()
    }

    /// Blocks until `pid` exits and returns its status. Returns `None`
    /// for a pid that never existed or was already waited for.
    pub fn wait(&self, pid: Pid) -> Option<i32> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(status) = inner.statuses.remove(&pid) {
                return Some(status);
            }
            if !inner.live.iter().any(|p| p.pid == pid) {
                return None;
            }
            inner = self.exited.wait(inner).unwrap();
        }
    }

    pub(crate) fn retire(&self, pid: Pid, status: i32) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.live.len();
        inner.live.retain(|p| p.pid != pid);
        if inner.live.len() < before {
            inner.statuses.insert(pid, status);
            self.exited.notify_all();
        }
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    pub fn any_live(&self) -> Option<Arc<Process>> {
        self.inner.lock().unwrap().live.first().cloned()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
