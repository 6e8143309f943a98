//! The system context: every subsystem singleton, booted in dependency
//! order and shut down in reverse.

use std::{
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crate::{
    console::Console,
    device::{DiskRole, VirtualDisk},
    error::KernelError,
    fs::Filesys,
    param::{CACHE_SLOTS, FLUSH_INTERVAL},
    proc::ProcessTable,
    vm::{frame::FrameTable, swap::SwapTable},
};

#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// File system device size, in sectors.
    pub fs_sectors: usize,
    /// Swap device size, in sectors.
    pub swap_sectors: usize,
    /// Simulated physical memory, in pages; half becomes user frames.
    pub phys_pages: usize,
    /// Upper bound on user frames regardless of physical memory.
    pub frame_limit: usize,
    /// Block cache size, in sector buffers.
    pub cache_slots: usize,
    /// Background flusher tick.
    pub flush_interval: Duration,
    /// Format the file system device at boot.
    pub format: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            fs_sectors: 16384,
            swap_sectors: 8192,
            phys_pages: 1024,
            frame_limit: 4096,
            cache_slots: CACHE_SLOTS,
            flush_interval: FLUSH_INTERVAL,
            format: true,
        }
    }
}

pub struct System {
    pub fs: Arc<Filesys>,
    pub swap: SwapTable,
    pub frames: FrameTable,
    pub procs: ProcessTable,
    pub console: Console,
    fs_disk: Arc<VirtualDisk>,
    swap_disk: Arc<VirtualDisk>,
    flusher: Mutex<Option<thread::JoinHandle<()>>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    halted: AtomicBool,
    down: AtomicBool,
}

impl System {
    /// Boots on fresh disks.
    pub fn boot(config: &SystemConfig) -> Result<Arc<Self>, KernelError> {
        let fs_disk = Arc::new(VirtualDisk::new(config.fs_sectors));
        let swap_disk = Arc::new(VirtualDisk::new(config.swap_sectors));
        Self::boot_with_disks(fs_disk, swap_disk, config)
    }

    /// Boots on existing disks; with `config.format` false the file
    /// system found on the disk is mounted as-is.
    pub fn boot_with_disks(
        fs_disk: Arc<VirtualDisk>,
        swap_disk: Arc<VirtualDisk>,
        config: &SystemConfig,
    ) -> Result<Arc<Self>, KernelError> {
        let fs = Arc::new(Filesys::new(
            Arc::clone(&fs_disk),
            config.cache_slots,
            config.format,
        )?);
        let swap = SwapTable::new(Arc::clone(&swap_disk));
        let frames = FrameTable::new(config.phys_pages, config.frame_limit);

        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let flusher = {
            let fs = Arc::clone(&fs);
            let stop = Arc::clone(&stop);
            let interval = config.flush_interval;
            thread::spawn(move || {
                let (lock, cv) = &*stop;
                let mut stopped = lock.lock().unwrap();
                while !*stopped {
                    let (guard, _) = cv.wait_timeout(stopped, interval).unwrap();
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    let Ok(()) = fs.cache.flush_all();
                }
            })
        };

        Ok(Arc::new(Self {
            fs,
            swap,
            frames,
            procs: ProcessTable::new(),
            console: Console::new(),
            fs_disk,
            swap_disk,
            flusher: Mutex::new(Some(flusher)),
            stop,
            halted: AtomicBool::new(false),
            down: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn disk(&self, role: DiskRole) -> &Arc<VirtualDisk> {
        match role {
            DiskRole::FileSys => &self.fs_disk,
            DiskRole::Swap => &self.swap_disk,
        }
    }

    /// Requests a machine halt; the driver loop checks [`System::halted`].
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Shuts down: stops the flusher, tears down surviving processes,
    /// persists the free map, and flushes the cache. Idempotent.
    pub fn shutdown(&self) -> Result<(), KernelError> {
        if self.down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let (lock, cv) = &*self.stop;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            let _ = handle.join();
        }
        while let Some(proc) = self.procs.any_live() {
            proc.exit(self, -1);
        }
        self.fs.close()
    }
}

impl Drop for System {
    fn drop(&mut self) {
        // Make sure the flusher thread is not left holding the cache.
        if thread::panicking() {
            return;
        }
        {
            let (lock, cv) = &*self.stop;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
