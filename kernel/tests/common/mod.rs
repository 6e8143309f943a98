//! Driver for exercising the kernel the way user programs would: every
//! operation goes through the syscall surface with arguments living in
//! the process's own (simulated) user memory.

#![allow(dead_code)]

use std::sync::Arc;

use opin_kernel::{
    System,
    param::{PATH_MAX, USER_CEILING},
    proc::Process,
    syscall::{self, SyscallNo, uaccess},
};

/// Stack-backed scratch area each driven process gets below the ceiling.
pub const SCRATCH_REGION: usize = 4 << 20;

pub struct UserProc {
    sys: Arc<System>,
    pub proc: Arc<Process>,
}

impl UserProc {
    pub fn new(sys: &Arc<System>) -> Self {
        let proc = sys.procs.spawn();
        proc.set_user_sp(USER_CEILING - SCRATCH_REGION);
        Self {
            sys: Arc::clone(sys),
            proc,
        }
    }

    /// Scratch address used for path arguments.
    pub fn path_addr(&self) -> usize {
        self.proc.user_sp()
    }

    /// Scratch address used for data buffers (path and data never
    /// overlap; data gets the room above the first 64 KiB).
    pub fn data_addr(&self) -> usize {
        self.proc.user_sp() + 0x1_0000
    }

    pub fn call(&self, no: SyscallNo, args: [usize; 3]) -> isize {
        syscall::dispatch(&self.sys, &self.proc, no as usize, args)
    }

    /// A user-mode store (faults pages in as the MMU would).
    pub fn poke(&self, addr: usize, bytes: &[u8]) {
        uaccess::user_store(&self.sys, &self.proc, addr, bytes).unwrap();
    }

    /// A user-mode load.
    pub fn peek(&self, addr: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        uaccess::user_load(&self.sys, &self.proc, addr, &mut out).unwrap();
        out
    }

    fn put_path(&self, path: &str) -> usize {
        assert!(path.len() < PATH_MAX);
        let mut bytes = path.as_bytes().to_vec();
        bytes.push(0);
        self.poke(self.path_addr(), &bytes);
        self.path_addr()
    }

    pub fn create(&self, path: &str, size: usize) -> bool {
        let p = self.put_path(path);
        self.call(SyscallNo::Create, [p, size, 0]) == 1
    }

    pub fn remove(&self, path: &str) -> bool {
        let p = self.put_path(path);
        self.call(SyscallNo::Remove, [p, 0, 0]) == 1
    }

    pub fn open(&self, path: &str) -> isize {
        let p = self.put_path(path);
        self.call(SyscallNo::Open, [p, 0, 0])
    }

    pub fn filesize(&self, fd: isize) -> isize {
        self.call(SyscallNo::Filesize, [fd as usize, 0, 0])
    }

    /// Writes `data` through the user scratch buffer.
    pub fn write(&self, fd: isize, data: &[u8]) -> isize {
        self.poke(self.data_addr(), data);
        self.write_prepoked(fd, data.len())
    }

    /// Issues a write syscall over bytes already poked at `data_addr`.
    pub fn write_prepoked(&self, fd: isize, len: usize) -> isize {
        self.call(SyscallNo::Write, [fd as usize, self.data_addr(), len])
    }

    pub fn read(&self, fd: isize, len: usize) -> (isize, Vec<u8>) {
        let n = self.call(SyscallNo::Read, [fd as usize, self.data_addr(), len]);
        if n < 0 {
            return (n, Vec::new());
        }
        (n, self.peek(self.data_addr(), n as usize))
    }

    pub fn seek(&self, fd: isize, pos: usize) {
        self.call(SyscallNo::Seek, [fd as usize, pos, 0]);
    }

    pub fn tell(&self, fd: isize) -> isize {
        self.call(SyscallNo::Tell, [fd as usize, 0, 0])
    }

    pub fn close(&self, fd: isize) {
        self.call(SyscallNo::Close, [fd as usize, 0, 0]);
    }

    pub fn mkdir(&self, path: &str) -> bool {
        let p = self.put_path(path);
        self.call(SyscallNo::Mkdir, [p, 0, 0]) == 1
    }

    pub fn chdir(&self, path: &str) -> bool {
        let p = self.put_path(path);
        self.call(SyscallNo::Chdir, [p, 0, 0]) == 1
    }

    pub fn readdir(&self, fd: isize) -> Option<String> {
        if self.call(SyscallNo::Readdir, [fd as usize, self.data_addr(), 0]) != 1 {
            return None;
        }
        let raw = self.peek(self.data_addr(), 15);
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Some(String::from_utf8_lossy(&raw[..len]).into_owned())
    }

    pub fn isdir(&self, fd: isize) -> bool {
        self.call(SyscallNo::Isdir, [fd as usize, 0, 0]) == 1
    }

    pub fn inumber(&self, fd: isize) -> isize {
        self.call(SyscallNo::Inumber, [fd as usize, 0, 0])
    }

    pub fn mmap(&self, fd: isize, addr: usize) -> isize {
        self.call(SyscallNo::Mmap, [fd as usize, addr, 0])
    }

    pub fn munmap(&self, id: isize) -> isize {
        self.call(SyscallNo::Munmap, [id as usize, 0, 0])
    }

    pub fn exec(&self, path: &str) -> isize {
        let p = self.put_path(path);
        self.call(SyscallNo::Exec, [p, 0, 0])
    }

    pub fn wait(&self, pid: isize) -> isize {
        self.call(SyscallNo::Wait, [pid as usize, 0, 0])
    }

    pub fn exit(&self, status: i32) {
        self.call(SyscallNo::Exit, [status as usize, 0, 0]);
    }
}
