//! Tunable machine and kernel parameters.

use std::time::Duration;

/// Size of the disk block cache, in sector buffers.
pub const CACHE_SLOTS: usize = 64;

/// Bytes per page of user memory.
pub const PAGE_SIZE: usize = 4096;

/// Device sectors backing one page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / opin_fs_types::SECTOR_SIZE;

/// Open files per process, including the two console descriptors.
pub const NOFILE: usize = 16;

/// First user virtual address that is not usable (kernel space above).
pub const USER_CEILING: usize = 0xc000_0000;

/// Largest stack a process may grow, measured down from the ceiling.
pub const STACK_LIMIT: usize = 1 << 30;

/// How far below the saved user stack pointer an access still counts as
/// stack growth (PUSHA writes 32 bytes below %esp before moving it).
pub const STACK_SLOP: usize = 32;

/// Base of an executable image in user space.
pub const EXEC_BASE: usize = 0x0804_8000;

/// Full clock-hand revolutions before frame eviction gives up.
pub const CLOCK_SWEEPS: usize = 2;

/// Directory entries preallocated by `mkdir`, not counting `.` and `..`.
pub const DIR_CAPACITY: usize = 16;

/// Longest path a syscall accepts, in bytes.
pub const PATH_MAX: usize = 1024;

/// How often the background flusher writes dirty cache buffers back.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
