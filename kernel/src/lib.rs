//! opin kernel core: buffered block cache, extensible-file inode layer,
//! hierarchical directories, and demand-paged virtual memory, hosted on a
//! simulated machine.
//!
//! The crate is organized the way the subsystems depend on one another:
//!
//! * [`device`] — the raw sector device (simulated).
//! * [`fs`] — free map, inodes, and directories, all doing their device
//!   I/O through the shared block cache.
//! * [`vm`] — swap table, physical frame table, and per-process
//!   supplemental page tables.
//! * [`proc`] — processes: simulated page directory, fd table, mmap
//!   regions, teardown.
//! * [`syscall`] — the system-call surface and the user-pointer
//!   validator / page-fault handler.
//! * [`system`] — boots everything in order and owns it.
//!
//! Lock ordering, coarsest to finest (a thread may only acquire locks
//! left to right; the block cache is the bottom of every chain and calls
//! up into nothing):
//!
//! ```text
//! open-inode registry -> inode -> cache global -> cache entry
//! frame allocator -> frame entry -> owner exit -> page-table entry -> cache
//! ```
//!
//! Whenever two of these chains meet (eviction writing back a dirty mmap
//! page, for instance), the VM side acquires fs locks, never the other
//! way around.

pub mod console;
pub mod device;
pub mod error;
pub mod fs;
pub mod param;
pub mod proc;
pub mod syscall;
pub mod system;
pub mod vm;

pub use error::KernelError;
pub use system::{System, SystemConfig};
