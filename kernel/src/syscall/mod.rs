//! The system-call surface.
//!
//! Calls arrive as a decimal vector number plus up to three raw
//! arguments, the way the interrupt stub delivers them. [`dispatch`]
//! decodes the number, routes to a handler, and folds errors into the
//! documented return conventions: pointer-validation failures terminate
//! the process with status -1, everything else surfaces as -1 / 0 /
//! false from the individual call.

pub mod file;
pub mod process;
pub mod uaccess;

use std::sync::Arc;

use strum::FromRepr;

use crate::{error::KernelError, proc::Process, system::System};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(usize)]
pub enum SyscallNo {
    Halt = 0,
    Exit,
    Exec,
    Wait,
    Create,
    Remove,
    Open,
    Filesize,
    Read,
    Write,
    Seek,
    Tell,
    Close,
    Mmap,
    Munmap,
    Chdir,
    Mkdir,
    Readdir,
    Isdir,
    Inumber,
}

/// Handles one system call on behalf of `proc`.
///
/// A handler returns `Err` only for faults that must kill the process
/// (invalid user pointers); policy failures are encoded in the return
/// value. An unknown vector number is fatal too.
pub fn dispatch(sys: &System, proc: &Arc<Process>, no: usize, args: [usize; 3]) -> isize {
    let Some(code) = SyscallNo::from_repr(no) else {
        proc.exit(sys, -1);
        return -1;
    };

    let res: Result<isize, KernelError> = match code {
        SyscallNo::Halt => {
            sys.halt();
            Ok(0)
        }
        SyscallNo::Exit => {
            let status = args[0] as isize as i32;
            proc.exit(sys, status);
            Ok(isize::try_from(status).unwrap())
        }
        SyscallNo::Exec => process::sys_exec(sys, proc, args[0]),
        SyscallNo::Wait => process::sys_wait(sys, args[0]),
        SyscallNo::Create => file::sys_create(sys, proc, args[0], args[1]),
        SyscallNo::Remove => file::sys_remove(sys, proc, args[0]),
        SyscallNo::Open => file::sys_open(sys, proc, args[0]),
        SyscallNo::Filesize => file::sys_filesize(sys, proc, args[0]),
        SyscallNo::Read => file::sys_read(sys, proc, args[0], args[1], args[2]),
        SyscallNo::Write => file::sys_write(sys, proc, args[0], args[1], args[2]),
        SyscallNo::Seek => file::sys_seek(sys, proc, args[0], args[1]),
        SyscallNo::Tell => file::sys_tell(sys, proc, args[0]),
        SyscallNo::Close => file::sys_close(sys, proc, args[0]),
        SyscallNo::Mmap => file::sys_mmap(sys, proc, args[0], args[1]),
        SyscallNo::Munmap => file::sys_munmap(sys, proc, args[0]),
        SyscallNo::Chdir => file::sys_chdir(sys, proc, args[0]),
        SyscallNo::Mkdir => file::sys_mkdir(sys, proc, args[0]),
        SyscallNo::Readdir => file::sys_readdir(sys, proc, args[0], args[1]),
        SyscallNo::Isdir => file::sys_isdir(sys, proc, args[0]),
        SyscallNo::Inumber => file::sys_inumber(sys, proc, args[0]),
    };

    match res {
        Ok(value) => value,
        Err(_) => {
            // Invalid user memory: the process dies with -1.
            proc.exit(sys, -1);
            -1
        }
    }
}
