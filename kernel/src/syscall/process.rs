//! Process system calls: exec and wait.
//!
//! Loading is the simulated collaborator here: `exec` maps the named
//! file page-for-page as a lazy, writable executable image (there is no
//! ELF parsing, so no section permissions to honor), denies writes to
//! the image file for the process's lifetime, and seeds one lazy stack
//! page under the user ceiling.

use std::sync::Arc;

use crate::{
    error::KernelError,
    fs::OpenNode,
    param::{EXEC_BASE, PAGE_SIZE, PATH_MAX, USER_CEILING},
    proc::{ExecImage, Pid, Process},
    system::System,
    vm::{VirtPage, page::{FileBacking, PageState}},
};

use super::uaccess;

pub(super) fn sys_exec(
    sys: &System,
    proc: &Arc<Process>,
    path_ptr: usize,
) -> Result<isize, KernelError> {
    let path = uaccess::copy_in_str(sys, proc, path_ptr, PATH_MAX)?;
    match exec_process(sys, proc, &path) {
        Ok(pid) => Ok(isize::try_from(pid).unwrap()),
        Err(_) => Ok(-1),
    }
}

pub(super) fn sys_wait(sys: &System, pid: usize) -> Result<isize, KernelError> {
    let Ok(pid) = Pid::try_from(pid) else {
        return Ok(-1);
    };
    match sys.procs.wait(pid) {
        Some(status) => Ok(isize::try_from(status).unwrap()),
        None => Ok(-1),
    }
}

/// Builds a child process around the image at `path`. The child
/// inherits the parent's working directory.
fn exec_process(sys: &System, parent: &Process, path: &[u8]) -> Result<Pid, KernelError> {
    let node = sys.fs.open_path(parent.cwd(), path)?;
    let inode = match node {
        OpenNode::File(inode) => inode,
        OpenNode::Dir(dir) => {
            dir.close(&sys.fs);
            return Err(KernelError::IsADirectory);
        }
    };

    let len = inode.length(&sys.fs);
    if len == 0 {
        sys.fs.close_inode(inode);
        return Err(KernelError::InvalidArgument);
    }

    let child = sys.procs.spawn();
    child.set_cwd(parent.cwd());

    // Running executables must not change under the process.
    inode.deny_write();

    let base = VirtPage::new(EXEC_BASE);
    let pages = len.div_ceil(PAGE_SIZE);
    *child.image().lock().unwrap() = Some(ExecImage {
        inode: Arc::clone(&inode),
        base,
        pages,
    });

    let populate = || {
        for i in 0..pages {
            let offset = i * PAGE_SIZE;
            let state = PageState::exec(
                FileBacking {
                    inode: Arc::clone(&inode),
                    offset,
                    len: usize::min(PAGE_SIZE, len - offset),
                },
                true,
            );
            child.add_page_entry(base.add_pages(i), state)?;
        }
        child.add_page_entry(VirtPage::new(USER_CEILING - PAGE_SIZE), PageState::stack())
    };
    if let Err(e) = populate() {
        drop(inode);
        child.exit(sys, -1);
        return Err(e);
    }

    drop(inode);
    Ok(child.pid())
}
