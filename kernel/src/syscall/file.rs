//! File, directory, and mmap system calls.

use std::sync::Arc;

use opin_fs_types::NAME_MAX;

use crate::{
    error::KernelError,
    fs::OpenNode,
    param::{PAGE_SIZE, PATH_MAX, STACK_LIMIT, USER_CEILING},
    proc::{DirHandle, FileHandle, Handle, MmapRegion, Process},
    system::System,
    vm::{VirtPage, page::{FileBacking, PageState}},
};

use super::uaccess;

fn path_arg(sys: &System, proc: &Arc<Process>, ptr: usize) -> Result<Vec<u8>, KernelError> {
    uaccess::copy_in_str(sys, proc, ptr, PATH_MAX)
}

pub(super) fn sys_create(
    sys: &System,
    proc: &Arc<Process>,
    path_ptr: usize,
    size: usize,
) -> Result<isize, KernelError> {
    let path = path_arg(sys, proc, path_ptr)?;
    Ok(isize::from(
        sys.fs.create_path(proc.cwd(), &path, size).is_ok(),
    ))
}

pub(super) fn sys_remove(
    sys: &System,
    proc: &Arc<Process>,
    path_ptr: usize,
) -> Result<isize, KernelError> {
    let path = path_arg(sys, proc, path_ptr)?;
    let busy = |sector| sys.procs.is_cwd_elsewhere(sector, proc.pid());
    Ok(isize::from(
        sys.fs.remove_path(proc.cwd(), &path, &busy).is_ok(),
    ))
}

pub(super) fn sys_open(
    sys: &System,
    proc: &Arc<Process>,
    path_ptr: usize,
) -> Result<isize, KernelError> {
    let path = path_arg(sys, proc, path_ptr)?;
    let Ok(node) = sys.fs.open_path(proc.cwd(), &path) else {
        return Ok(-1);
    };
    let handle = match node {
        OpenNode::File(inode) => Handle::File(FileHandle { inode, pos: 0 }),
        OpenNode::Dir(dir) => Handle::Dir(DirHandle { dir }),
    };
    let allocated = proc.fds().lock().unwrap().alloc(handle);
    match allocated {
        Ok(fd) => Ok(isize::try_from(fd).unwrap()),
        Err(Handle::File(f)) => {
            sys.fs.close_inode(f.inode);
            Ok(-1)
        }
        Err(Handle::Dir(d)) => {
            d.dir.close(&sys.fs);
            Ok(-1)
        }
    }
}

pub(super) fn sys_filesize(
    sys: &System,
    proc: &Arc<Process>,
    fd: usize,
) -> Result<isize, KernelError> {
    let mut fds = proc.fds().lock().unwrap();
    match fds.get_mut(fd) {
        Ok(Handle::File(f)) => Ok(isize::try_from(f.inode.length(&sys.fs)).unwrap()),
        _ => Ok(-1),
    }
}

pub(super) fn sys_read(
    sys: &System,
    proc: &Arc<Process>,
    fd: usize,
    buf: usize,
    len: usize,
) -> Result<isize, KernelError> {
    if fd == 1 {
        return Ok(-1);
    }
    let pinned = uaccess::validate(sys, proc, buf, len, true)?;

    if fd == 0 {
        let mut tmp = vec![0u8; len];
        let n = sys.console.read(&mut tmp);
        pinned.copy_out(&tmp[..n]);
        return Ok(isize::try_from(n).unwrap());
    }

    let mut fds = proc.fds().lock().unwrap();
    let Ok(Handle::File(f)) = fds.get_mut(fd) else {
        return Ok(-1);
    };
    let mut tmp = vec![0u8; len];
    let n = f.inode.read_at(&sys.fs, &mut tmp, f.pos);
    f.pos += n;
    drop(fds);

    pinned.copy_out(&tmp[..n]);
    Ok(isize::try_from(n).unwrap())
}

pub(super) fn sys_write(
    sys: &System,
    proc: &Arc<Process>,
    fd: usize,
    buf: usize,
    len: usize,
) -> Result<isize, KernelError> {
    if fd == 0 {
        return Ok(-1);
    }
    let pinned = uaccess::validate(sys, proc, buf, len, false)?;
    let mut tmp = vec![0u8; len];
    pinned.copy_in(&mut tmp);
    drop(pinned);

    if fd == 1 {
        return Ok(isize::try_from(sys.console.write(&tmp)).unwrap());
    }

    let mut fds = proc.fds().lock().unwrap();
    let Ok(Handle::File(f)) = fds.get_mut(fd) else {
        return Ok(-1);
    };
    match f.inode.write_at(&sys.fs, &tmp, f.pos) {
        Ok(n) => {
            f.pos += n;
            Ok(isize::try_from(n).unwrap())
        }
        // Denied or failed writes wrote nothing.
        Err(_) => Ok(0),
    }
}

pub(super) fn sys_seek(
    _sys: &System,
    proc: &Arc<Process>,
    fd: usize,
    pos: usize,
) -> Result<isize, KernelError> {
    let mut fds = proc.fds().lock().unwrap();
    if let Ok(Handle::File(f)) = fds.get_mut(fd) {
        f.pos = pos;
    }
    Ok(0)
}

pub(super) fn sys_tell(
    _sys: &System,
    proc: &Arc<Process>,
    fd: usize,
) -> Result<isize, KernelError> {
    let mut fds = proc.fds().lock().unwrap();
    match fds.get_mut(fd) {
        Ok(Handle::File(f)) => Ok(isize::try_from(f.pos).unwrap()),
        _ => Ok(0),
    }
}

pub(super) fn sys_close(
    sys: &System,
    proc: &Arc<Process>,
    fd: usize,
) -> Result<isize, KernelError> {
    let taken = proc.fds().lock().unwrap().take(fd);
    match taken {
        Ok(Handle::File(f)) => {
            sys.fs.close_inode(f.inode);
            Ok(0)
        }
        Ok(Handle::Dir(d)) => {
            d.dir.close(&sys.fs);
            Ok(0)
        }
        Err(_) => Ok(-1),
    }
}

pub(super) fn sys_chdir(
    sys: &System,
    proc: &Arc<Process>,
    path_ptr: usize,
) -> Result<isize, KernelError> {
    let path = path_arg(sys, proc, path_ptr)?;
    match sys.fs.chdir_lookup(proc.cwd(), &path) {
        Ok(sector) => {
            proc.set_cwd(sector);
            Ok(1)
        }
        Err(_) => Ok(0),
    }
}

pub(super) fn sys_mkdir(
    sys: &System,
    proc: &Arc<Process>,
    path_ptr: usize,
) -> Result<isize, KernelError> {
    let path = path_arg(sys, proc, path_ptr)?;
    Ok(isize::from(sys.fs.mkdir_path(proc.cwd(), &path).is_ok()))
}

pub(super) fn sys_readdir(
    sys: &System,
    proc: &Arc<Process>,
    fd: usize,
    name_ptr: usize,
) -> Result<isize, KernelError> {
    // The caller's buffer must hold NAME_MAX bytes plus the terminator.
    let pinned = uaccess::validate(sys, proc, name_ptr, NAME_MAX + 1, true)?;

    let mut fds = proc.fds().lock().unwrap();
    let Ok(Handle::Dir(d)) = fds.get_mut(fd) else {
        return Ok(0);
    };
    let Some(name) = d.dir.readdir(&sys.fs) else {
        return Ok(0);
    };
    let mut out = name.to_vec();
    out.push(0);
    drop(fds);

    pinned.copy_out(&out);
    Ok(1)
}

pub(super) fn sys_isdir(
    _sys: &System,
    proc: &Arc<Process>,
    fd: usize,
) -> Result<isize, KernelError> {
    let mut fds = proc.fds().lock().unwrap();
    match fds.get_mut(fd) {
        Ok(Handle::Dir(_)) => Ok(1),
        _ => Ok(0),
    }
}

pub(super) fn sys_inumber(
    _sys: &System,
    proc: &Arc<Process>,
    fd: usize,
) -> Result<isize, KernelError> {
    let mut fds = proc.fds().lock().unwrap();
    match fds.get_mut(fd) {
        Ok(Handle::File(f)) => Ok(isize::try_from(f.inode.sector().value()).unwrap()),
        Ok(Handle::Dir(d)) => Ok(isize::try_from(d.dir.sector().value()).unwrap()),
        Err(_) => Ok(-1),
    }
}

pub(super) fn sys_mmap(
    sys: &System,
    proc: &Arc<Process>,
    fd: usize,
    addr: usize,
) -> Result<isize, KernelError> {
    if addr == 0 || addr % PAGE_SIZE != 0 {
        return Ok(-1);
    }
    let inode = {
        let mut fds = proc.fds().lock().unwrap();
        match fds.get_mut(fd) {
            Ok(Handle::File(f)) => sys.fs.reopen_inode(&f.inode),
            _ => return Ok(-1),
        }
    };
    let len = inode.length(&sys.fs);
    let pages = len.div_ceil(PAGE_SIZE);

    // The whole region must sit below the reserved stack band.
    let fits = pages > 0
        && addr
            .checked_add(pages * PAGE_SIZE)
            .is_some_and(|end| end <= USER_CEILING - STACK_LIMIT);
    if !fits {
        sys.fs.close_inode(inode);
        return Ok(-1);
    }

    let base = VirtPage::new(addr);
    let end = addr + pages * PAGE_SIZE;
    let overlaps_image = proc.image().lock().unwrap().as_ref().is_some_and(|img| {
        addr < img.base.add_pages(img.pages).addr() && img.base.addr() < end
    });
    let overlaps_entries = (0..pages).any(|i| proc.pages().contains(base.add_pages(i)));
    if overlaps_image || overlaps_entries {
        sys.fs.close_inode(inode);
        return Ok(-1);
    }

    for i in 0..pages {
        let offset = i * PAGE_SIZE;
        let state = PageState::file(
            FileBacking {
                inode: Arc::clone(&inode),
                offset,
                len: usize::min(PAGE_SIZE, len - offset),
            },
            true,
        );
        if proc.add_page_entry(base.add_pages(i), state).is_err() {
            for done in 0..i {
                proc.unmap_page(sys, base.add_pages(done));
            }
            sys.fs.close_inode(inode);
            return Ok(-1);
        }
    }

    let mut mmaps = proc.mmaps().lock().unwrap();
    let id = mmaps.next_id;
    mmaps.next_id += 1;
    mmaps.regions.insert(id, MmapRegion { base, pages, inode });
    Ok(isize::try_from(id).unwrap())
}

pub(super) fn sys_munmap(
    sys: &System,
    proc: &Arc<Process>,
    id: usize,
) -> Result<isize, KernelError> {
    let Ok(id) = u32::try_from(id) else {
        return Ok(-1);
    };
    let Some(region) = proc.mmaps().lock().unwrap().regions.remove(&id) else {
        return Ok(-1);
    };
    for i in 0..region.pages {
        proc.unmap_page(sys, region.base.add_pages(i));
    }
    sys.fs.close_inode(region.inode);
    Ok(0)
}
