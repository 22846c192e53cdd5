//! Cross-process scatter/gather memory transfer.
//!
//! Linux uses `process_vm_readv`/`process_vm_writev`; Darwin uses the
//! Mach VM calls, which only support single-segment transfers. Remote
//! segments are raw addresses in the peer's address space and are never
//! dereferenced locally.

use nal::error::{Error, Result};
use nal::mem::Segment;

/// Write the bytes described by `local` into the peer's `remote`
/// segments. Returns the number of bytes transferred.
///
/// # Safety
/// Every local segment must describe memory valid for reads in this
/// process for the duration of the call.
#[cfg(target_os = "linux")]
pub unsafe fn write(pid: i32, local: &[Segment], remote: &[Segment]) -> Result<usize> {
    use nix::sys::uio::{process_vm_writev, RemoteIoVec};
    use std::io::IoSlice;

    let local_iov: Vec<IoSlice<'_>> = local
        .iter()
        .map(|s| IoSlice::new(std::slice::from_raw_parts(s.base as *const u8, s.len as usize)))
        .collect();
    let remote_iov: Vec<RemoteIoVec> = remote
        .iter()
        .map(|s| RemoteIoVec {
            base: s.base as usize,
            len: s.len as usize,
        })
        .collect();
    process_vm_writev(nix::unistd::Pid::from_raw(pid), &local_iov, &remote_iov)
        .map_err(|e| Error::Protocol(std::io::Error::from_raw_os_error(e as i32)))
}

/// Read the peer's `remote` segments into the memory described by
/// `local`. Returns the number of bytes transferred.
///
/// # Safety
/// Every local segment must describe memory valid for writes in this
/// process for the duration of the call, with no aliasing among them.
#[cfg(target_os = "linux")]
pub unsafe fn read(pid: i32, local: &[Segment], remote: &[Segment]) -> Result<usize> {
    use nix::sys::uio::{process_vm_readv, RemoteIoVec};
    use std::io::IoSliceMut;

    let mut local_iov: Vec<IoSliceMut<'_>> = local
        .iter()
        .map(|s| {
            IoSliceMut::new(std::slice::from_raw_parts_mut(
                s.base as *mut u8,
                s.len as usize,
            ))
        })
        .collect();
    let remote_iov: Vec<RemoteIoVec> = remote
        .iter()
        .map(|s| RemoteIoVec {
            base: s.base as usize,
            len: s.len as usize,
        })
        .collect();
    process_vm_readv(nix::unistd::Pid::from_raw(pid), &mut local_iov, &remote_iov)
        .map_err(|e| Error::Protocol(std::io::Error::from_raw_os_error(e as i32)))
}

#[cfg(target_os = "macos")]
fn task_for(pid: i32) -> Result<mach2::port::mach_port_name_t> {
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::{mach_task_self, task_for_pid};

    let mut task: mach2::port::mach_port_name_t = 0;
    let kret = unsafe { task_for_pid(mach_task_self(), pid, &mut task) };
    if kret != KERN_SUCCESS {
        return Err(Error::protocol("task_for_pid() failed"));
    }
    Ok(task)
}

/// Single-segment Mach write.
///
/// # Safety
/// See the Linux variant.
#[cfg(target_os = "macos")]
pub unsafe fn write(pid: i32, local: &[Segment], remote: &[Segment]) -> Result<usize> {
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::vm::mach_vm_write;

    if local.len() > 1 || remote.len() > 1 {
        return Err(Error::protocol("non-contiguous transfers are not supported"));
    }
    let task = task_for(pid)?;
    let len = local[0].len.min(remote[0].len);
    let kret = mach_vm_write(task, remote[0].base, local[0].base as usize, len as u32);
    if kret != KERN_SUCCESS {
        return Err(Error::protocol("mach_vm_write() failed"));
    }
    Ok(len as usize)
}

/// Single-segment Mach read.
///
/// # Safety
/// See the Linux variant.
#[cfg(target_os = "macos")]
pub unsafe fn read(pid: i32, local: &[Segment], remote: &[Segment]) -> Result<usize> {
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::vm::mach_vm_read_overwrite;

    if local.len() > 1 || remote.len() > 1 {
        return Err(Error::protocol("non-contiguous transfers are not supported"));
    }
    let task = task_for(pid)?;
    let len = local[0].len.min(remote[0].len);
    let mut nread: u64 = 0;
    let kret = mach_vm_read_overwrite(task, remote[0].base, len, local[0].base, &mut nread);
    if kret != KERN_SUCCESS {
        return Err(Error::protocol("mach_vm_read_overwrite() failed"));
    }
    Ok(nread as usize)
}
