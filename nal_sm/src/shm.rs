//! POSIX shared-memory regions.

use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};

/// A mapped POSIX shared-memory object.
///
/// The creator owns the object name and unlinks it when dropped; openers
/// only unmap.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    fd: RawFd,
    is_owner: bool,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

fn page_align(size: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page <= 0 { 4096 } else { page as usize };
    size.div_ceil(page) * page
}

fn name_to_cstring(name: &str) -> io::Result<CString> {
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains null byte"))
}

impl SharedRegion {
    /// Create a new shared-memory object of at least `size` bytes
    /// (rounded up to the page size) and map it. The mapping starts
    /// zero-filled.
    pub fn create(name: &str, size: usize) -> io::Result<SharedRegion> {
        Self::map(name, size, true)
    }

    /// Open and map an existing shared-memory object.
    pub fn open(name: &str, size: usize) -> io::Result<SharedRegion> {
        Self::map(name, size, false)
    }

    fn map(name: &str, size: usize, create: bool) -> io::Result<SharedRegion> {
        let name = name_to_cstring(name)?;
        let size = page_align(size);

        let oflag = if create {
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR
        } else {
            OFlag::O_RDWR
        };
        let fd = shm_open(name.as_c_str(), oflag, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let raw_fd = fd.as_raw_fd();

        if create {
            if let Err(e) = ftruncate(&fd, size as i64) {
                let _ = close(raw_fd);
                let _ = shm_unlink(name.as_c_str());
                return Err(io::Error::from_raw_os_error(e as i32));
            }
        }

        let len = match NonZeroUsize::new(size) {
            Some(len) => len,
            None => {
                let _ = close(raw_fd);
                if create {
                    let _ = shm_unlink(name.as_c_str());
                }
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "size must be non-zero",
                ));
            }
        };

        let ptr = match unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                if create {
                    let _ = shm_unlink(name.as_c_str());
                }
                return Err(io::Error::from_raw_os_error(e as i32));
            }
        };

        Ok(SharedRegion {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            size,
            name,
            fd: fd.into_raw_fd(),
            is_owner: create,
        })
    }

    /// Pointer to the start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped size (page aligned, may exceed the requested size).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle created (and will unlink) the object.
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(
                NonNull::new_unchecked(self.ptr.as_ptr() as *mut _),
                self.size,
            );
            let _ = close(self.fd);
            if self.is_owner {
                let _ = shm_unlink(self.name.as_c_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_share_bytes() {
        let name = format!("/nal_sm_shm_test_{}", std::process::id());
        let region = SharedRegion::create(&name, 4096).unwrap();
        assert!(region.is_owner());
        unsafe { std::ptr::write_volatile(region.as_ptr(), 0x5a) };

        let view = SharedRegion::open(&name, 4096).unwrap();
        assert!(!view.is_owner());
        let byte = unsafe { std::ptr::read_volatile(view.as_ptr()) };
        assert_eq!(byte, 0x5a);

        drop(view);
        drop(region);
        assert!(SharedRegion::open(&name, 4096).is_err());
    }

    #[test]
    fn create_twice_fails() {
        let name = format!("/nal_sm_shm_excl_{}", std::process::id());
        let _region = SharedRegion::create(&name, 64).unwrap();
        assert!(SharedRegion::create(&name, 64).is_err());
    }

    #[test]
    fn size_is_page_aligned() {
        let name = format!("/nal_sm_shm_pg_{}", std::process::id());
        let region = SharedRegion::create(&name, 100).unwrap();
        assert!(region.size() >= 100);
        assert_eq!(region.size() % 4096, 0);
    }
}
