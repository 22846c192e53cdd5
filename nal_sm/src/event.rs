//! Edge-triggered inter-process wakeups.
//!
//! Backed by an eventfd in semaphore mode where available, otherwise by a
//! named FIFO opened read-write and non-blocking. One `set` wakes one
//! `get`; queued signals keep the descriptor readable so a poll set can
//! level-trigger on it.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
#[cfg(not(target_os = "linux"))]
use std::path::PathBuf;

use nal::error::{Error, Result};

/// One wakeup endpoint. The fd may be duplicated into a peer process via
/// ancillary-data passing; both ends then signal through the same kernel
/// object.
pub struct Notifier {
    fd: OwnedFd,
    /// FIFO path to unlink on destroy, when this side created it.
    #[cfg(not(target_os = "linux"))]
    path: Option<PathBuf>,
}

impl Notifier {
    /// Create a notifier backed by an eventfd.
    #[cfg(target_os = "linux")]
    pub fn new() -> Result<Notifier> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Notifier {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Create a notifier backed by a named FIFO. Kqueue descriptors
    /// cannot travel through ancillary data, so platforms without eventfd
    /// signal through a FIFO instead.
    #[cfg(not(target_os = "linux"))]
    pub fn new_fifo(path: &std::path::Path) -> Result<Notifier> {
        use nix::fcntl::{open, OFlag};
        use nix::sys::stat::Mode;

        nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| Error::Protocol(io::Error::from_raw_os_error(e as i32)))?;
        // O_RDWR keeps the FIFO open without a second end.
        let fd = open(path, OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty())
            .map_err(|e| Error::Protocol(io::Error::from_raw_os_error(e as i32)))?;
        Ok(Notifier {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            path: Some(path.to_path_buf()),
        })
    }

    /// Wrap a descriptor received from a peer.
    pub fn from_owned_fd(fd: OwnedFd) -> Notifier {
        Notifier {
            fd,
            #[cfg(not(target_os = "linux"))]
            path: None,
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.fd.as_fd()
    }

    /// Signal the notifier. A full counter means the peer is already
    /// signaled, which is sufficient for edge-triggered semantics.
    pub fn set(&self) -> Result<()> {
        let count: u64 = 1;
        match nix::unistd::write(&self.fd, &count.to_ne_bytes()) {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EAGAIN) => Ok(()),
            Err(e) => Err(Error::Protocol(io::Error::from_raw_os_error(e as i32))),
        }
    }

    /// Consume one signal. Returns false when none is pending.
    pub fn get(&self) -> Result<bool> {
        let mut count = [0u8; 8];
        match nix::unistd::read(self.fd.as_raw_fd(), &mut count) {
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::EAGAIN) => Ok(false),
            Err(e) => Err(Error::Protocol(io::Error::from_raw_os_error(e as i32))),
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        #[cfg(not(target_os = "linux"))]
        if let Some(path) = &self.path {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "could not unlink fifo");
            }
        }
    }
}
