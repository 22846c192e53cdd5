//! OS-level readiness multiplexing.
//!
//! A [`PollSet`] tracks registered descriptors with an attached dispatch
//! token of the caller's choosing. Waiting with a non-zero timeout blocks
//! in the OS multiplexer; waiting with a zero timeout dispatches every
//! registered entry without entering the kernel, which is what busy-poll
//! progress modes rely on.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Mutex;

use nal::error::{Error, Result};
use slab::Slab;

/// Readiness report for one registered entry.
pub struct Readiness<T> {
    pub data: T,
    /// True when the descriptor reported an error or hangup.
    pub error: bool,
}

struct Entry<T> {
    fd: RawFd,
    data: T,
}

/// Readiness multiplexer over registered descriptors.
pub struct PollSet<T: Clone> {
    entries: Mutex<Slab<Entry<T>>>,
    #[cfg(target_os = "linux")]
    epoll: nix::sys::epoll::Epoll,
    #[cfg(not(target_os = "linux"))]
    kq: nix::sys::event::Kqueue,
}

#[cfg(target_os = "linux")]
impl<T: Clone> PollSet<T> {
    pub fn new() -> Result<PollSet<T>> {
        use nix::sys::epoll::{Epoll, EpollCreateFlags};
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| Error::Protocol(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(PollSet {
            entries: Mutex::new(Slab::new()),
            epoll,
        })
    }

    /// Register a descriptor for input readiness. Returns the token to
    /// deregister with.
    pub fn register(&self, fd: BorrowedFd<'_>, data: T) -> Result<usize> {
        use nix::sys::epoll::{EpollEvent, EpollFlags};
        let token = {
            let mut entries = self.entries.lock().unwrap();
            entries.insert(Entry {
                fd: fd.as_raw_fd(),
                data,
            })
        };
        let event = EpollEvent::new(EpollFlags::EPOLLIN, token as u64);
        if let Err(e) = self.epoll.add(fd, event) {
            self.entries.lock().unwrap().remove(token);
            return Err(Error::Protocol(std::io::Error::from_raw_os_error(e as i32)));
        }
        Ok(token)
    }

    /// Remove a registration.
    pub fn deregister(&self, token: usize) -> Result<()> {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            if !entries.contains(token) {
                return Err(Error::InvalidArg);
            }
            entries.remove(token)
        };
        let fd = unsafe { BorrowedFd::borrow_raw(entry.fd) };
        self.epoll
            .delete(fd)
            .map_err(|e| Error::Protocol(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(())
    }

    /// Collect ready entries, blocking up to `timeout_ms`. A zero timeout
    /// reports every registered entry instead of entering the kernel.
    pub fn wait(&self, timeout_ms: u32) -> Result<Vec<Readiness<T>>> {
        use nix::sys::epoll::{EpollEvent, EpollFlags, EpollTimeout};

        if timeout_ms == 0 {
            let entries = self.entries.lock().unwrap();
            return Ok(entries
                .iter()
                .map(|(_, e)| Readiness {
                    data: e.data.clone(),
                    error: false,
                })
                .collect());
        }

        let mut events = [EpollEvent::empty(); 16];
        let timeout = EpollTimeout::from(timeout_ms.min(u16::MAX as u32) as u16);
        let n = self
            .epoll
            .wait(&mut events, timeout)
            .map_err(|e| Error::Protocol(std::io::Error::from_raw_os_error(e as i32)))?;

        let entries = self.entries.lock().unwrap();
        let mut ready = Vec::with_capacity(n);
        for event in &events[..n] {
            let token = event.data() as usize;
            // The entry may have been deregistered by a concurrent
            // teardown; skip it.
            if let Some(entry) = entries.get(token) {
                let error = event
                    .events()
                    .intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP);
                ready.push(Readiness {
                    data: entry.data.clone(),
                    error,
                });
            }
        }
        Ok(ready)
    }

    /// The multiplexer's own pollable descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }
}

#[cfg(not(target_os = "linux"))]
impl<T: Clone> PollSet<T> {
    pub fn new() -> Result<PollSet<T>> {
        use nix::sys::event::Kqueue;
        let kq = Kqueue::new()
            .map_err(|e| Error::Protocol(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(PollSet {
            entries: Mutex::new(Slab::new()),
            kq,
        })
    }

    pub fn register(&self, fd: BorrowedFd<'_>, data: T) -> Result<usize> {
        use nix::sys::event::{EvFlags, EventFilter, FilterFlag, KEvent};
        let raw = fd.as_raw_fd();
        let token = {
            let mut entries = self.entries.lock().unwrap();
            entries.insert(Entry { fd: raw, data })
        };
        let change = KEvent::new(
            raw as usize,
            EventFilter::EVFILT_READ,
            EvFlags::EV_ADD,
            FilterFlag::empty(),
            0,
            token as isize,
        );
        if let Err(e) = self.kq.kevent(&[change], &mut [], None) {
            self.entries.lock().unwrap().remove(token);
            return Err(Error::Protocol(std::io::Error::from_raw_os_error(e as i32)));
        }
        Ok(token)
    }

    pub fn deregister(&self, token: usize) -> Result<()> {
        use nix::sys::event::{EvFlags, EventFilter, FilterFlag, KEvent};
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            if !entries.contains(token) {
                return Err(Error::InvalidArg);
            }
            entries.remove(token)
        };
        let change = KEvent::new(
            entry.fd as usize,
            EventFilter::EVFILT_READ,
            EvFlags::EV_DELETE,
            FilterFlag::empty(),
            0,
            0,
        );
        self.kq
            .kevent(&[change], &mut [], None)
            .map_err(|e| Error::Protocol(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(())
    }

    pub fn wait(&self, timeout_ms: u32) -> Result<Vec<Readiness<T>>> {
        use nix::sys::event::{EvFlags, EventFilter, FilterFlag, KEvent};

        if timeout_ms == 0 {
            let entries = self.entries.lock().unwrap();
            return Ok(entries
                .iter()
                .map(|(_, e)| Readiness {
                    data: e.data.clone(),
                    error: false,
                })
                .collect());
        }

        let timeout = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
        };
        let mut events = [KEvent::new(
            0,
            EventFilter::EVFILT_READ,
            EvFlags::empty(),
            FilterFlag::empty(),
            0,
            0,
        ); 16];
        let n = self
            .kq
            .kevent(&[], &mut events, Some(timeout))
            .map_err(|e| Error::Protocol(std::io::Error::from_raw_os_error(e as i32)))?;

        let entries = self.entries.lock().unwrap();
        let mut ready = Vec::with_capacity(n);
        for event in &events[..n] {
            let token = event.udata() as usize;
            if let Some(entry) = entries.get(token) {
                ready.push(Readiness {
                    data: entry.data.clone(),
                    error: event.flags().contains(EvFlags::EV_EOF),
                });
            }
        }
        Ok(ready)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        use std::os::fd::AsFd;
        self.kq.as_fd().as_raw_fd()
    }
}
