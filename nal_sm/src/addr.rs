//! Per-peer address records.
//!
//! One [`SmAddr`] exists per peer (plus one self address per class).
//! Sharing across threads, engine queues, op bindings, and user handles
//! goes through `Arc`; the last reference dropped tears down poll-set
//! registrations, notifier descriptors, ring mappings, and - for a
//! listening self address - the copy arena and socket path.

use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::copybuf::CopyBuf;
use crate::engine::SmShared;
use crate::event::Notifier;
use crate::ring::MsgRing;
use crate::shm::SharedRegion;

/// Connection-establishment phase driven by socket readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockProgress {
    /// Server side: waiting for the peer's `(pid, id)`.
    AddrInfo,
    /// Client side: waiting for the connection id and notifier pair.
    ConnId,
    /// Handshake finished.
    Done,
}

/// The socket end held by an address.
pub enum Sock {
    /// Listening self address.
    Listener(UnixListener),
    /// Connected or accepted peer stream.
    Stream(UnixStream),
    None,
}

/// A mapped ring-buffer direction.
pub struct RingMapping {
    region: SharedRegion,
}

impl RingMapping {
    /// Map an existing ring or create one, initializing it when created.
    pub fn new(region: SharedRegion, initialize: bool) -> RingMapping {
        if initialize {
            unsafe { MsgRing::init_in_place(region.as_ptr() as *mut MsgRing) };
        }
        RingMapping { region }
    }

    pub fn ring(&self) -> &MsgRing {
        unsafe { &*(self.region.as_ptr() as *const MsgRing) }
    }
}

/// A mapped copy arena. Accepted addresses share the listening self
/// address's mapping.
pub struct CopyBufMapping {
    region: SharedRegion,
}

impl CopyBufMapping {
    pub fn new(region: SharedRegion, initialize: bool) -> CopyBufMapping {
        if initialize {
            unsafe { CopyBuf::init_in_place(region.as_ptr() as *mut CopyBuf) };
        }
        CopyBufMapping { region }
    }

    pub fn arena(&self) -> &CopyBuf {
        unsafe { &*(self.region.as_ptr() as *const CopyBuf) }
    }
}

/// One shared-memory peer (or the self address).
pub struct SmAddr {
    pub(crate) shared: Weak<SmShared>,
    /// Peer process id. For the self address, our own.
    pub(crate) pid: AtomicU32,
    /// Peer instance id within its process.
    pub(crate) id: AtomicU32,
    /// Connection id assigned by the accepting side.
    pub(crate) conn_id: OnceLock<u32>,
    pub(crate) self_addr: bool,
    /// Created by accept (server side) rather than lookup.
    pub(crate) accepted: bool,
    pub(crate) sock: Mutex<Sock>,
    pub(crate) sock_progress: Mutex<SockProgress>,
    /// Headers we publish for the peer to consume.
    pub(crate) send_ring: OnceLock<RingMapping>,
    /// Headers the peer publishes for us.
    pub(crate) recv_ring: OnceLock<RingMapping>,
    /// The peer's copy arena (lookup side) or the shared self arena
    /// (accept side / listening self).
    pub(crate) copy_buf: OnceLock<Arc<CopyBufMapping>>,
    pub(crate) local_notify: OnceLock<Notifier>,
    pub(crate) remote_notify: OnceLock<Notifier>,
    /// Poll-set tokens for teardown.
    pub(crate) sock_token: Mutex<Option<usize>>,
    pub(crate) notify_token: Mutex<Option<usize>>,
}

impl SmAddr {
    pub(crate) fn new(shared: Weak<SmShared>, pid: i32, id: u32, self_addr: bool, accepted: bool) -> SmAddr {
        SmAddr {
            shared,
            pid: AtomicU32::new(pid as u32),
            id: AtomicU32::new(id),
            conn_id: OnceLock::new(),
            self_addr,
            accepted,
            sock: Mutex::new(Sock::None),
            sock_progress: Mutex::new(SockProgress::Done),
            send_ring: OnceLock::new(),
            recv_ring: OnceLock::new(),
            copy_buf: OnceLock::new(),
            local_notify: OnceLock::new(),
            remote_notify: OnceLock::new(),
            sock_token: Mutex::new(None),
            notify_token: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire) as i32
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn is_self(&self) -> bool {
        self.self_addr
    }

    /// Peers compare equal by `(pid, id)`.
    pub fn same_endpoint(&self, other: &SmAddr) -> bool {
        self.pid() == other.pid() && self.id() == other.id()
    }

    pub(crate) fn send_ring(&self) -> Option<&MsgRing> {
        self.send_ring.get().map(|m| m.ring())
    }

    pub(crate) fn recv_ring(&self) -> Option<&MsgRing> {
        self.recv_ring.get().map(|m| m.ring())
    }

    pub(crate) fn arena(&self) -> Option<&CopyBuf> {
        self.copy_buf.get().map(|m| m.arena())
    }
}

impl Drop for SmAddr {
    fn drop(&mut self) {
        // Deregister from the poll set while the class internals are
        // still alive; when the class itself is being dropped the whole
        // poll set goes with it and deregistration is moot.
        if let Some(shared) = self.shared.upgrade() {
            for token in [
                self.notify_token.get_mut().unwrap().take(),
                self.sock_token.get_mut().unwrap().take(),
            ]
            .into_iter()
            .flatten()
            {
                if let Err(e) = shared.poll.deregister(token) {
                    tracing::warn!(error = %e, "poll deregistration failed during addr teardown");
                }
            }
        }

        // Socket teardown; the listening self address also owns the
        // socket path.
        let sock = std::mem::replace(self.sock.get_mut().unwrap(), Sock::None);
        let was_listener = matches!(sock, Sock::Listener(_));
        drop(sock);
        if was_listener {
            // The class internals may already be gone when the whole
            // class is being dropped; the user name is the same either
            // way.
            let username = match self.shared.upgrade() {
                Some(shared) => shared.username.clone(),
                None => crate::paths::username(),
            };
            crate::sock::remove_sock_path(&crate::paths::sock_path(
                &username,
                self.pid(),
                self.id(),
            ));
        }

        // Notifiers, ring mappings and the copy arena unmap (and unlink,
        // on the creating side) when their fields drop.
    }
}
