//! The shared-memory transport engine.
//!
//! One [`SmTransport`] is the plugin state behind one class: the self
//! address, the poll set, and the bookkeeping queues tying operations to
//! connection and message progress. All data-plane synchronization is the
//! lock-free ring and the copy-slot bitmask; these queues only order
//! operation matching and retries.

use std::collections::VecDeque;
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use nal::context::{CompletionData, CompletionRecord, Context};
use nal::error::{Error, Result};
use nal::mem::{AccessFlags, MemHandle};
use nal::plugin::{Addr, Callback, OpId, Transport};

use crate::addr::{CopyBufMapping, RingMapping, SmAddr, Sock, SockProgress};
use crate::copybuf::{CopyBuf, COPY_BUF_SIZE};
use crate::event::Notifier;
use crate::op::{OpBindings, OpKind, SmOp, OP_CANCELED, OP_COMPLETED, OP_QUEUED};
use crate::poll::PollSet;
use crate::ring::{MsgHdr, MsgRing, MsgType};
use crate::shm::SharedRegion;
use crate::{paths, sock};

/// Minimum spacing between accepted connections.
const ACCEPT_INTERVAL: Duration = Duration::from_millis(100);

/// Instance ids of self addresses created by this process.
static NEXT_INSTANCE_ID: AtomicU32 = AtomicU32::new(0);

/// What a registered descriptor means to the progress dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollKind {
    Accept,
    Sock,
    Notify,
}

/// Dispatch token attached to every poll-set registration.
#[derive(Clone)]
pub(crate) struct PollData {
    pub kind: PollKind,
    pub addr: Weak<SmAddr>,
}

/// An unexpected message that arrived before a receive was posted.
struct UnexpectedMsg {
    source: Arc<SmAddr>,
    data: Vec<u8>,
    tag: u32,
}

/// Class-level shared state. Addresses keep a `Weak` back-reference for
/// teardown.
pub(crate) struct SmShared {
    pub username: String,
    pub no_wait: bool,
    pub no_retry: bool,
    pub poll: PollSet<PollData>,
    pub self_addr: OnceLock<Arc<SmAddr>>,
    /// Next connection id handed to an accepted peer.
    conn_id: AtomicU32,
    last_accept: Mutex<Option<Instant>>,
    /// Server-side connections, kept alive until teardown.
    accepted_addrs: Mutex<Vec<Arc<SmAddr>>>,
    /// Connected addresses whose recv ring is scanned by try-wait.
    poll_addrs: Mutex<Vec<Arc<SmAddr>>>,
    unexpected_msgs: Mutex<VecDeque<UnexpectedMsg>>,
    lookup_ops: Mutex<VecDeque<Arc<SmOp>>>,
    unexpected_ops: Mutex<VecDeque<Arc<SmOp>>>,
    expected_ops: Mutex<VecDeque<Arc<SmOp>>>,
    retry_ops: Mutex<VecDeque<Arc<SmOp>>>,
    /// Serializes local reservations against the shared bitmask.
    copy_buf_lock: Mutex<()>,
}

impl SmShared {
    fn self_addr(&self) -> &Arc<SmAddr> {
        self.self_addr.get().expect("self address is set at initialize")
    }
}

/// The shared-memory transport.
pub struct SmTransport {
    shared: Arc<SmShared>,
}

impl SmTransport {
    /// Build the transport: self address, poll set, and - when listening
    /// - the copy arena and the listening socket.
    pub(crate) fn new(listen: bool, no_wait: bool, no_retry: bool) -> Result<SmTransport> {
        let username = paths::username();
        let pid = std::process::id() as i32;
        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::AcqRel);

        let shared = Arc::new(SmShared {
            username,
            no_wait,
            no_retry,
            poll: PollSet::new()?,
            self_addr: OnceLock::new(),
            conn_id: AtomicU32::new(0),
            last_accept: Mutex::new(None),
            accepted_addrs: Mutex::new(Vec::new()),
            poll_addrs: Mutex::new(Vec::new()),
            unexpected_msgs: Mutex::new(VecDeque::new()),
            lookup_ops: Mutex::new(VecDeque::new()),
            unexpected_ops: Mutex::new(VecDeque::new()),
            expected_ops: Mutex::new(VecDeque::new()),
            retry_ops: Mutex::new(VecDeque::new()),
            copy_buf_lock: Mutex::new(()),
        });

        let self_addr = Arc::new(SmAddr::new(Arc::downgrade(&shared), pid, id, true, false));

        if listen {
            // The listening endpoint owns the copy arena every connection
            // on this endpoint shares.
            let name = paths::copy_buf_name(&shared.username, pid, id);
            let region = SharedRegion::create(&name, CopyBuf::SHM_SIZE)?;
            self_addr
                .copy_buf
                .set(Arc::new(CopyBufMapping::new(region, true)))
                .ok();

            let sock_path = paths::sock_path(&shared.username, pid, id);
            let listener = sock::create_listener(&sock_path)?;
            let token = shared.poll.register(
                unsafe { BorrowedFd::borrow_raw(std::os::unix::io::AsRawFd::as_raw_fd(&listener)) },
                PollData {
                    kind: PollKind::Accept,
                    addr: Arc::downgrade(&self_addr),
                },
            )?;
            *self_addr.sock.lock().unwrap() = Sock::Listener(listener);
            *self_addr.sock_token.lock().unwrap() = Some(token);
        }

        let local = Self::make_notifier(&shared, pid, id, 0, paths::RECV_NAME)?;
        let token = shared.poll.register(
            local.as_fd(),
            PollData {
                kind: PollKind::Notify,
                addr: Arc::downgrade(&self_addr),
            },
        )?;
        self_addr.local_notify.set(local).ok();
        *self_addr.notify_token.lock().unwrap() = Some(token);

        shared.self_addr.set(self_addr).ok();
        tracing::debug!(pid, id, listen, "initialized sm transport");
        Ok(SmTransport { shared })
    }

    #[cfg(target_os = "linux")]
    fn make_notifier(
        _shared: &Arc<SmShared>,
        _pid: i32,
        _id: u32,
        _conn_id: u32,
        _pair_name: &str,
    ) -> Result<Notifier> {
        Notifier::new()
    }

    #[cfg(not(target_os = "linux"))]
    fn make_notifier(
        shared: &Arc<SmShared>,
        pid: i32,
        id: u32,
        conn_id: u32,
        pair_name: &str,
    ) -> Result<Notifier> {
        let path = paths::fifo_path(&shared.username, pid, id, conn_id, pair_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Protocol)?;
        }
        Notifier::new_fifo(&path)
    }

    // --- op plumbing --------------------------------------------------

    fn op_of(op_id: &OpId) -> Result<Arc<SmOp>> {
        op_id.downcast::<SmOp>().ok_or(Error::InvalidArg)
    }

    fn addr_of(addr: &Addr) -> Result<Arc<SmAddr>> {
        addr.downcast::<SmAddr>().ok_or(Error::InvalidArg)
    }

    /// Post-time binding: the op must be completed and fully released.
    fn bind_op(
        op: &Arc<SmOp>,
        kind: OpKind,
        context: &Context,
        callback: Callback,
    ) -> Result<()> {
        if op.status() & OP_COMPLETED == 0 {
            return Err(Error::Busy);
        }
        // Wait for the previous trigger's release to retire before
        // rebinding. Reposting an op from inside its own completion
        // callback would spin here forever; see the crate docs.
        while op
            .refs
            .compare_exchange(1, 2, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::hint::spin_loop();
        }

        let mut b = op.bindings.lock().unwrap();
        let buf = std::mem::take(&mut b.buf);
        *b = OpBindings {
            kind,
            context: Some(context.clone()),
            callback: Some(callback),
            addr: None,
            buf,
            buf_size: 0,
            actual_size: 0,
            tag: 0,
            result: None,
        };
        b.buf.clear();
        drop(b);

        op.status.store(0, Ordering::Release);
        Ok(())
    }

    /// Undo a binding after a synchronous post failure so the op stays
    /// reusable.
    fn abort_post(op: &Arc<SmOp>) {
        {
            let mut b = op.bindings.lock().unwrap();
            b.callback = None;
            b.addr = None;
            b.context = None;
        }
        op.status.store(OP_COMPLETED, Ordering::Release);
        op.refs.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record the outcome and hand the op to its context's completion
    /// queue.
    fn complete(&self, op: &Arc<SmOp>, result: Result<()>) {
        op.mark_completed(result);
        let context = op.bindings.lock().unwrap().context.clone();
        if let Some(context) = context {
            let data: Arc<dyn CompletionData> = op.clone();
            context.completion_add(CompletionRecord::new(data));
        }
    }

    // --- send path ----------------------------------------------------

    fn reserve(&self, arena: &CopyBuf, data: &[u8]) -> Option<usize> {
        let _guard = self.shared.copy_buf_lock.lock().unwrap();
        arena.reserve_and_copy(data)
    }

    /// Publish a reserved slot: header into the peer's ring, wake the
    /// peer, complete locally, wake ourselves.
    fn msg_insert(&self, op: &Arc<SmOp>, addr: &Arc<SmAddr>, ty: MsgType, idx: usize) -> Result<()> {
        let (buf_size, tag) = {
            let b = op.bindings.lock().unwrap();
            (b.buf_size, b.tag)
        };
        let hdr = MsgHdr {
            ty,
            buf_idx: idx as u8,
            buf_size: buf_size as u16,
            tag,
        };
        let ring = addr
            .send_ring()
            .ok_or_else(|| Error::protocol("peer not connected"))?;
        if !ring.push(hdr) {
            addr.arena()
                .expect("arena mapped for a connected peer")
                .release(idx);
            return Err(Error::protocol("send ring full"));
        }

        if !self.shared.no_wait {
            if let Some(remote) = addr.remote_notify.get() {
                remote.set()?;
            }
        }

        self.complete(op, Ok(()));

        if !self.shared.no_wait {
            if let Some(local) = self.shared.self_addr().local_notify.get() {
                if let Err(e) = local.set() {
                    tracing::warn!(error = %e, "could not signal local completion");
                }
            }
        }
        Ok(())
    }

    fn msg_send(
        &self,
        kind: OpKind,
        context: &Context,
        callback: Callback,
        data: &[u8],
        dest: &Addr,
        tag: u32,
        op_id: &OpId,
    ) -> Result<()> {
        if data.len() > COPY_BUF_SIZE {
            return Err(Error::Overflow);
        }
        let addr = Self::addr_of(dest)?;
        let op = Self::op_of(op_id)?;
        Self::bind_op(&op, kind, context, callback)?;
        {
            let mut b = op.bindings.lock().unwrap();
            b.addr = Some(addr.clone());
            b.tag = tag;
            b.buf_size = data.len();
            b.actual_size = data.len();
        }

        let Some(arena) = addr.arena() else {
            Self::abort_post(&op);
            return Err(Error::protocol("peer not connected"));
        };

        let ty = match kind {
            OpKind::SendUnexpected => MsgType::SendUnexpected,
            _ => MsgType::SendExpected,
        };

        match self.reserve(arena, data) {
            Some(idx) => {
                if let Err(e) = self.msg_insert(&op, &addr, ty, idx) {
                    Self::abort_post(&op);
                    return Err(e);
                }
                Ok(())
            }
            None if self.shared.no_retry => {
                Self::abort_post(&op);
                Err(Error::Again)
            }
            None => {
                tracing::debug!(?kind, tag, "copy slots exhausted, queuing for retry");
                op.bindings.lock().unwrap().buf.extend_from_slice(data);
                let mut retries = self.shared.retry_ops.lock().unwrap();
                op.status.fetch_or(OP_QUEUED, Ordering::AcqRel);
                retries.push_back(op.clone());
                Ok(())
            }
        }
    }

    // --- connection establishment ------------------------------------

    fn progress_accept(&self, self_addr: &Arc<SmAddr>) -> Result<bool> {
        if !self_addr.is_self() {
            return Err(Error::protocol("accept readiness on a peer address"));
        }

        // Smooth thundering herds: at most one accept per interval.
        {
            let mut last = self.shared.last_accept.lock().unwrap();
            if let Some(t) = *last {
                if t.elapsed() < ACCEPT_INTERVAL {
                    return Ok(false);
                }
            }
            *last = Some(Instant::now());
        }

        let stream = {
            let sock = self_addr.sock.lock().unwrap();
            let Sock::Listener(listener) = &*sock else {
                return Err(Error::protocol("accept readiness without a listener"));
            };
            match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(Error::Protocol(e)),
            }
        };
        stream.set_nonblocking(true).map_err(Error::Protocol)?;

        let peer = Arc::new(SmAddr::new(
            Arc::downgrade(&self.shared),
            0,
            0,
            false,
            true,
        ));
        // Accepted peers share the listening endpoint's arena mapping.
        if let Some(arena) = self_addr.copy_buf.get() {
            peer.copy_buf.set(Arc::clone(arena)).ok();
        }
        *peer.sock_progress.lock().unwrap() = SockProgress::AddrInfo;

        let token = self.shared.poll.register(
            unsafe { BorrowedFd::borrow_raw(std::os::unix::io::AsRawFd::as_raw_fd(&stream)) },
            PollData {
                kind: PollKind::Sock,
                addr: Arc::downgrade(&peer),
            },
        )?;
        *peer.sock.lock().unwrap() = Sock::Stream(stream);
        *peer.sock_token.lock().unwrap() = Some(token);

        tracing::debug!("accepted incoming connection");
        self.shared.accepted_addrs.lock().unwrap().push(peer);
        Ok(true)
    }

    /// Server side: the peer introduced itself; build the shared channel
    /// and answer with the connection id and notifier pair.
    fn progress_sock_addr_info(&self, addr: &Arc<SmAddr>) -> Result<bool> {
        let received = {
            let sock = addr.sock.lock().unwrap();
            let Sock::Stream(stream) = &*sock else {
                return Err(Error::protocol("socket readiness without a stream"));
            };
            sock::recv_addr_info(stream)?
        };
        let Some((pid, id)) = received else {
            return Ok(false);
        };
        addr.pid.store(pid as u32, Ordering::Release);
        addr.id.store(id, Ordering::Release);

        let self_addr = self.shared.self_addr();
        let (self_pid, self_id) = (self_addr.pid(), self_addr.id());
        let conn_id = self.shared.conn_id.fetch_add(1, Ordering::AcqRel);
        addr.conn_id.set(conn_id).ok();

        // Ring pair, named after this (accepting) endpoint.
        let name = paths::ring_buf_name(
            &self.shared.username,
            self_pid,
            self_id,
            conn_id,
            paths::SEND_NAME,
        );
        let region = SharedRegion::create(&name, MsgRing::SHM_SIZE)?;
        addr.send_ring.set(RingMapping::new(region, true)).ok();

        let name = paths::ring_buf_name(
            &self.shared.username,
            self_pid,
            self_id,
            conn_id,
            paths::RECV_NAME,
        );
        let region = SharedRegion::create(&name, MsgRing::SHM_SIZE)?;
        addr.recv_ring.set(RingMapping::new(region, true)).ok();

        let local = Self::make_notifier(&self.shared, self_pid, self_id, conn_id, paths::RECV_NAME)?;
        let remote = Self::make_notifier(&self.shared, self_pid, self_id, conn_id, paths::SEND_NAME)?;

        let token = self.shared.poll.register(
            local.as_fd(),
            PollData {
                kind: PollKind::Notify,
                addr: Arc::downgrade(addr),
            },
        )?;
        *addr.notify_token.lock().unwrap() = Some(token);

        {
            let sock = addr.sock.lock().unwrap();
            let Sock::Stream(stream) = &*sock else {
                return Err(Error::protocol("socket readiness without a stream"));
            };
            sock::send_conn_id(stream, conn_id, local.as_raw_fd(), remote.as_raw_fd())?;
        }
        addr.local_notify.set(local).ok();
        addr.remote_notify.set(remote).ok();

        self.shared.poll_addrs.lock().unwrap().push(addr.clone());
        *addr.sock_progress.lock().unwrap() = SockProgress::Done;
        tracing::debug!(pid, id, conn_id, "connection established (server)");
        Ok(true)
    }

    /// Client side: the server answered; map its ring pair (directions
    /// swapped) and complete the pending lookup.
    fn progress_sock_conn_id(&self, addr: &Arc<SmAddr>) -> Result<bool> {
        let received = {
            let sock = addr.sock.lock().unwrap();
            let Sock::Stream(stream) = &*sock else {
                return Err(Error::protocol("socket readiness without a stream"));
            };
            sock::recv_conn_id(stream)?
        };
        let Some((conn_id, local_fd, remote_fd)) = received else {
            return Ok(false);
        };
        addr.conn_id.set(conn_id).ok();

        // The server's send ring is our recv ring and vice versa.
        let name = paths::ring_buf_name(
            &self.shared.username,
            addr.pid(),
            addr.id(),
            conn_id,
            paths::RECV_NAME,
        );
        let region = SharedRegion::open(&name, MsgRing::SHM_SIZE)?;
        addr.send_ring.set(RingMapping::new(region, false)).ok();

        let name = paths::ring_buf_name(
            &self.shared.username,
            addr.pid(),
            addr.id(),
            conn_id,
            paths::SEND_NAME,
        );
        let region = SharedRegion::open(&name, MsgRing::SHM_SIZE)?;
        addr.recv_ring.set(RingMapping::new(region, false)).ok();

        let local = Notifier::from_owned_fd(local_fd);
        let remote = Notifier::from_owned_fd(remote_fd);
        let token = self.shared.poll.register(
            local.as_fd(),
            PollData {
                kind: PollKind::Notify,
                addr: Arc::downgrade(addr),
            },
        )?;
        *addr.notify_token.lock().unwrap() = Some(token);
        addr.local_notify.set(local).ok();
        addr.remote_notify.set(remote).ok();

        self.shared.poll_addrs.lock().unwrap().push(addr.clone());
        *addr.sock_progress.lock().unwrap() = SockProgress::Done;

        // Complete the lookup op bound to this address.
        let op = {
            let mut lookups = self.shared.lookup_ops.lock().unwrap();
            let pos = lookups.iter().position(|op| {
                op.bindings
                    .lock()
                    .unwrap()
                    .addr
                    .as_ref()
                    .is_some_and(|a| Arc::ptr_eq(a, addr))
            });
            pos.and_then(|p| lookups.remove(p))
        };
        let Some(op) = op else {
            return Err(Error::protocol("no lookup operation for this connection"));
        };
        tracing::debug!(conn_id, pid = addr.pid(), "connection established (client)");
        self.complete(&op, Ok(()));
        Ok(true)
    }

    fn progress_sock(&self, addr: &Arc<SmAddr>) -> Result<bool> {
        let phase = *addr.sock_progress.lock().unwrap();
        match phase {
            SockProgress::AddrInfo => self.progress_sock_addr_info(addr),
            SockProgress::ConnId => self.progress_sock_conn_id(addr),
            SockProgress::Done => Ok(false),
        }
    }

    // --- message progress --------------------------------------------

    /// Copy a slot out into an op's landing buffer and complete it. An
    /// arriving message larger than the posted buffer completes with
    /// `Overflow` instead of spilling.
    fn deliver(&self, op: &Arc<SmOp>, addr: &Arc<SmAddr>, hdr: MsgHdr) {
        let arena = addr.arena().expect("arena mapped for a connected peer");
        let size = hdr.buf_size as usize;
        let fits = {
            let mut b = op.bindings.lock().unwrap();
            if size <= b.buf.len() {
                let _guard = self.shared.copy_buf_lock.lock().unwrap();
                unsafe { arena.copy_and_release(hdr.buf_idx as usize, &mut b.buf[..size]) };
                b.actual_size = size;
                b.tag = hdr.tag;
                true
            } else {
                arena.release(hdr.buf_idx as usize);
                b.actual_size = 0;
                b.tag = hdr.tag;
                false
            }
        };
        let result = if fits { Ok(()) } else { Err(Error::Overflow) };
        self.complete(op, result);
    }

    fn progress_unexpected(&self, addr: &Arc<SmAddr>, hdr: MsgHdr) -> Result<()> {
        let op = {
            let mut ops = self.shared.unexpected_ops.lock().unwrap();
            let op = ops.pop_front();
            if let Some(op) = &op {
                op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
            }
            op
        };

        match op {
            Some(op) => {
                op.bindings.lock().unwrap().addr = Some(addr.clone());
                self.deliver(&op, addr, hdr);
            }
            None => {
                // No receive posted yet: stash a copy until one arrives.
                let size = hdr.buf_size as usize;
                let mut data = vec![0u8; size];
                let arena = addr.arena().expect("arena mapped for a connected peer");
                {
                    let _guard = self.shared.copy_buf_lock.lock().unwrap();
                    unsafe { arena.copy_and_release(hdr.buf_idx as usize, &mut data) };
                }
                self.shared
                    .unexpected_msgs
                    .lock()
                    .unwrap()
                    .push_back(UnexpectedMsg {
                        source: addr.clone(),
                        data,
                        tag: hdr.tag,
                    });
            }
        }
        Ok(())
    }

    fn progress_expected(&self, addr: &Arc<SmAddr>, hdr: MsgHdr) -> Result<()> {
        let op = {
            let mut ops = self.shared.expected_ops.lock().unwrap();
            let pos = ops.iter().position(|op| {
                let b = op.bindings.lock().unwrap();
                b.tag == hdr.tag
                    && b.addr.as_ref().is_some_and(|a| Arc::ptr_eq(a, addr))
            });
            match pos.and_then(|p| ops.remove(p)) {
                Some(op) => {
                    op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
                    op
                }
                // Expected receives must be pre-posted.
                None => return Err(Error::InvalidArg),
            }
        };
        self.deliver(&op, addr, hdr);
        Ok(())
    }

    /// Drain the retry queue head-first while slots can be reserved.
    /// Reports whether any queued send went out.
    fn progress_retries(&self) -> Result<bool> {
        let mut inserted = false;
        loop {
            let op = {
                let retries = self.shared.retry_ops.lock().unwrap();
                retries.front().cloned()
            };
            let Some(op) = op else { break };

            let (addr, data, kind) = {
                let b = op.bindings.lock().unwrap();
                let Some(addr) = b.addr.clone() else { break };
                (addr, b.buf.clone(), b.kind)
            };
            let Some(arena) = addr.arena() else { break };
            tracing::debug!(?kind, "attempting send retry");
            let Some(idx) = self.reserve(arena, &data) else {
                break;
            };

            let mut canceled = false;
            {
                let mut retries = self.shared.retry_ops.lock().unwrap();
                if op.status() & OP_CANCELED != 0 {
                    // Cancel owns the dequeue; just give the slot back.
                    canceled = true;
                    arena.release(idx);
                } else if let Some(pos) = retries.iter().position(|o| Arc::ptr_eq(o, &op)) {
                    retries.remove(pos);
                    op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
                } else {
                    // Removed concurrently; give the slot back.
                    canceled = true;
                    arena.release(idx);
                }
            }

            if !canceled {
                let ty = match kind {
                    OpKind::SendUnexpected => MsgType::SendUnexpected,
                    _ => MsgType::SendExpected,
                };
                // The retried payload was already copied into the slot by
                // reserve; clear the stash before publishing.
                op.bindings.lock().unwrap().buf.clear();
                self.msg_insert(&op, &addr, ty, idx)?;
                inserted = true;
            }
        }
        Ok(inserted)
    }

    fn progress_notify(&self, addr: &Arc<SmAddr>) -> Result<bool> {
        if addr.is_self() {
            // Local completion notification: just clear the edge.
            if self.shared.no_wait {
                return Ok(false);
            }
            let notifier = addr
                .local_notify
                .get()
                .ok_or_else(|| Error::protocol("self address has no notifier"))?;
            return notifier.get();
        }

        if !self.shared.no_wait {
            let notifier = addr
                .local_notify
                .get()
                .ok_or_else(|| Error::protocol("peer has no notifier"))?;
            if !notifier.get()? {
                return Ok(false);
            }
        }

        let Some(ring) = addr.recv_ring() else {
            return Ok(false);
        };
        let Some(hdr) = ring.pop() else {
            return Ok(false);
        };

        match hdr.ty {
            MsgType::SendUnexpected => self.progress_unexpected(addr, hdr)?,
            MsgType::SendExpected => self.progress_expected(addr, hdr)?,
        }

        // A drained message may have freed the slot a queued send waits
        // for.
        if !self.shared.no_retry {
            let _ = self.progress_retries()?;
        }
        Ok(true)
    }

    /// Peer disconnect: unregister, drop queue references, and cancel
    /// every op still bound to the peer.
    fn teardown_peer(&self, addr: &Arc<SmAddr>) -> Result<()> {
        tracing::debug!(pid = addr.pid(), id = addr.id(), "tearing down peer");

        for token in [
            addr.notify_token.lock().unwrap().take(),
            addr.sock_token.lock().unwrap().take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = self.shared.poll.deregister(token);
        }
        self.shared
            .poll_addrs
            .lock()
            .unwrap()
            .retain(|a| !Arc::ptr_eq(a, addr));
        self.shared
            .accepted_addrs
            .lock()
            .unwrap()
            .retain(|a| !Arc::ptr_eq(a, addr));
        *addr.sock.lock().unwrap() = Sock::None;

        // Ops bound to the peer complete through the cancellation path.
        for queue in [
            &self.shared.lookup_ops,
            &self.shared.expected_ops,
            &self.shared.retry_ops,
        ] {
            let orphans: Vec<Arc<SmOp>> = {
                let mut ops = queue.lock().unwrap();
                let (keep, orphaned): (VecDeque<_>, VecDeque<_>) =
                    ops.drain(..).partition(|op| {
                        !op.bindings
                            .lock()
                            .unwrap()
                            .addr
                            .as_ref()
                            .is_some_and(|a| Arc::ptr_eq(a, addr))
                    });
                *ops = keep;
                orphaned.into()
            };
            for op in orphans {
                op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
                op.status.fetch_or(OP_CANCELED, Ordering::AcqRel);
                self.complete(&op, Ok(()));
            }
        }
        Ok(())
    }

    fn dispatch(&self, data: &PollData, error: bool) -> Result<bool> {
        let Some(addr) = data.addr.upgrade() else {
            return Ok(false);
        };
        if error {
            if addr.is_self() {
                return Err(Error::protocol("error on a self descriptor"));
            }
            self.teardown_peer(&addr)?;
            return Ok(true);
        }
        match data.kind {
            PollKind::Accept => self.progress_accept(&addr),
            PollKind::Sock => {
                if addr.is_self() {
                    Ok(false)
                } else {
                    self.progress_sock(&addr)
                }
            }
            PollKind::Notify => self.progress_notify(&addr),
        }
    }
}

impl Transport for SmTransport {
    fn op_create(&self) -> OpId {
        OpId::new(SmOp::create())
    }

    fn addr_lookup(
        &self,
        context: &Context,
        callback: Callback,
        name: &str,
        op_id: &OpId,
    ) -> Result<()> {
        // Accept both "sm://<pid>/<id>" and a bare "<pid>/<id>".
        let host = match name.find("://") {
            Some(idx) => &name[idx + 3..],
            None => name,
        };
        let (pid, id) = host
            .split_once('/')
            .and_then(|(pid, id)| Some((pid.parse::<i32>().ok()?, id.parse::<u32>().ok()?)))
            .ok_or(Error::InvalidArg)?;

        let op = Self::op_of(op_id)?;
        Self::bind_op(&op, OpKind::Lookup, context, callback)?;

        let addr = Arc::new(SmAddr::new(
            Arc::downgrade(&self.shared),
            pid,
            id,
            false,
            false,
        ));
        op.bindings.lock().unwrap().addr = Some(addr.clone());

        let fallible = || -> Result<()> {
            // Map the peer's copy arena.
            let name = paths::copy_buf_name(&self.shared.username, pid, id);
            let region = SharedRegion::open(&name, CopyBuf::SHM_SIZE)?;
            addr.copy_buf
                .set(Arc::new(CopyBufMapping::new(region, false)))
                .ok();

            // Connect and start the handshake.
            let stream = sock::connect(&paths::sock_path(&self.shared.username, pid, id))?;
            *addr.sock_progress.lock().unwrap() = SockProgress::ConnId;

            // Queue the op before the descriptor can fire.
            self.shared.lookup_ops.lock().unwrap().push_back(op.clone());

            let register = |stream: &UnixStream| {
                self.shared.poll.register(
                    unsafe {
                        BorrowedFd::borrow_raw(std::os::unix::io::AsRawFd::as_raw_fd(stream))
                    },
                    PollData {
                        kind: PollKind::Sock,
                        addr: Arc::downgrade(&addr),
                    },
                )
            };
            match register(&stream) {
                Ok(token) => *addr.sock_token.lock().unwrap() = Some(token),
                Err(e) => {
                    self.shared
                        .lookup_ops
                        .lock()
                        .unwrap()
                        .retain(|o| !Arc::ptr_eq(o, &op));
                    return Err(e);
                }
            }

            let self_addr = self.shared.self_addr();
            if let Err(e) = sock::send_addr_info(&stream, self_addr.pid(), self_addr.id()) {
                self.shared
                    .lookup_ops
                    .lock()
                    .unwrap()
                    .retain(|o| !Arc::ptr_eq(o, &op));
                return Err(e);
            }
            *addr.sock.lock().unwrap() = Sock::Stream(stream);
            Ok(())
        };

        if let Err(e) = fallible() {
            Self::abort_post(&op);
            return Err(e);
        }
        tracing::debug!(pid, id, "lookup posted");
        Ok(())
    }

    fn addr_self(&self) -> Result<Addr> {
        Ok(Addr::new(self.shared.self_addr().clone()))
    }

    fn addr_cmp(&self, a: &Addr, b: &Addr) -> bool {
        match (Self::addr_of(a), Self::addr_of(b)) {
            (Ok(a), Ok(b)) => a.same_endpoint(&b),
            _ => false,
        }
    }

    fn addr_is_self(&self, addr: &Addr) -> bool {
        Self::addr_of(addr).map(|a| a.is_self()).unwrap_or(false)
    }

    fn addr_to_string(&self, addr: &Addr) -> Result<String> {
        let addr = Self::addr_of(addr)?;
        Ok(format!("sm://{}/{}", addr.pid(), addr.id()))
    }

    fn msg_max_unexpected_size(&self) -> usize {
        COPY_BUF_SIZE
    }

    fn msg_max_expected_size(&self) -> usize {
        COPY_BUF_SIZE
    }

    fn msg_max_tag(&self) -> u32 {
        u32::MAX
    }

    fn msg_send_unexpected(
        &self,
        context: &Context,
        callback: Callback,
        data: &[u8],
        dest: &Addr,
        tag: u32,
        op_id: &OpId,
    ) -> Result<()> {
        self.msg_send(
            OpKind::SendUnexpected,
            context,
            callback,
            data,
            dest,
            tag,
            op_id,
        )
    }

    fn msg_recv_unexpected(
        &self,
        context: &Context,
        callback: Callback,
        buf_size: usize,
        op_id: &OpId,
    ) -> Result<()> {
        if buf_size > COPY_BUF_SIZE {
            return Err(Error::Overflow);
        }
        let op = Self::op_of(op_id)?;
        Self::bind_op(&op, OpKind::RecvUnexpected, context, callback)?;
        {
            let mut b = op.bindings.lock().unwrap();
            b.buf_size = buf_size;
            b.buf.resize(buf_size, 0);
        }

        // A message may already be waiting.
        let pending = self.shared.unexpected_msgs.lock().unwrap().pop_front();
        match pending {
            Some(msg) => {
                let fits = msg.data.len() <= buf_size;
                {
                    let mut b = op.bindings.lock().unwrap();
                    b.addr = Some(msg.source);
                    b.tag = msg.tag;
                    if fits {
                        b.buf[..msg.data.len()].copy_from_slice(&msg.data);
                        b.actual_size = msg.data.len();
                    } else {
                        b.actual_size = 0;
                    }
                }
                let result = if fits { Ok(()) } else { Err(Error::Overflow) };
                self.complete(&op, result);
            }
            None => {
                let mut ops = self.shared.unexpected_ops.lock().unwrap();
                op.status.fetch_or(OP_QUEUED, Ordering::AcqRel);
                ops.push_back(op.clone());
            }
        }
        Ok(())
    }

    fn msg_send_expected(
        &self,
        context: &Context,
        callback: Callback,
        data: &[u8],
        dest: &Addr,
        tag: u32,
        op_id: &OpId,
    ) -> Result<()> {
        self.msg_send(
            OpKind::SendExpected,
            context,
            callback,
            data,
            dest,
            tag,
            op_id,
        )
    }

    fn msg_recv_expected(
        &self,
        context: &Context,
        callback: Callback,
        buf_size: usize,
        source: &Addr,
        tag: u32,
        op_id: &OpId,
    ) -> Result<()> {
        if buf_size > COPY_BUF_SIZE {
            return Err(Error::Overflow);
        }
        let source = Self::addr_of(source)?;
        let op = Self::op_of(op_id)?;
        Self::bind_op(&op, OpKind::RecvExpected, context, callback)?;
        {
            let mut b = op.bindings.lock().unwrap();
            b.addr = Some(source);
            b.tag = tag;
            b.buf_size = buf_size;
            b.buf.resize(buf_size, 0);
        }

        // Expected receives are always pre-posted; the matching header
        // cannot have arrived yet.
        let mut ops = self.shared.expected_ops.lock().unwrap();
        op.status.fetch_or(OP_QUEUED, Ordering::AcqRel);
        ops.push_back(op.clone());
        Ok(())
    }

    fn put(
        &self,
        context: &Context,
        callback: Callback,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        remote_addr: &Addr,
        op_id: &OpId,
    ) -> Result<()> {
        if !remote.flags().contains(AccessFlags::WRITE) {
            return Err(Error::Permission);
        }
        let addr = Self::addr_of(remote_addr)?;
        let local_segs = local.translate(local_offset, length)?;
        let remote_segs = remote.translate(remote_offset, length)?;

        let op = Self::op_of(op_id)?;
        Self::bind_op(&op, OpKind::Put, context, callback)?;
        op.bindings.lock().unwrap().addr = Some(addr.clone());

        let written = match unsafe { crate::vmcopy::write(addr.pid(), &local_segs, &remote_segs) } {
            Ok(n) => n,
            Err(e) => {
                Self::abort_post(&op);
                return Err(e);
            }
        };
        if written as u64 != length {
            Self::abort_post(&op);
            return Err(Error::MsgSize);
        }

        self.complete(&op, Ok(()));
        if !self.shared.no_wait {
            if let Some(local) = self.shared.self_addr().local_notify.get() {
                let _ = local.set();
            }
        }
        Ok(())
    }

    fn get(
        &self,
        context: &Context,
        callback: Callback,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        remote_addr: &Addr,
        op_id: &OpId,
    ) -> Result<()> {
        if !remote.flags().contains(AccessFlags::READ) {
            return Err(Error::Permission);
        }
        let addr = Self::addr_of(remote_addr)?;
        let local_segs = local.translate(local_offset, length)?;
        let remote_segs = remote.translate(remote_offset, length)?;

        let op = Self::op_of(op_id)?;
        Self::bind_op(&op, OpKind::Get, context, callback)?;
        op.bindings.lock().unwrap().addr = Some(addr.clone());

        let read = match unsafe { crate::vmcopy::read(addr.pid(), &local_segs, &remote_segs) } {
            Ok(n) => n,
            Err(e) => {
                Self::abort_post(&op);
                return Err(e);
            }
        };
        if read as u64 != length {
            Self::abort_post(&op);
            return Err(Error::MsgSize);
        }

        self.complete(&op, Ok(()));
        if !self.shared.no_wait {
            if let Some(local) = self.shared.self_addr().local_notify.get() {
                let _ = local.set();
            }
        }
        Ok(())
    }

    fn progress(&self, timeout_ms: u32) -> Result<()> {
        let mut remaining = Duration::from_millis(timeout_ms as u64);
        loop {
            let start = Instant::now();
            let ready = self.shared.poll.wait(remaining.as_millis() as u32)?;
            let mut progressed = false;
            for readiness in &ready {
                progressed |= self.dispatch(&readiness.data, readiness.error)?;
            }
            // A peer may have freed copy slots without sending anything
            // our way; sweep the retry queue on every pass.
            if !self.shared.no_retry {
                progressed |= self.progress_retries()?;
            }
            if progressed {
                return Ok(());
            }
            remaining = remaining.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
        }
    }

    fn poll_try_wait(&self) -> bool {
        let poll_addrs = self.shared.poll_addrs.lock().unwrap();
        for addr in poll_addrs.iter() {
            if let Some(ring) = addr.recv_ring() {
                if !ring.is_empty() {
                    return false;
                }
            }
        }
        true
    }

    fn poll_get_fd(&self) -> Option<std::os::unix::io::RawFd> {
        Some(self.shared.poll.as_raw_fd())
    }

    fn cancel(&self, op_id: &OpId) -> Result<()> {
        let op = Self::op_of(op_id)?;
        let prev = op.status.fetch_or(OP_CANCELED, Ordering::AcqRel);
        if prev & OP_COMPLETED != 0 {
            // Completion won the race.
            return Ok(());
        }
        tracing::debug!("canceling operation");

        let queue = match op.kind() {
            OpKind::RecvUnexpected => Some(&self.shared.unexpected_ops),
            OpKind::RecvExpected => Some(&self.shared.expected_ops),
            OpKind::SendUnexpected | OpKind::SendExpected => Some(&self.shared.retry_ops),
            // Lookups, puts, and gets cannot be unqueued; a racing
            // completion surfaces the cancel.
            OpKind::Lookup | OpKind::Put | OpKind::Get => None,
        };

        let mut canceled = false;
        if let Some(queue) = queue {
            let mut ops = queue.lock().unwrap();
            if op.status() & OP_QUEUED != 0 {
                if let Some(pos) = ops.iter().position(|o| Arc::ptr_eq(o, &op)) {
                    ops.remove(pos);
                    op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
                    canceled = true;
                }
            }
        }

        if canceled {
            self.complete(&op, Ok(()));
        }
        Ok(())
    }

    fn finalize(&self) -> Result<()> {
        for (queue, what) in [
            (&self.shared.lookup_ops, "lookup"),
            (&self.shared.unexpected_ops, "unexpected"),
            (&self.shared.expected_ops, "expected"),
            (&self.shared.retry_ops, "retry"),
        ] {
            if !queue.lock().unwrap().is_empty() {
                tracing::warn!(queue = what, "finalize with queued operations");
                return Err(Error::Busy);
            }
        }
        self.shared.poll_addrs.lock().unwrap().clear();
        self.shared.accepted_addrs.lock().unwrap().clear();
        self.shared.unexpected_msgs.lock().unwrap().clear();
        Ok(())
    }
}
