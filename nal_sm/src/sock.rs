//! UNIX-domain socket plumbing for connection establishment.
//!
//! Two wire messages only: the client opens with `(pid, id)`, the server
//! answers with `(conn_id)` plus two notifier descriptors as
//! `SCM_RIGHTS` ancillary data. The receiver of the descriptor pair
//! inverts it: the sender's local notifier is the receiver's remote one
//! and vice versa.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use nal::error::{Error, Result};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

/// Pending-connection backlog of the listening socket.
const LISTEN_BACKLOG: i32 = 64;

/// Create the listening socket at `path`, creating parent directories as
/// needed. Non-blocking so accepts can be polled.
pub fn create_listener(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(Error::Protocol)?;
    }
    let listener = UnixListener::bind(path).map_err(Error::Protocol)?;
    listener.set_nonblocking(true).map_err(Error::Protocol)?;
    // std's bind uses its own backlog; re-listen to widen it.
    if unsafe { libc::listen(listener.as_raw_fd(), LISTEN_BACKLOG) } < 0 {
        return Err(Error::Protocol(io::Error::last_os_error()));
    }
    Ok(listener)
}

/// Connect to a peer's listening socket, then switch to non-blocking for
/// the handshake.
pub fn connect(path: &Path) -> Result<UnixStream> {
    let stream = UnixStream::connect(path).map_err(Error::Protocol)?;
    stream.set_nonblocking(true).map_err(Error::Protocol)?;
    Ok(stream)
}

/// Close a listener and remove its socket file plus any now-empty parent
/// directories inside the per-user tree.
pub fn remove_sock_path(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "could not unlink socket");
        }
    }
    let mut dir = path.parent();
    while let Some(d) = dir {
        if std::fs::remove_dir(d).is_err() {
            break; // Not empty or not ours.
        }
        dir = d.parent();
    }
}

/// Client opening message: our `(pid, id)`.
pub fn send_addr_info(sock: &UnixStream, pid: i32, id: u32) -> Result<()> {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&pid.to_ne_bytes());
    buf[4..].copy_from_slice(&id.to_ne_bytes());
    let iov = [IoSlice::new(&buf)];
    sendmsg::<()>(sock.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
        .map_err(|e| Error::Protocol(io::Error::from_raw_os_error(e as i32)))?;
    Ok(())
}

/// Receive the peer's `(pid, id)`. `Ok(None)` when nothing has arrived
/// yet.
pub fn recv_addr_info(sock: &UnixStream) -> Result<Option<(i32, u32)>> {
    let mut buf = [0u8; 8];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let n = match recvmsg::<()>(sock.as_raw_fd(), &mut iov, None, MsgFlags::empty()) {
        Ok(msg) => msg.bytes,
        Err(nix::errno::Errno::EAGAIN) => return Ok(None),
        Err(e) => return Err(Error::Protocol(io::Error::from_raw_os_error(e as i32))),
    };
    if n != buf.len() {
        return Err(Error::protocol("short addr-info message"));
    }
    let pid = i32::from_ne_bytes(buf[..4].try_into().unwrap());
    let id = u32::from_ne_bytes(buf[4..].try_into().unwrap());
    Ok(Some((pid, id)))
}

/// Server answer: the connection id, with the notifier descriptor pair
/// `[local, remote]` attached as ancillary data.
pub fn send_conn_id(sock: &UnixStream, conn_id: u32, local: i32, remote: i32) -> Result<()> {
    let buf = conn_id.to_ne_bytes();
    let iov = [IoSlice::new(&buf)];
    let fds = [local, remote];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|e| Error::Protocol(io::Error::from_raw_os_error(e as i32)))?;
    Ok(())
}

/// Receive the connection id and the inverted notifier pair
/// `(local, remote)`. `Ok(None)` when nothing has arrived yet.
pub fn recv_conn_id(sock: &UnixStream) -> Result<Option<(u32, OwnedFd, OwnedFd)>> {
    let mut buf = [0u8; 4];
    let buf_len = buf.len();
    let mut cmsg_buf = nix::cmsg_space!([std::os::fd::RawFd; 2]);
    let mut iov = [IoSliceMut::new(&mut buf)];
    let msg = match recvmsg::<()>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    ) {
        Ok(msg) => msg,
        Err(nix::errno::Errno::EAGAIN) => return Ok(None),
        Err(e) => return Err(Error::Protocol(io::Error::from_raw_os_error(e as i32))),
    };
    if msg.bytes != buf_len {
        return Err(Error::protocol("short conn-id message"));
    }

    let mut fds = Vec::new();
    let cmsgs = msg
        .cmsgs()
        .map_err(|e| Error::Protocol(io::Error::from_raw_os_error(e as i32)))?;
    for cmsg in cmsgs {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fds.extend(received);
        }
    }
    if fds.len() != 2 {
        return Err(Error::protocol("expected exactly two notifier descriptors"));
    }

    let conn_id = u32::from_ne_bytes(buf);
    // Invert: the sender's local notifier is our remote one.
    let remote = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let local = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok(Some((conn_id, local, remote)))
}
