//! Plugin and transport interfaces.
//!
//! A *plugin* describes one transport implementation: a name, a protocol
//! predicate, and a constructor. Initializing a class walks an
//! order-significant table of plugins and asks the selected one for a
//! [`Transport`], the object every class-level operation is dispatched
//! through.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use bitflags::bitflags;

use crate::context::Context;
use crate::error::Result;
use crate::info::AddrInfo;
use crate::mem::MemHandle;

bitflags! {
    /// Progress-mode hints fixed at class initialization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProgressMode: u32 {
        /// Never block in OS wait primitives; callers busy-poll.
        const NO_BLOCK = 1 << 0;
        /// Fail sends with `Again` instead of queuing them for retry when
        /// transport resources are exhausted.
        const NO_RETRY = 1 << 1;
    }
}

/// Options accepted by `Class::initialize_opt`.
#[derive(Debug, Clone, Default)]
pub struct InitOpts {
    /// Progress-mode hints.
    pub progress_mode: ProgressMode,
}

/// Opaque, reusable operation handle.
///
/// The concrete type behind the handle belongs to the plugin that created
/// it; the core only moves it around.
#[derive(Clone)]
pub struct OpId {
    inner: Arc<dyn Any + Send + Sync>,
}

impl OpId {
    /// Wrap a plugin-defined operation object.
    pub fn new(inner: Arc<dyn Any + Send + Sync>) -> Self {
        OpId { inner }
    }

    /// Recover the plugin's concrete operation type.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }
}

impl std::fmt::Debug for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OpId({:p})", Arc::as_ptr(&self.inner))
    }
}

/// Opaque peer address handle.
///
/// Cloning duplicates the reference; dropping the last clone releases the
/// underlying transport resources.
#[derive(Clone)]
pub struct Addr {
    inner: Arc<dyn Any + Send + Sync>,
}

impl Addr {
    /// Wrap a plugin-defined address object.
    pub fn new(inner: Arc<dyn Any + Send + Sync>) -> Self {
        Addr { inner }
    }

    /// Recover the plugin's concrete address type.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }
}

impl std::fmt::Debug for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Addr({:p})", Arc::as_ptr(&self.inner))
    }
}

/// Kind-specific payload delivered to a completion callback.
#[derive(Debug)]
pub enum CallbackPayload<'a> {
    Lookup {
        /// Resolved peer address; `None` when the lookup was canceled.
        addr: Option<Addr>,
    },
    SendUnexpected,
    RecvUnexpected {
        /// Sender address; `None` when the receive was canceled.
        source: Option<Addr>,
        tag: u32,
        /// Received bytes, valid for the duration of the callback.
        data: &'a [u8],
    },
    SendExpected,
    RecvExpected {
        tag: u32,
        /// Received bytes, valid for the duration of the callback.
        data: &'a [u8],
    },
    Put,
    Get,
}

/// Information passed to a completion callback.
#[derive(Debug)]
pub struct CallbackInfo<'a> {
    /// Outcome of the operation. `Err(Canceled)` for canceled operations.
    pub result: Result<()>,
    /// Kind-specific payload.
    pub payload: CallbackPayload<'a>,
}

/// Completion callback bound to an operation at post time.
///
/// Invoked exactly once per accepted post, from whichever thread runs the
/// trigger loop. The returned integer is collected by the trigger when the
/// caller provides an output array.
pub type Callback = Box<dyn FnOnce(&CallbackInfo<'_>) -> i32 + Send>;

/// One transport implementation, selected and constructed by
/// `Class::initialize`.
pub trait Plugin: Sync {
    /// Class name used to match the `<class>+` prefix of address strings.
    fn name(&self) -> &'static str;

    /// Whether this plugin supports the given protocol name.
    fn check_protocol(&self, protocol: &str) -> bool;

    /// Build the transport. Called once per class.
    fn initialize(&self, info: &AddrInfo, listen: bool, opts: &InitOpts)
        -> Result<Box<dyn Transport>>;

    /// Whether `Class::addr_to_string` should prepend `<class>+` to the
    /// plugin-rendered address string.
    fn prepend_class_in_addr_string(&self) -> bool {
        true
    }

    /// Remove leftover on-disk state from previous runs.
    fn cleanup(&self) {}
}

/// Operations of an initialized transport.
///
/// Implementations are thread-safe at the context level: any number of
/// threads may post concurrently, while the caller (the context's
/// multi-progress gate) guarantees at most one thread inside
/// [`Transport::progress`] per context.
pub trait Transport: Send + Sync {
    /// Allocate a reusable operation id, born completed.
    fn op_create(&self) -> OpId;

    /// Resolve a peer address string. Completes through `callback` with a
    /// `Lookup` payload.
    fn addr_lookup(
        &self,
        context: &Context,
        callback: Callback,
        name: &str,
        op_id: &OpId,
    ) -> Result<()>;

    /// Address of this endpoint.
    fn addr_self(&self) -> Result<Addr>;

    /// Duplicate an address reference.
    fn addr_dup(&self, addr: &Addr) -> Result<Addr> {
        Ok(addr.clone())
    }

    /// Release an address reference.
    fn addr_free(&self, addr: Addr) -> Result<()> {
        drop(addr);
        Ok(())
    }

    /// Whether two addresses refer to the same peer.
    fn addr_cmp(&self, a: &Addr, b: &Addr) -> bool;

    /// Whether the address refers to this endpoint.
    fn addr_is_self(&self, addr: &Addr) -> bool;

    /// Render an address as a string the peer could pass to lookup.
    fn addr_to_string(&self, addr: &Addr) -> Result<String>;

    /// Largest unexpected-message payload.
    fn msg_max_unexpected_size(&self) -> usize;

    /// Largest expected-message payload.
    fn msg_max_expected_size(&self) -> usize;

    /// Largest usable tag value.
    fn msg_max_tag(&self) -> u32;

    /// Post an unexpected-message send.
    #[allow(clippy::too_many_arguments)]
    fn msg_send_unexpected(
        &self,
        context: &Context,
        callback: Callback,
        data: &[u8],
        dest: &Addr,
        tag: u32,
        op_id: &OpId,
    ) -> Result<()>;

    /// Post an unexpected-message receive for up to `buf_size` bytes.
    fn msg_recv_unexpected(
        &self,
        context: &Context,
        callback: Callback,
        buf_size: usize,
        op_id: &OpId,
    ) -> Result<()>;

    /// Post an expected-message send.
    #[allow(clippy::too_many_arguments)]
    fn msg_send_expected(
        &self,
        context: &Context,
        callback: Callback,
        data: &[u8],
        dest: &Addr,
        tag: u32,
        op_id: &OpId,
    ) -> Result<()>;

    /// Pre-post an expected-message receive matching `(source, tag)`.
    #[allow(clippy::too_many_arguments)]
    fn msg_recv_expected(
        &self,
        context: &Context,
        callback: Callback,
        buf_size: usize,
        source: &Addr,
        tag: u32,
        op_id: &OpId,
    ) -> Result<()>;

    /// One-sided write into remote registered memory.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    /// One-sided read from remote registered memory.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    /// Block until transport-internal progress was made, or `timeout_ms`
    /// elapses (`Err(Timeout)`). A timeout of zero polls once.
    fn progress(&self, timeout_ms: u32) -> Result<()>;

    /// Whether it is safe to block in an external poll on
    /// [`Transport::poll_get_fd`].
    fn poll_try_wait(&self) -> bool {
        true
    }

    /// Pollable fd aggregating transport readiness, if the transport has
    /// one.
    fn poll_get_fd(&self) -> Option<RawFd> {
        None
    }

    /// Request cancellation of an operation.
    fn cancel(&self, op_id: &OpId) -> Result<()>;

    /// Tear down the transport. Fails if operations are still queued.
    fn finalize(&self) -> Result<()> {
        Ok(())
    }
}
