//! Class lifecycle and plugin dispatch.
//!
//! A class is one initialized transport plugin. Initialization parses the
//! address string, walks the caller's order-significant plugin table, and
//! hands the parsed info to the selected plugin's constructor. The parsed
//! triple is dropped as soon as initialization returns.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::info::AddrInfo;
use crate::mem::MemHandle;
use crate::plugin::{Addr, Callback, InitOpts, OpId, Plugin, ProgressMode, Transport};

struct ClassInner {
    transport: Box<dyn Transport>,
    plugin_name: String,
    protocol: String,
    listen: bool,
    progress_mode: ProgressMode,
    prepend_class: bool,
}

/// An initialized transport plugin instance.
///
/// Immutable after initialization; cheap to clone (shared reference).
#[derive(Clone)]
pub struct Class {
    inner: Arc<ClassInner>,
}

impl Class {
    /// Initialize with default options.
    pub fn initialize(plugins: &[&dyn Plugin], info_string: &str, listen: bool) -> Result<Class> {
        Class::initialize_opt(plugins, info_string, listen, &InitOpts::default())
    }

    /// Parse `info_string`, select a plugin from the order-significant
    /// table, and initialize it.
    ///
    /// Selection: entries whose name does not match an explicit
    /// `<class>+` prefix are skipped; the first entry whose
    /// `check_protocol` accepts the protocol wins. An explicit class whose
    /// plugin rejects the protocol fails with
    /// [`Error::ProtocolNotSupported`].
    pub fn initialize_opt(
        plugins: &[&dyn Plugin],
        info_string: &str,
        listen: bool,
        opts: &InitOpts,
    ) -> Result<Class> {
        let info = AddrInfo::parse(info_string)?;
        tracing::debug!(
            class = info.class_name.as_deref(),
            protocol = %info.protocol_name,
            host = info.host_name.as_deref(),
            "parsed address string"
        );

        let mut selected = None;
        for plugin in plugins {
            if let Some(class_name) = &info.class_name {
                if plugin.name() != class_name {
                    continue;
                }
            }
            if !plugin.check_protocol(&info.protocol_name) {
                if info.class_name.is_some() {
                    return Err(Error::ProtocolNotSupported);
                }
                continue;
            }
            selected = Some(plugin);
            break;
        }
        let plugin = selected.ok_or(Error::ProtocolNotSupported)?;

        let transport = plugin.initialize(&info, listen, opts)?;
        Ok(Class {
            inner: Arc::new(ClassInner {
                transport,
                plugin_name: plugin.name().to_string(),
                protocol: info.protocol_name,
                listen,
                progress_mode: opts.progress_mode,
                prepend_class: plugin.prepend_class_in_addr_string(),
            }),
        })
    }

    /// Run every plugin's stale-state cleanup.
    pub fn cleanup(plugins: &[&dyn Plugin]) {
        for plugin in plugins {
            plugin.cleanup();
        }
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        &*self.inner.transport
    }

    /// Protocol name this class was initialized with.
    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    /// Name of the selected plugin.
    pub fn plugin_name(&self) -> &str {
        &self.inner.plugin_name
    }

    /// Whether the class was initialized listening.
    pub fn listening(&self) -> bool {
        self.inner.listen
    }

    /// Progress-mode hints fixed at initialization.
    pub fn progress_mode(&self) -> ProgressMode {
        self.inner.progress_mode
    }

    /// Tear down the class. Fails when plugin operations are still
    /// queued.
    pub fn finalize(self) -> Result<()> {
        self.inner.transport.finalize()
    }

    // --- operation wrappers ------------------------------------------

    /// Allocate a reusable operation id.
    pub fn op_create(&self) -> OpId {
        self.inner.transport.op_create()
    }

    /// Resolve a peer address string; completes through `callback`.
    pub fn addr_lookup(
        &self,
        context: &Context,
        callback: Callback,
        name: &str,
        op_id: &OpId,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArg);
        }
        self.inner.transport.addr_lookup(context, callback, name, op_id)
    }

    /// Address of this endpoint.
    pub fn addr_self(&self) -> Result<Addr> {
        self.inner.transport.addr_self()
    }

    /// Duplicate an address reference.
    pub fn addr_dup(&self, addr: &Addr) -> Result<Addr> {
        self.inner.transport.addr_dup(addr)
    }

    /// Release an address reference.
    pub fn addr_free(&self, addr: Addr) -> Result<()> {
        self.inner.transport.addr_free(addr)
    }

    /// Whether two addresses refer to the same peer.
    pub fn addr_cmp(&self, a: &Addr, b: &Addr) -> bool {
        self.inner.transport.addr_cmp(a, b)
    }

    /// Whether the address refers to this endpoint.
    pub fn addr_is_self(&self, addr: &Addr) -> bool {
        self.inner.transport.addr_is_self(addr)
    }

    /// Render an address as a lookup string, prefixed with `<class>+`
    /// when the plugin asks for it.
    pub fn addr_to_string(&self, addr: &Addr) -> Result<String> {
        let s = self.inner.transport.addr_to_string(addr)?;
        if self.inner.prepend_class && self.inner.plugin_name != self.inner.protocol {
            Ok(format!("{}+{}", self.inner.plugin_name, s))
        } else {
            Ok(s)
        }
    }

    /// Largest unexpected-message payload.
    pub fn msg_max_unexpected_size(&self) -> usize {
        self.inner.transport.msg_max_unexpected_size()
    }

    /// Largest expected-message payload.
    pub fn msg_max_expected_size(&self) -> usize {
        self.inner.transport.msg_max_expected_size()
    }

    /// Largest usable tag value.
    pub fn msg_max_tag(&self) -> u32 {
        self.inner.transport.msg_max_tag()
    }

    /// Post an unexpected-message send.
    pub fn msg_send_unexpected(
        &self,
        context: &Context,
        callback: Callback,
        data: &[u8],
        dest: &Addr,
        tag: u32,
        op_id: &OpId,
    ) -> Result<()> {
        self.inner
            .transport
            .msg_send_unexpected(context, callback, data, dest, tag, op_id)
    }

    /// Post an unexpected-message receive.
    pub fn msg_recv_unexpected(
        &self,
        context: &Context,
        callback: Callback,
        buf_size: usize,
        op_id: &OpId,
    ) -> Result<()> {
        self.inner
            .transport
            .msg_recv_unexpected(context, callback, buf_size, op_id)
    }

    /// Post an expected-message send.
    pub fn msg_send_expected(
        &self,
        context: &Context,
        callback: Callback,
        data: &[u8],
        dest: &Addr,
        tag: u32,
        op_id: &OpId,
    ) -> Result<()> {
        self.inner
            .transport
            .msg_send_expected(context, callback, data, dest, tag, op_id)
    }

    /// Pre-post an expected-message receive matching `(source, tag)`.
    pub fn msg_recv_expected(
        &self,
        context: &Context,
        callback: Callback,
        buf_size: usize,
        source: &Addr,
        tag: u32,
        op_id: &OpId,
    ) -> Result<()> {
        self.inner
            .transport
            .msg_recv_expected(context, callback, buf_size, source, tag, op_id)
    }

    /// One-sided write into remote registered memory.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
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
        self.inner.transport.put(
            context,
            callback,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            remote_addr,
            op_id,
        )
    }

    /// One-sided read from remote registered memory.
    #[allow(clippy::too_many_arguments)]
    pub fn get(
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
        self.inner.transport.get(
            context,
            callback,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            remote_addr,
            op_id,
        )
    }

    /// Request cancellation of an operation.
    pub fn cancel(&self, op_id: &OpId) -> Result<()> {
        self.inner.transport.cancel(op_id)
    }

    /// Pollable fd aggregating transport readiness.
    pub fn poll_get_fd(&self) -> Option<RawFd> {
        self.inner.transport.poll_get_fd()
    }
}
