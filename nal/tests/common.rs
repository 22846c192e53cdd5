//! Common test utilities for the abstraction-layer tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};

use nal::context::{CompletionData, CompletionRecord, Context};
use nal::error::{Error, Result};
use nal::info::AddrInfo;
use nal::mem::MemHandle;
use nal::plugin::{Addr, Callback, InitOpts, OpId, Plugin, Transport};

/// Install a tracing subscriber filtered by `HG_NA_LOG_LEVEL`.
pub fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env("HG_NA_LOG_LEVEL")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    });
}

type ProgressFn = dyn Fn(u32) -> Result<()> + Send + Sync;

/// Transport stub: every data-plane entry point reports
/// `OpNotSupported`; progress runs a caller-supplied body.
pub struct MockTransport {
    pub protocol: String,
    pub progress_body: Box<ProgressFn>,
}

impl MockTransport {
    fn unsupported<T>() -> Result<T> {
        Err(Error::OpNotSupported)
    }
}

impl Transport for MockTransport {
    fn op_create(&self) -> OpId {
        OpId::new(Arc::new(()))
    }

    fn addr_lookup(&self, _: &Context, _: Callback, _: &str, _: &OpId) -> Result<()> {
        Self::unsupported()
    }

    fn addr_self(&self) -> Result<Addr> {
        Self::unsupported()
    }

    fn addr_cmp(&self, _: &Addr, _: &Addr) -> bool {
        false
    }

    fn addr_is_self(&self, _: &Addr) -> bool {
        false
    }

    fn addr_to_string(&self, _: &Addr) -> Result<String> {
        Ok(format!("{}://x", self.protocol))
    }

    fn msg_max_unexpected_size(&self) -> usize {
        4096
    }

    fn msg_max_expected_size(&self) -> usize {
        4096
    }

    fn msg_max_tag(&self) -> u32 {
        u32::MAX
    }

    fn msg_send_unexpected(
        &self,
        _: &Context,
        _: Callback,
        _: &[u8],
        _: &Addr,
        _: u32,
        _: &OpId,
    ) -> Result<()> {
        Self::unsupported()
    }

    fn msg_recv_unexpected(&self, _: &Context, _: Callback, _: usize, _: &OpId) -> Result<()> {
        Self::unsupported()
    }

    fn msg_send_expected(
        &self,
        _: &Context,
        _: Callback,
        _: &[u8],
        _: &Addr,
        _: u32,
        _: &OpId,
    ) -> Result<()> {
        Self::unsupported()
    }

    fn msg_recv_expected(
        &self,
        _: &Context,
        _: Callback,
        _: usize,
        _: &Addr,
        _: u32,
        _: &OpId,
    ) -> Result<()> {
        Self::unsupported()
    }

    fn put(
        &self,
        _: &Context,
        _: Callback,
        _: &MemHandle,
        _: u64,
        _: &MemHandle,
        _: u64,
        _: u64,
        _: &Addr,
        _: &OpId,
    ) -> Result<()> {
        Self::unsupported()
    }

    fn get(
        &self,
        _: &Context,
        _: Callback,
        _: &MemHandle,
        _: u64,
        _: &MemHandle,
        _: u64,
        _: u64,
        _: &Addr,
        _: &OpId,
    ) -> Result<()> {
        Self::unsupported()
    }

    fn progress(&self, timeout_ms: u32) -> Result<()> {
        (self.progress_body)(timeout_ms)
    }

    fn cancel(&self, _: &OpId) -> Result<()> {
        Self::unsupported()
    }
}

/// Plugin descriptor wrapping [`MockTransport`].
pub struct MockPlugin {
    pub name: &'static str,
    pub protocols: &'static [&'static str],
    pub prepend_class: bool,
}

impl Plugin for MockPlugin {
    fn name(&self) -> &'static str {
        self.name
    }

    fn check_protocol(&self, protocol: &str) -> bool {
        self.protocols.contains(&protocol)
    }

    fn initialize(
        &self,
        info: &AddrInfo,
        _listen: bool,
        _opts: &InitOpts,
    ) -> Result<Box<dyn Transport>> {
        Ok(Box::new(MockTransport {
            protocol: info.protocol_name.clone(),
            progress_body: Box::new(|_| Err(Error::Timeout)),
        }))
    }

    fn prepend_class_in_addr_string(&self) -> bool {
        self.prepend_class
    }
}

/// Completion stub recording its sequence number into a shared log.
pub struct SeqCompletion {
    pub seq: u32,
    pub log: Arc<Mutex<Vec<u32>>>,
    pub released: Arc<AtomicU32>,
}

impl CompletionData for SeqCompletion {
    fn invoke(&self) -> i32 {
        self.log.lock().unwrap().push(self.seq);
        self.seq as i32
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// Push a run of sequence-numbered completions onto a context.
pub fn push_seq(
    context: &Context,
    range: std::ops::Range<u32>,
    log: &Arc<Mutex<Vec<u32>>>,
    released: &Arc<AtomicU32>,
) {
    for seq in range {
        context.completion_add(CompletionRecord::new(Arc::new(SeqCompletion {
            seq,
            log: Arc::clone(log),
            released: Arc::clone(released),
        })));
    }
}
