//! Operation ids.
//!
//! An op id is a reusable handle bound at post time to a context, a
//! callback, and kind-specific message state. Status bits mirror the
//! lifecycle: an op is born `COMPLETED`; posting clears the status and
//! bumps the reuse gate; completion sets `COMPLETED` again and queues a
//! completion record; the trigger's release hook retires the gate so the
//! op can be posted again.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nal::context::{CompletionData, Context};
use nal::error::Error;
use nal::plugin::{Addr, Callback, CallbackInfo, CallbackPayload};

use crate::addr::SmAddr;

/// Operation has completed (set again at creation so a fresh op is
/// immediately postable).
pub const OP_COMPLETED: u32 = 1 << 0;
/// Operation was canceled.
pub const OP_CANCELED: u32 = 1 << 1;
/// Operation sits in exactly one engine queue.
pub const OP_QUEUED: u32 = 1 << 2;

/// Operation kind, fixed at post time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Lookup,
    SendUnexpected,
    RecvUnexpected,
    SendExpected,
    RecvExpected,
    Put,
    Get,
}

/// Post-time bindings, rewritten on every reuse.
pub struct OpBindings {
    pub kind: OpKind,
    pub context: Option<Context>,
    pub callback: Option<Callback>,
    pub addr: Option<Arc<SmAddr>>,
    /// Message payload: the retry stash for sends, the landing buffer
    /// for receives.
    pub buf: Vec<u8>,
    /// Receive capacity requested at post time.
    pub buf_size: usize,
    /// Bytes actually transferred.
    pub actual_size: usize,
    pub tag: u32,
    /// Completion outcome; `None` until the op completes.
    pub result: Option<Result<(), Error>>,
}

impl OpBindings {
    fn empty() -> OpBindings {
        OpBindings {
            kind: OpKind::Lookup,
            context: None,
            callback: None,
            addr: None,
            buf: Vec::new(),
            buf_size: 0,
            actual_size: 0,
            tag: 0,
            result: None,
        }
    }
}

/// A reusable operation.
pub struct SmOp {
    pub(crate) status: AtomicU32,
    /// Reuse gate: 1 when retired, 2 while posted or completing. Posting
    /// spins on the 1→2 transition so a new post cannot overtake the
    /// previous trigger's release.
    pub(crate) refs: AtomicU32,
    pub(crate) bindings: Mutex<OpBindings>,
}

impl SmOp {
    pub(crate) fn create() -> Arc<SmOp> {
        Arc::new(SmOp {
            status: AtomicU32::new(OP_COMPLETED),
            refs: AtomicU32::new(1),
            bindings: Mutex::new(OpBindings::empty()),
        })
    }

    pub(crate) fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    pub(crate) fn kind(&self) -> OpKind {
        self.bindings.lock().unwrap().kind
    }

    /// Mark completion, folding in a racing cancel: once `COMPLETED` is
    /// set, cancellation is a no-op, and a cancel observed here turns the
    /// outcome into `Canceled`.
    ///
    /// Returns the outcome recorded into the bindings.
    pub(crate) fn mark_completed(&self, result: Result<(), Error>) -> bool {
        let prev = self.status.fetch_or(OP_COMPLETED, Ordering::AcqRel);
        let canceled = prev & OP_CANCELED != 0;
        let mut bindings = self.bindings.lock().unwrap();
        if canceled {
            tracing::debug!("operation was canceled while completing");
            bindings.result = Some(Err(Error::Canceled));
            if bindings.kind == OpKind::RecvUnexpected {
                // Canceled receives surface with no source, tag, or data.
                bindings.addr = None;
                bindings.tag = 0;
                bindings.actual_size = 0;
            }
        } else {
            bindings.result = Some(result);
        }
        canceled
    }
}

impl CompletionData for SmOp {
    fn invoke(&self) -> i32 {
        // Move the pieces out so the bindings lock is not held across
        // user code; the payload buffer is put back afterwards so the op
        // stays reusable without reallocating.
        let (kind, callback, addr, tag, actual, buf, result) = {
            let mut b = self.bindings.lock().unwrap();
            (
                b.kind,
                b.callback.take(),
                b.addr.clone(),
                b.tag,
                b.actual_size,
                std::mem::take(&mut b.buf),
                b.result.take().unwrap_or(Ok(())),
            )
        };

        let addr_handle = addr.map(|a| Addr::new(a));
        let payload = match kind {
            OpKind::Lookup => CallbackPayload::Lookup { addr: addr_handle },
            OpKind::SendUnexpected => CallbackPayload::SendUnexpected,
            OpKind::RecvUnexpected => CallbackPayload::RecvUnexpected {
                source: addr_handle,
                tag,
                data: &buf[..actual.min(buf.len())],
            },
            OpKind::SendExpected => CallbackPayload::SendExpected,
            OpKind::RecvExpected => CallbackPayload::RecvExpected {
                tag,
                data: &buf[..actual.min(buf.len())],
            },
            OpKind::Put => CallbackPayload::Put,
            OpKind::Get => CallbackPayload::Get,
        };
        let info = CallbackInfo { result, payload };

        let ret = match callback {
            Some(cb) => cb(&info),
            None => 0,
        };

        self.bindings.lock().unwrap().buf = buf;
        ret
    }

    fn release(&self) {
        // Drop the address binding before reopening the reuse gate.
        {
            let mut b = self.bindings.lock().unwrap();
            b.addr = None;
            b.context = None;
        }
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 2, "release without a matching post");
    }
}
