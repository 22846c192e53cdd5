//! # nal - pluggable network abstraction layer
//!
//! A uniform asynchronous messaging and one-sided transfer API over
//! pluggable transports. Transports are selected at run time by a
//! URI-like address string of the form `[<class>+]<protocol>[://<host>]`
//! and accessed through per-class [`Class`] handles and per-context
//! [`Context`] completion domains.
//!
//! ## Usage
//!
//! ```ignore
//! use nal::{Class, Context};
//!
//! let plugins: &[&dyn nal::Plugin] = &[&nal_sm::SmPlugin];
//! let class = Class::initialize(plugins, "sm", true)?;
//! let context = Context::new(&class)?;
//!
//! let op = class.op_create();
//! class.addr_lookup(&context, Box::new(|info| { /* ... */ 0 }),
//!     "sm://12345/0", &op)?;
//!
//! loop {
//!     let _ = context.progress(100);
//!     match context.trigger(0, 16) {
//!         Ok(_) | Err(nal::Error::Timeout) => {}
//!         Err(e) => return Err(e),
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`info`]: address-string parsing
//! - [`plugin`]: the [`Plugin`]/[`Transport`] traits and opaque handles
//! - [`class`]: plugin dispatch and class lifecycle
//! - [`context`]: completion queues, trigger loop, multi-progress gate
//! - [`mem`]: memory handles for one-sided transfers
//! - [`error`]: the shared error taxonomy

pub mod class;
pub mod context;
pub mod error;
pub mod info;
pub mod mem;
pub mod plugin;

pub use class::Class;
pub use context::{CompletionData, CompletionRecord, Context};
pub use error::{Error, Result};
pub use info::AddrInfo;
pub use mem::{AccessFlags, MemHandle, Segment};
pub use plugin::{
    Addr, Callback, CallbackInfo, CallbackPayload, InitOpts, OpId, Plugin, ProgressMode, Transport,
};
