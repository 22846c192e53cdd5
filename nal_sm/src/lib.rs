//! # nal_sm - shared-memory transport plugin
//!
//! Implements the `nal` transport interface entirely through POSIX shared
//! memory, UNIX-domain sockets, and event notifications, for peers on the
//! same host.
//!
//! A listening endpoint owns a 64-slot copy arena and a UNIX socket under
//! `<tmpdir>/nal_sm_<user>/<pid>/<id>/sock`. Connecting maps the arena,
//! performs a two-message handshake that passes the notifier descriptors,
//! and maps one lock-free header ring per direction. Message payloads
//! travel through arena slots; one-sided put/get transfers go through
//! cross-process VM copy instead.
//!
//! Addresses look like `sm://<pid>/<id>`.
//!
//! ## Architecture
//!
//! - [`shm`]: POSIX shared-memory regions
//! - [`ring`]: packed message headers and the shared header rings
//! - [`copybuf`]: the copy-slot arena and its availability bitmask
//! - [`event`]: eventfd/FIFO wakeups
//! - [`poll`]: the readiness multiplexer
//! - [`paths`]: on-disk naming and cleanup
//! - [`sock`]: connection-establishment wire messages
//! - [`addr`]: per-peer address records
//! - [`op`]: reusable operation ids
//! - [`engine`]: the transport engine
//! - [`vmcopy`]: cross-process scatter/gather copy

pub mod addr;
pub mod copybuf;
pub mod engine;
pub mod event;
pub mod paths;
pub mod poll;
pub mod ring;
pub mod shm;
pub mod sock;
pub mod vmcopy;

mod op;

use nal::error::Result;
use nal::info::AddrInfo;
use nal::plugin::{InitOpts, Plugin, ProgressMode, Transport};

pub use copybuf::{COPY_BUF_SIZE, NUM_BUFS};
pub use engine::SmTransport;
pub use ring::RING_DEPTH;

/// The shared-memory plugin descriptor. List it first in the plugin
/// table so local-only address strings resolve here.
pub struct SmPlugin;

impl Plugin for SmPlugin {
    fn name(&self) -> &'static str {
        "sm"
    }

    fn check_protocol(&self, protocol: &str) -> bool {
        protocol == "sm"
    }

    fn initialize(
        &self,
        _info: &AddrInfo,
        listen: bool,
        opts: &InitOpts,
    ) -> Result<Box<dyn Transport>> {
        let no_wait = opts.progress_mode.contains(ProgressMode::NO_BLOCK);
        let no_retry = opts.progress_mode.contains(ProgressMode::NO_RETRY);
        Ok(Box::new(SmTransport::new(listen, no_wait, no_retry)?))
    }

    /// The protocol name doubles as the class name, so nothing to
    /// prepend.
    fn prepend_class_in_addr_string(&self) -> bool {
        false
    }

    fn cleanup(&self) {
        paths::cleanup();
    }
}

/// Remove leftover sockets, directories, and SHM objects of the current
/// user from previous runs.
pub fn cleanup() {
    paths::cleanup();
}
