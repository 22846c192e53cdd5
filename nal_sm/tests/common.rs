//! Common helpers for the shared-memory transport tests.
//!
//! Both endpoints live in one process and are driven from the test
//! thread, the simulated-IPC style: progress with a zero timeout
//! busy-polls the poll set, so no test depends on cross-thread wakeups
//! unless it is specifically about them.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use nal::error::Error;
use nal::plugin::{Addr, CallbackPayload, InitOpts, Plugin, ProgressMode};
use nal::{Class, Context};
use nal_sm::SmPlugin;

pub const DEADLINE: Duration = Duration::from_secs(10);

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

static PLUGIN: SmPlugin = SmPlugin;

pub fn plugins() -> Vec<&'static dyn Plugin> {
    vec![&PLUGIN]
}

/// One endpoint: a class plus one context.
pub struct Endpoint {
    pub class: Class,
    pub context: Context,
}

impl Endpoint {
    pub fn listen() -> Endpoint {
        Self::new(true, ProgressMode::empty())
    }

    pub fn client() -> Endpoint {
        Self::new(false, ProgressMode::empty())
    }

    pub fn new(listen: bool, mode: ProgressMode) -> Endpoint {
        init_logging();
        let opts = InitOpts {
            progress_mode: mode,
        };
        let class = Class::initialize_opt(&plugins(), "sm", listen, &opts).unwrap();
        let context = Context::new(&class).unwrap();
        Endpoint { class, context }
    }

    /// The lookup string peers use to reach this endpoint.
    pub fn self_string(&self) -> String {
        let addr = self.class.addr_self().unwrap();
        let s = self.class.addr_to_string(&addr).unwrap();
        self.class.addr_free(addr).unwrap();
        s
    }

    /// One busy-poll progress pass plus a trigger drain.
    pub fn drive(&self) {
        let _ = self.context.progress(0);
        loop {
            match self.context.trigger(0, 64) {
                Ok(_) => continue,
                Err(Error::Timeout) => break,
                Err(e) => panic!("trigger failed: {e}"),
            }
        }
    }
}

/// Drive both endpoints until `done` reports true.
pub fn drive_until(endpoints: &[&Endpoint], mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        for ep in endpoints {
            ep.drive();
        }
        assert!(start.elapsed() < DEADLINE, "test deadline expired");
        std::thread::yield_now();
    }
}

/// Resolve `name` from `client`, driving `server` along.
pub fn lookup(client: &Endpoint, server: &Endpoint, name: &str) -> Addr {
    let resolved: Arc<Mutex<Option<Addr>>> = Arc::new(Mutex::new(None));
    let op = client.class.op_create();
    let slot = Arc::clone(&resolved);
    client
        .class
        .addr_lookup(
            &client.context,
            Box::new(move |info| {
                assert!(info.result.is_ok(), "lookup failed: {:?}", info.result);
                let CallbackPayload::Lookup { addr } = &info.payload else {
                    panic!("wrong payload kind for lookup");
                };
                *slot.lock().unwrap() = Some(addr.clone().expect("lookup without address"));
                0
            }),
            name,
            &op,
        )
        .unwrap();

    drive_until(&[client, server], || resolved.lock().unwrap().is_some());
    let addr = resolved.lock().unwrap().take().unwrap();
    addr
}

/// Establish a connection and exchange one unexpected message so both
/// sides hold the other's address. Returns
/// `(server_addr_seen_by_client, client_addr_seen_by_server)`.
pub fn connect_pair(server: &Endpoint, client: &Endpoint) -> (Addr, Addr) {
    let server_addr = lookup(client, server, &server.self_string());

    let sent = Arc::new(Mutex::new(false));
    let op = client.class.op_create();
    {
        let sent = Arc::clone(&sent);
        client
            .class
            .msg_send_unexpected(
                &client.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    *sent.lock().unwrap() = true;
                    0
                }),
                b"hello",
                &server_addr,
                0,
                &op,
            )
            .unwrap();
    }

    let source: Arc<Mutex<Option<Addr>>> = Arc::new(Mutex::new(None));
    let recv_op = server.class.op_create();
    {
        let source = Arc::clone(&source);
        server
            .class
            .msg_recv_unexpected(
                &server.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    let CallbackPayload::RecvUnexpected { source: s, data, .. } = &info.payload
                    else {
                        panic!("wrong payload kind");
                    };
                    assert_eq!(*data, b"hello");
                    *source.lock().unwrap() = Some(s.clone().expect("recv without source"));
                    0
                }),
                64,
                &recv_op,
            )
            .unwrap();
    }

    drive_until(&[server, client], || {
        *sent.lock().unwrap() && source.lock().unwrap().is_some()
    });
    let client_addr = source.lock().unwrap().take().unwrap();
    (server_addr, client_addr)
}

/// Deterministic payload for a given size and seed.
pub fn pattern(size: usize, seed: u8) -> Vec<u8> {
    (0..size)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
