//! End-to-end shared-memory transport tests: two endpoints in one
//! process, driven from the test thread.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{connect_pair, drive_until, lookup, pattern, Endpoint};
use nal::error::Error;
use nal::mem::{AccessFlags, MemHandle, Segment};
use nal::plugin::{Addr, CallbackPayload, ProgressMode};
use nal::Context;

// =============================================================================
// Connection establishment and addressing
// =============================================================================

#[test]
fn self_address_renders_pid_and_id() {
    let server = Endpoint::listen();
    let s = server.self_string();
    let host = s.strip_prefix("sm://").unwrap();
    let (pid, _id) = host.split_once('/').unwrap();
    assert_eq!(pid.parse::<u32>().unwrap(), std::process::id());
}

#[test]
fn lookup_resolves_listening_endpoint() {
    let server = Endpoint::listen();
    let client = Endpoint::client();

    let addr = lookup(&client, &server, &server.self_string());
    assert!(!client.class.addr_is_self(&addr));
    assert_eq!(
        client.class.addr_to_string(&addr).unwrap(),
        server.self_string()
    );

    let dup = client.class.addr_dup(&addr).unwrap();
    assert!(client.class.addr_cmp(&addr, &dup));
    client.class.addr_free(dup).unwrap();
    client.class.addr_free(addr).unwrap();
}

#[test]
fn lookup_of_missing_endpoint_fails_synchronously() {
    let client = Endpoint::client();
    let op = client.class.op_create();
    // No listener with this instance id can exist.
    let name = format!("sm://{}/4000000000", std::process::id());
    let err = client
        .class
        .addr_lookup(&client.context, Box::new(|_| 0), &name, &op)
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[test]
fn addr_self_compares_equal_to_itself() {
    let server = Endpoint::listen();
    let a = server.class.addr_self().unwrap();
    let b = server.class.addr_self().unwrap();
    assert!(server.class.addr_is_self(&a));
    assert!(server.class.addr_cmp(&a, &b));
    server.class.addr_free(a).unwrap();
    server.class.addr_free(b).unwrap();
}

#[test]
fn shm_objects_removed_after_teardown() {
    let name;
    {
        let server = Endpoint::listen();
        let client = Endpoint::client();
        let (server_addr, client_addr) = connect_pair(&server, &client);

        let host = server.self_string();
        let host = host.strip_prefix("sm://").unwrap().to_string();
        let (pid, id) = host.split_once('/').unwrap();
        name = format!("nal_sm_{}-{}-{}", nal_sm::paths::username(), pid, id);
        assert!(nal_sm::shm::SharedRegion::open(&name, 4096).is_ok());

        client.class.addr_free(server_addr).unwrap();
        server.class.addr_free(client_addr).unwrap();
    }
    // The arena object must be unlinked once the listener is gone.
    assert!(nal_sm::shm::SharedRegion::open(&name, 4096).is_err());
}

// =============================================================================
// Unexpected messages
// =============================================================================

/// Send first, post the receive afterwards: the message waits in the
/// unexpected queue until a buffer shows up.
#[test]
fn unexpected_send_before_recv_posted() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let server_addr = lookup(&client, &server, &server.self_string());

    let payload = pattern(17, 3);
    let sent = Arc::new(AtomicU32::new(0));
    let op = client.class.op_create();
    {
        let sent = Arc::clone(&sent);
        client
            .class
            .msg_send_unexpected(
                &client.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    sent.fetch_add(1, Ordering::AcqRel);
                    0
                }),
                &payload,
                &server_addr,
                42,
                &op,
            )
            .unwrap();
    }
    // Let the message arrive before any receive exists.
    drive_until(&[&server, &client], || sent.load(Ordering::Acquire) == 1);
    for _ in 0..10 {
        server.drive();
    }

    let got: Arc<Mutex<Option<(Vec<u8>, u32, String)>>> = Arc::new(Mutex::new(None));
    let recv_op = server.class.op_create();
    {
        let got = Arc::clone(&got);
        let class = server.class.clone();
        server
            .class
            .msg_recv_unexpected(
                &server.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    let CallbackPayload::RecvUnexpected { source, tag, data } = &info.payload
                    else {
                        panic!("wrong payload kind");
                    };
                    let source = source.clone().expect("no source address");
                    let rendered = class.addr_to_string(&source).unwrap();
                    *got.lock().unwrap() = Some((data.to_vec(), *tag, rendered));
                    0
                }),
                4096,
                &recv_op,
            )
            .unwrap();
    }
    drive_until(&[&server, &client], || got.lock().unwrap().is_some());

    let (data, tag, source) = got.lock().unwrap().take().unwrap();
    assert_eq!(data, payload);
    assert_eq!(tag, 42);
    assert_eq!(source, client.self_string());
}

/// The pre-posted path: the receive is queued before the send arrives.
#[test]
fn unexpected_recv_preposted() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let server_addr = lookup(&client, &server, &server.self_string());

    let got: Arc<Mutex<Option<(Vec<u8>, u32)>>> = Arc::new(Mutex::new(None));
    let recv_op = server.class.op_create();
    {
        let got = Arc::clone(&got);
        server
            .class
            .msg_recv_unexpected(
                &server.context,
                Box::new(move |info| {
                    let CallbackPayload::RecvUnexpected { tag, data, .. } = &info.payload else {
                        panic!("wrong payload kind");
                    };
                    *got.lock().unwrap() = Some((data.to_vec(), *tag));
                    0
                }),
                4096,
                &recv_op,
            )
            .unwrap();
    }

    let payload = pattern(300, 9);
    let op = client.class.op_create();
    client
        .class
        .msg_send_unexpected(
            &client.context,
            Box::new(|_| 0),
            &payload,
            &server_addr,
            7,
            &op,
        )
        .unwrap();

    drive_until(&[&server, &client], || got.lock().unwrap().is_some());
    let (data, tag) = got.lock().unwrap().take().unwrap();
    assert_eq!(data, payload);
    assert_eq!(tag, 7);
}

#[test]
fn oversized_send_rejected() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let server_addr = lookup(&client, &server, &server.self_string());

    let op = client.class.op_create();
    let too_big = vec![0u8; 4097];
    let err = client
        .class
        .msg_send_unexpected(
            &client.context,
            Box::new(|_| 0),
            &too_big,
            &server_addr,
            0,
            &op,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Overflow));
    assert_eq!(client.class.msg_max_unexpected_size(), 4096);
    assert_eq!(client.class.msg_max_expected_size(), 4096);
}

// =============================================================================
// Expected messages
// =============================================================================

/// Pre-posted expected receives, posted in reverse tag order, each match
/// the send with their tag.
#[test]
fn expected_reverse_posting_matches_tags() {
    const COUNT: u32 = 100;

    let server = Endpoint::listen();
    let client = Endpoint::client();
    let (server_addr, client_addr) = connect_pair(&server, &client);

    let results: Arc<Mutex<Vec<(u32, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut recv_ops = Vec::new();
    for tag in (0..COUNT).rev() {
        let op = server.class.op_create();
        let results = Arc::clone(&results);
        server
            .class
            .msg_recv_expected(
                &server.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    let CallbackPayload::RecvExpected { tag, data } = &info.payload else {
                        panic!("wrong payload kind");
                    };
                    results.lock().unwrap().push((*tag, data.to_vec()));
                    0
                }),
                4096,
                &client_addr,
                tag,
                &op,
            )
            .unwrap();
        recv_ops.push(op);
    }

    // A burst far beyond the 64 copy slots, so the retry queue engages.
    let sends_done = Arc::new(AtomicU32::new(0));
    let mut send_ops = Vec::new();
    for tag in 0..COUNT {
        let op = client.class.op_create();
        let done = Arc::clone(&sends_done);
        client
            .class
            .msg_send_expected(
                &client.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    done.fetch_add(1, Ordering::AcqRel);
                    0
                }),
                &pattern(64, tag as u8),
                &server_addr,
                tag,
                &op,
            )
            .unwrap();
        send_ops.push(op);
    }

    drive_until(&[&server, &client], || {
        sends_done.load(Ordering::Acquire) == COUNT
            && results.lock().unwrap().len() as u32 == COUNT
    });

    let results = results.lock().unwrap();
    for (tag, data) in results.iter() {
        assert_eq!(*data, pattern(64, *tag as u8), "payload mismatch for tag {tag}");
    }
}

/// For a fixed `(addr, tag)`, the n-th posted receive matches the n-th
/// send.
#[test]
fn expected_same_tag_is_fifo() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let (server_addr, client_addr) = connect_pair(&server, &client);

    let order: Arc<Mutex<Vec<(u32, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut ops = Vec::new();
    for posted in 0..2u32 {
        let op = server.class.op_create();
        let order = Arc::clone(&order);
        server
            .class
            .msg_recv_expected(
                &server.context,
                Box::new(move |info| {
                    let CallbackPayload::RecvExpected { data, .. } = &info.payload else {
                        panic!("wrong payload kind");
                    };
                    order.lock().unwrap().push((posted, data.to_vec()));
                    0
                }),
                64,
                &client_addr,
                5,
                &op,
            )
            .unwrap();
        ops.push(op);
    }

    for i in 0..2u32 {
        let op = client.class.op_create();
        client
            .class
            .msg_send_expected(
                &client.context,
                Box::new(|_| 0),
                &[i as u8; 8],
                &server_addr,
                5,
                &op,
            )
            .unwrap();
        ops.push(op);
    }

    drive_until(&[&server, &client], || order.lock().unwrap().len() == 2);
    let order = order.lock().unwrap();
    assert_eq!(order[0], (0, vec![0u8; 8]));
    assert_eq!(order[1], (1, vec![1u8; 8]));
}

/// Round-trip across the payload size range and a tag sample.
#[test]
fn roundtrip_sizes_and_tags() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let (server_addr, client_addr) = connect_pair(&server, &client);

    for (i, size) in [1usize, 2, 3, 16, 255, 1024, 4095, 4096].into_iter().enumerate() {
        for tag in [0u32, 1, 4242, u32::MAX] {
            let payload = pattern(size, (i as u8).wrapping_add(tag as u8));
            let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));

            let recv_op = server.class.op_create();
            {
                let got = Arc::clone(&got);
                server
                    .class
                    .msg_recv_expected(
                        &server.context,
                        Box::new(move |info| {
                            assert!(info.result.is_ok());
                            let CallbackPayload::RecvExpected { tag: t, data } = &info.payload
                            else {
                                panic!("wrong payload kind");
                            };
                            assert_eq!(*t, tag);
                            *got.lock().unwrap() = Some(data.to_vec());
                            0
                        }),
                        4096,
                        &client_addr,
                        tag,
                        &recv_op,
                    )
                    .unwrap();
            }

            let send_op = client.class.op_create();
            client
                .class
                .msg_send_expected(
                    &client.context,
                    Box::new(|_| 0),
                    &payload,
                    &server_addr,
                    tag,
                    &send_op,
                )
                .unwrap();

            drive_until(&[&server, &client], || got.lock().unwrap().is_some());
            assert_eq!(got.lock().unwrap().take().unwrap(), payload);
        }
    }
}

// =============================================================================
// Copy-slot exhaustion and retries
// =============================================================================

fn fill_arena(client: &Endpoint, server_addr: &Addr) -> Vec<nal::OpId> {
    let mut ops = Vec::new();
    for i in 0..64u32 {
        let op = client.class.op_create();
        client
            .class
            .msg_send_unexpected(
                &client.context,
                Box::new(|_| 0),
                &[1u8; 32],
                server_addr,
                i,
                &op,
            )
            .unwrap();
        ops.push(op);
    }
    ops
}

/// With retries disabled, slot exhaustion surfaces as `Again` and the
/// op id stays reusable.
#[test]
fn slot_exhaustion_no_retry_fails_with_again() {
    let server = Endpoint::listen();
    let client = Endpoint::new(false, ProgressMode::NO_RETRY);
    let server_addr = lookup(&client, &server, &server.self_string());

    // 64 undrained sends take every slot; the server is never driven.
    let _ops = fill_arena(&client, &server_addr);

    let op = client.class.op_create();
    let err = client
        .class
        .msg_send_unexpected(
            &client.context,
            Box::new(|_| 0),
            &[2u8; 32],
            &server_addr,
            64,
            &op,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Again));

    // The failed post leaves the op reusable: drain one message and the
    // same op id goes through.
    let delivered = Arc::new(AtomicU32::new(0));
    let recv_op = server.class.op_create();
    {
        let delivered = Arc::clone(&delivered);
        server
            .class
            .msg_recv_unexpected(
                &server.context,
                Box::new(move |_| {
                    delivered.fetch_add(1, Ordering::AcqRel);
                    0
                }),
                4096,
                &recv_op,
            )
            .unwrap();
    }
    drive_until(&[&server, &client], || delivered.load(Ordering::Acquire) == 1);

    let sent = Arc::new(AtomicU32::new(0));
    {
        let sent = Arc::clone(&sent);
        client
            .class
            .msg_send_unexpected(
                &client.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    sent.fetch_add(1, Ordering::AcqRel);
                    0
                }),
                &[2u8; 32],
                &server_addr,
                64,
                &op,
            )
            .unwrap();
    }
    drive_until(&[&server, &client], || sent.load(Ordering::Acquire) == 1);
}

/// With retries enabled, the 65th send stays queued until the peer
/// drains a message, then completes.
#[test]
fn slot_exhaustion_retries_after_drain() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let server_addr = lookup(&client, &server, &server.self_string());

    let _ops = fill_arena(&client, &server_addr);

    let sent = Arc::new(AtomicU32::new(0));
    let op = client.class.op_create();
    {
        let sent = Arc::clone(&sent);
        client
            .class
            .msg_send_unexpected(
                &client.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    sent.fetch_add(1, Ordering::AcqRel);
                    0
                }),
                &[3u8; 48],
                &server_addr,
                65,
                &op,
            )
            .unwrap();
    }

    // Queued, not failed: nothing completes while the arena stays full.
    for _ in 0..20 {
        client.drive();
    }
    assert_eq!(sent.load(Ordering::Acquire), 0);

    // One drain on the peer frees one slot; the retry then goes out.
    let delivered = Arc::new(AtomicU32::new(0));
    let recv_op = server.class.op_create();
    {
        let delivered = Arc::clone(&delivered);
        server
            .class
            .msg_recv_unexpected(
                &server.context,
                Box::new(move |_| {
                    delivered.fetch_add(1, Ordering::AcqRel);
                    0
                }),
                4096,
                &recv_op,
            )
            .unwrap();
    }
    drive_until(&[&server, &client], || sent.load(Ordering::Acquire) == 1);
}

// =============================================================================
// Cancellation
// =============================================================================

/// Canceling a pending unexpected receive surfaces one `Canceled`
/// completion with no source, tag 0, and no data.
#[test]
fn cancel_pending_unexpected_recv() {
    let server = Endpoint::listen();

    let outcomes: Arc<Mutex<Vec<(bool, bool, u32, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let op = server.class.op_create();
    {
        let outcomes = Arc::clone(&outcomes);
        server
            .class
            .msg_recv_unexpected(
                &server.context,
                Box::new(move |info| {
                    let canceled = matches!(info.result, Err(Error::Canceled));
                    let CallbackPayload::RecvUnexpected { source, tag, data } = &info.payload
                    else {
                        panic!("wrong payload kind");
                    };
                    outcomes
                        .lock()
                        .unwrap()
                        .push((canceled, source.is_some(), *tag, data.len()));
                    0
                }),
                4096,
                &op,
            )
            .unwrap();
    }

    server.class.cancel(&op).unwrap();
    drive_until(&[&server], || !outcomes.lock().unwrap().is_empty());

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0], (true, false, 0, 0));
}

/// Canceling a completed op is a no-op, and the op stays usable.
#[test]
fn cancel_after_completion_is_noop() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let (server_addr, _client_addr) = connect_pair(&server, &client);

    let completions = Arc::new(AtomicU32::new(0));
    let op = client.class.op_create();
    for round in 0..3 {
        let completions_cb = Arc::clone(&completions);
        client
            .class
            .msg_send_unexpected(
                &client.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    completions_cb.fetch_add(1, Ordering::AcqRel);
                    0
                }),
                &[round as u8; 4],
                &server_addr,
                round,
                &op,
            )
            .unwrap();
        drive_until(&[&client, &server], || {
            completions.load(Ordering::Acquire) == round + 1
        });
        client.class.cancel(&op).unwrap();
    }
    assert_eq!(completions.load(Ordering::Acquire), 3);
}

/// Canceling a queued retry send completes it as canceled.
#[test]
fn cancel_queued_retry_send() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let server_addr = lookup(&client, &server, &server.self_string());

    let _ops = fill_arena(&client, &server_addr);

    let outcome: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
    let op = client.class.op_create();
    {
        let outcome = Arc::clone(&outcome);
        client
            .class
            .msg_send_unexpected(
                &client.context,
                Box::new(move |info| {
                    *outcome.lock().unwrap() = Some(matches!(info.result, Err(Error::Canceled)));
                    0
                }),
                &[9u8; 16],
                &server_addr,
                99,
                &op,
            )
            .unwrap();
    }

    client.class.cancel(&op).unwrap();
    drive_until(&[&client], || outcome.lock().unwrap().is_some());
    assert_eq!(*outcome.lock().unwrap(), Some(true));
}

// =============================================================================
// Op reuse
// =============================================================================

/// One op id, posted repeatedly: every post completes exactly once.
#[test]
fn op_id_reuse_across_posts() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let (server_addr, client_addr) = connect_pair(&server, &client);

    let send_op = client.class.op_create();
    let recv_op = server.class.op_create();
    let completions = Arc::new(AtomicU32::new(0));

    for round in 0..20u32 {
        let payload = pattern(128, round as u8);

        let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        {
            let got = Arc::clone(&got);
            server
                .class
                .msg_recv_expected(
                    &server.context,
                    Box::new(move |info| {
                        assert!(info.result.is_ok());
                        let CallbackPayload::RecvExpected { data, .. } = &info.payload else {
                            panic!("wrong payload kind");
                        };
                        *got.lock().unwrap() = Some(data.to_vec());
                        0
                    }),
                    4096,
                    &client_addr,
                    round,
                    &recv_op,
                )
                .unwrap();
        }
        {
            let completions = Arc::clone(&completions);
            client
                .class
                .msg_send_expected(
                    &client.context,
                    Box::new(move |info| {
                        assert!(info.result.is_ok());
                        completions.fetch_add(1, Ordering::AcqRel);
                        0
                    }),
                    &payload,
                    &server_addr,
                    round,
                    &send_op,
                )
                .unwrap();
        }

        drive_until(&[&server, &client], || got.lock().unwrap().is_some());
        assert_eq!(got.lock().unwrap().take().unwrap(), payload);
        assert_eq!(completions.load(Ordering::Acquire), round + 1);
    }
}

/// Posting an op that has not completed yet is refused with `Busy`.
#[test]
fn double_post_is_busy() {
    let server = Endpoint::listen();

    let op = server.class.op_create();
    server
        .class
        .msg_recv_unexpected(&server.context, Box::new(|_| 0), 64, &op)
        .unwrap();
    let err = server
        .class
        .msg_recv_unexpected(&server.context, Box::new(|_| 0), 64, &op)
        .unwrap_err();
    assert!(matches!(err, Error::Busy));

    server.class.cancel(&op).unwrap();
    drive_until(&[&server], || server.context.trigger(0, 16).is_err());
}

// =============================================================================
// Multi-threaded progress
// =============================================================================

/// Two threads progress one context while a message arrives; the
/// completion is delivered exactly once by a trigger elsewhere.
#[test]
fn concurrent_progress_delivers_once() {
    let server = Arc::new(Endpoint::listen());
    let client = Endpoint::client();
    let server_addr = lookup(&client, &server, &server.self_string());

    let delivered = Arc::new(AtomicU32::new(0));
    let recv_op = server.class.op_create();
    {
        let delivered = Arc::clone(&delivered);
        server
            .class
            .msg_recv_unexpected(
                &server.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    delivered.fetch_add(1, Ordering::AcqRel);
                    0
                }),
                4096,
                &recv_op,
            )
            .unwrap();
    }

    let stop = Arc::new(AtomicU32::new(0));
    let mut spinners = Vec::new();
    for _ in 0..2 {
        let context = server.context.clone();
        let stop = Arc::clone(&stop);
        spinners.push(thread::spawn(move || {
            while stop.load(Ordering::Acquire) == 0 {
                match context.progress(50) {
                    Ok(()) | Err(Error::Timeout) => {}
                    Err(e) => panic!("progress failed: {e}"),
                }
            }
        }));
    }

    thread::sleep(Duration::from_millis(30));
    let send_op = client.class.op_create();
    client
        .class
        .msg_send_unexpected(
            &client.context,
            Box::new(|_| 0),
            b"ping",
            &server_addr,
            1,
            &send_op,
        )
        .unwrap();

    // The progress threads observe the message; this thread triggers.
    let start = std::time::Instant::now();
    let mut total = 0usize;
    while total == 0 {
        client.drive();
        match server.context.trigger(10, 16) {
            Ok(n) => total += n,
            Err(Error::Timeout) => {}
            Err(e) => panic!("trigger failed: {e}"),
        }
        assert!(start.elapsed() < common::DEADLINE);
    }
    stop.store(1, Ordering::Release);
    for s in spinners {
        s.join().unwrap();
    }

    assert_eq!(delivered.load(Ordering::Acquire), 1);
    assert_eq!(total, 1);
}

// =============================================================================
// Try-wait
// =============================================================================

#[test]
fn try_wait_reflects_pending_ring_headers() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let (server_addr, _client_addr) = connect_pair(&server, &client);
    server.drive();
    client.drive();

    assert!(server.context.poll_try_wait());

    // An undelivered send leaves a header in the server's recv ring.
    let op = client.class.op_create();
    let sent = Arc::new(AtomicU32::new(0));
    {
        let sent = Arc::clone(&sent);
        client
            .class
            .msg_send_unexpected(
                &client.context,
                Box::new(move |_| {
                    sent.fetch_add(1, Ordering::AcqRel);
                    0
                }),
                b"x",
                &server_addr,
                0,
                &op,
            )
            .unwrap();
    }
    drive_until(&[&client], || sent.load(Ordering::Acquire) == 1);
    assert!(!server.context.poll_try_wait());

    // Draining the ring (into the unexpected-message queue) clears it.
    for _ in 0..10 {
        server.drive();
    }
    assert!(server.context.poll_try_wait());
}

#[test]
fn poll_fd_is_exported() {
    let server = Endpoint::listen();
    assert!(server.class.poll_get_fd().is_some());
}

// =============================================================================
// One-sided transfers
// =============================================================================

struct Segmented {
    bufs: Vec<Vec<u8>>,
}

impl Segmented {
    fn new(lens: &[usize], fill: u8) -> Segmented {
        Segmented {
            bufs: lens.iter().map(|&l| vec![fill; l]).collect(),
        }
    }

    fn handle(&self, flags: AccessFlags) -> MemHandle {
        let segments = self
            .bufs
            .iter()
            .map(|b| Segment {
                base: b.as_ptr() as u64,
                len: b.len() as u64,
            })
            .collect();
        MemHandle::from_segments(segments, flags).unwrap()
    }

    /// The logical byte range `[offset, offset + len)`.
    fn logical(&self, offset: usize, len: usize) -> Vec<u8> {
        let flat: Vec<u8> = self.bufs.iter().flatten().copied().collect();
        flat[offset..offset + len].to_vec()
    }

    fn write_logical(&mut self, offset: usize, data: &[u8]) {
        let mut pos = 0usize;
        for buf in &mut self.bufs {
            for byte in buf.iter_mut() {
                if pos >= offset && pos < offset + data.len() {
                    *byte = data[pos - offset];
                }
                pos += 1;
            }
        }
    }
}

/// Put from a 3-segment local handle into a 2-segment remote handle at
/// offsets, then read it back with get.
#[test]
fn put_get_scattered_offsets() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let (server_addr, _client_addr) = connect_pair(&server, &client);

    let mut local = Segmented::new(&[1024, 2048, 1024], 0);
    let src = pattern(3000, 77);
    local.write_logical(512, &src);
    let remote = Segmented::new(&[2000, 2096], 0);

    let local_handle = local.handle(AccessFlags::READWRITE);
    let remote_handle = remote.handle(AccessFlags::READWRITE);

    let puts = Arc::new(AtomicU32::new(0));
    let op = client.class.op_create();
    {
        let puts = Arc::clone(&puts);
        client
            .class
            .put(
                &client.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    assert!(matches!(info.payload, CallbackPayload::Put));
                    puts.fetch_add(1, Ordering::AcqRel);
                    0
                }),
                &local_handle,
                512,
                &remote_handle,
                100,
                3000,
                &server_addr,
                &op,
            )
            .unwrap();
    }
    drive_until(&[&client], || puts.load(Ordering::Acquire) == 1);
    assert_eq!(remote.logical(100, 3000), src);

    // Read the same range back into fresh local memory.
    let readback = Segmented::new(&[512, 1500, 988], 0);
    let readback_handle = readback.handle(AccessFlags::READWRITE);
    let gets = Arc::new(AtomicU32::new(0));
    let op = client.class.op_create();
    {
        let gets = Arc::clone(&gets);
        client
            .class
            .get(
                &client.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    assert!(matches!(info.payload, CallbackPayload::Get));
                    gets.fetch_add(1, Ordering::AcqRel);
                    0
                }),
                &readback_handle,
                0,
                &remote_handle,
                100,
                3000,
                &server_addr,
                &op,
            )
            .unwrap();
    }
    drive_until(&[&client], || gets.load(Ordering::Acquire) == 1);
    assert_eq!(readback.logical(0, 3000), src);
}

#[test]
fn put_requires_write_access() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let (server_addr, _client_addr) = connect_pair(&server, &client);

    let local = Segmented::new(&[256], 1);
    let remote = Segmented::new(&[256], 0);
    let local_handle = local.handle(AccessFlags::READWRITE);
    let read_only = remote.handle(AccessFlags::READ_ONLY);
    let write_only = remote.handle(AccessFlags::WRITE_ONLY);

    let op = client.class.op_create();
    let err = client
        .class
        .put(
            &client.context,
            Box::new(|_| 0),
            &local_handle,
            0,
            &read_only,
            0,
            256,
            &server_addr,
            &op,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Permission));

    let err = client
        .class
        .get(
            &client.context,
            Box::new(|_| 0),
            &local_handle,
            0,
            &write_only,
            0,
            256,
            &server_addr,
            &op,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Permission));
}

/// A handle that crossed process boundaries by serialization drives the
/// same transfer.
#[test]
fn put_through_serialized_handle() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let (server_addr, _client_addr) = connect_pair(&server, &client);

    let remote = Segmented::new(&[4096], 0);
    let remote_handle = remote.handle(AccessFlags::READWRITE);
    let mut wire = vec![0u8; remote_handle.serialize_size()];
    remote_handle.serialize(&mut wire).unwrap();
    let deserialized = MemHandle::deserialize(&wire).unwrap();

    let local = Segmented::new(&[128], 0);
    let src = pattern(128, 5);
    let mut local = local;
    local.write_logical(0, &src);
    let local_handle = local.handle(AccessFlags::READ_ONLY);

    let done = Arc::new(AtomicU32::new(0));
    let op = client.class.op_create();
    {
        let done = Arc::clone(&done);
        client
            .class
            .put(
                &client.context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    done.fetch_add(1, Ordering::AcqRel);
                    0
                }),
                &local_handle,
                0,
                &deserialized,
                1000,
                128,
                &server_addr,
                &op,
            )
            .unwrap();
    }
    drive_until(&[&client], || done.load(Ordering::Acquire) == 1);
    assert_eq!(remote.logical(1000, 128), src);
}

// =============================================================================
// Trigger interplay
// =============================================================================

/// A send completion wakes a trigger blocked on the sender's context.
#[test]
fn trigger_wakes_on_send_completion() {
    let server = Endpoint::listen();
    let client = Endpoint::client();
    let (server_addr, _client_addr) = connect_pair(&server, &client);

    let client_ctx = client.context.clone();
    let waiter = thread::spawn(move || waiter_body(&client_ctx));

    thread::sleep(Duration::from_millis(20));
    let op = client.class.op_create();
    client
        .class
        .msg_send_unexpected(
            &client.context,
            Box::new(|_| 0),
            b"wake",
            &server_addr,
            0,
            &op,
        )
        .unwrap();

    assert_eq!(waiter.join().unwrap(), 1);
}

fn waiter_body(context: &Context) -> usize {
    context.trigger(5_000, 1).expect("trigger timed out")
}
