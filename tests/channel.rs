//! End-to-end tests against a hand-rolled mock TStorage server over a real
//! TCP loopback connection, exercising `Channel` the way a real client
//! would: connect, issue conversations, close.
//!
//! The mock server is not a reference implementation of the wire protocol
//! (it trusts that `Channel` frames requests correctly and just answers
//! them); it exists to drive `Channel`'s client-side state machine,
//! buffering, and batching through a real socket rather than asserting on
//! byte strings.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tstorage_client::codec;
use tstorage_client::{Channel, Key, KeyRange, Record, RecordsSet};

struct StoreInner {
    records: Vec<(Key, Vec<u8>)>,
    next_acq: i64,
}

type Store = Arc<Mutex<StoreInner>>;

fn key_in_range(key: &Key, range: &KeyRange) -> bool {
    key.cid >= range.min.cid
        && key.cid < range.max.cid
        && key.mid >= range.min.mid
        && key.mid < range.max.mid
        && key.moid >= range.min.moid
        && key.moid < range.max.moid
        && key.cap >= range.min.cap
        && key.cap < range.max.cap
        && key.acq >= range.min.acq
        && key.acq < range.max.acq
}

fn read_exact_buf(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).expect("mock server read");
    buf
}

fn write_response_header(stream: &mut TcpStream, result: i32, size: u64) {
    let mut buf = [0u8; codec::RESPONSE_HEADER_SIZE];
    codec::write_i32(&mut buf[0..4], result);
    codec::write_u64(&mut buf[4..12], size);
    stream.write_all(&buf).expect("mock server write");
}

fn write_i32_all(stream: &mut TcpStream, v: i32) {
    let mut buf = [0u8; 4];
    codec::write_i32(&mut buf, v);
    stream.write_all(&buf).expect("mock server write");
}

fn write_i64_all(stream: &mut TcpStream, v: i64) {
    let mut buf = [0u8; 8];
    codec::write_i64(&mut buf, v);
    stream.write_all(&buf).expect("mock server write");
}

/// Serves one GET or GETACQ conversation. `acq_only` selects GETACQ's
/// shorter response (no record stream, no tailer).
fn handle_get(stream: &mut TcpStream, store: &Store, acq_only: bool) {
    let min = codec::read_key(&read_exact_buf(stream, codec::KEY_SIZE));
    let max = codec::read_key(&read_exact_buf(stream, codec::KEY_SIZE));
    let range = KeyRange::new(min, max);

    let (matches, confirmed_acq) = {
        let guard = store.lock().unwrap();
        let matches: Vec<(Key, Vec<u8>)> =
            guard.records.iter().filter(|(k, _)| key_in_range(k, &range)).cloned().collect();
        (matches, guard.next_acq)
    };

    write_response_header(stream, 0, 0);
    if acq_only {
        write_i64_all(stream, confirmed_acq);
        return;
    }

    for (key, payload) in &matches {
        let rec_size = (codec::KEY_SIZE + payload.len()) as i32;
        write_i32_all(stream, rec_size);
        let mut key_buf = [0u8; codec::KEY_SIZE];
        codec::write_key(&mut key_buf, key);
        stream.write_all(&key_buf).unwrap();
        stream.write_all(payload).unwrap();
    }
    write_i32_all(stream, codec::RECORD_STREAM_END);
    write_response_header(stream, 0, 0);
    write_i64_all(stream, confirmed_acq);
}

/// Serves one PUT or PUTA conversation: parses cid-grouped batches until
/// the body-wide sentinel, then replies with the assigned `[acq_min,
/// acq_max)` range.
fn handle_put(stream: &mut TcpStream, store: &Store, with_acq: bool) {
    let mut received: Vec<(Key, Vec<u8>)> = Vec::new();

    loop {
        let tag = codec::read_i32(&read_exact_buf(stream, 4));
        if tag == codec::BATCH_SENTINEL {
            break;
        }
        let cid = tag;
        let batch_size = codec::read_i32(&read_exact_buf(stream, 4)) as usize;
        let mut consumed = 0usize;
        while consumed < batch_size {
            let rec_size = codec::read_i32(&read_exact_buf(stream, 4)) as usize;
            let rest = read_exact_buf(stream, rec_size);
            let mid = codec::read_i64(&rest[0..8]);
            let moid = codec::read_i32(&rest[8..12]);
            let cap = codec::read_i64(&rest[12..20]);
            let (acq, payload) =
                if with_acq { (codec::read_i64(&rest[20..28]), rest[28..].to_vec()) } else { (0, rest[20..].to_vec()) };
            received.push((Key::new(cid, mid, moid, cap, acq), payload));
            consumed += 4 + rec_size;
        }
    }

    let (acq_min, acq_max) = {
        let mut guard = store.lock().unwrap();
        if with_acq {
            let acq_min = received.iter().map(|(k, _)| k.acq).min().unwrap_or(guard.next_acq);
            let acq_max = received.iter().map(|(k, _)| k.acq).max().map(|m| m + 1).unwrap_or(guard.next_acq);
            guard.records.extend(received);
            (acq_min, acq_max)
        } else {
            let acq_min = guard.next_acq;
            let acq_max = acq_min + received.len() as i64;
            for (i, (mut key, payload)) in received.into_iter().enumerate() {
                key.acq = acq_min + i as i64;
                guard.records.push((key, payload));
            }
            guard.next_acq = acq_max;
            (acq_min, acq_max)
        }
    };

    write_response_header(stream, 0, 0);
    write_i64_all(stream, acq_min);
    write_i64_all(stream, acq_max);
}

/// Binds a listener, accepts one connection, and dispatches every
/// conversation sent over it until the client closes the socket.
fn spawn_mock_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let store: Store = Arc::new(Mutex::new(StoreInner { records: Vec::new(), next_acq: 0 }));

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_nodelay(true).ok();
        loop {
            let mut cmd_buf = [0u8; 4];
            if stream.read_exact(&mut cmd_buf).is_err() {
                break;
            }
            let cmd = codec::read_i32(&cmd_buf);
            let _size = codec::read_u64(&read_exact_buf(&mut stream, 8));
            match cmd {
                codec::CMD_GET => handle_get(&mut stream, &store, false),
                codec::CMD_GETACQ => handle_get(&mut stream, &store, true),
                codec::CMD_PUTSAFE => handle_put(&mut stream, &store, false),
                codec::CMD_PUTASAFE => handle_put(&mut stream, &store, true),
                other => panic!("mock server got unknown cmd {other}"),
            }
        }
    });

    (addr, handle)
}

fn connected_channel(addr: SocketAddr) -> Channel<Vec<u8>> {
    let mut channel = Channel::new(addr.ip().to_string(), addr.port());
    channel.connect().unwrap();
    channel
}

#[test]
fn empty_put_round_trip() {
    let (addr, _server) = spawn_mock_server();
    let mut channel = connected_channel(addr);

    let records: RecordsSet<Vec<u8>> = RecordsSet::new();
    let (acq_min, acq_max) = channel.put(&records).unwrap();
    assert_eq!(acq_min, acq_max);

    channel.close().unwrap();
}

#[test]
fn three_cid_put_and_get_round_trip() {
    let (addr, _server) = spawn_mock_server();
    let mut channel = connected_channel(addr);

    let mut records = RecordsSet::new();
    for cid in 0..3i32 {
        for mid in 0..10i64 {
            let key = Key::new(cid, mid, 0, cid as i64, 0);
            records.push(Record::new(key, format!("cid{cid}-mid{mid}").into_bytes()));
        }
    }
    let (acq_min, acq_max) = channel.put(&records).unwrap();
    assert_eq!(acq_max - acq_min, 30);

    let (found, result) = channel.get(KeyRange::everything());
    result.unwrap();
    assert_eq!(found.len(), 30);

    let mut expected: Vec<(i32, i64, i32, i64, Vec<u8>)> =
        records.iter().map(|r| (r.key.cid, r.key.mid, r.key.moid, r.key.cap, r.payload.clone())).collect();
    let mut actual: Vec<(i32, i64, i32, i64, Vec<u8>)> =
        found.iter().map(|r| (r.key.cid, r.key.mid, r.key.moid, r.key.cap, r.payload.clone())).collect();
    expected.sort();
    actual.sort();
    assert_eq!(expected, actual);

    channel.close().unwrap();
}

#[test]
fn puta_preserves_user_chosen_acq() {
    let (addr, _server) = spawn_mock_server();
    let mut channel = connected_channel(addr);

    let mut records = RecordsSet::new();
    for mid in 0..30i64 {
        let key = Key::new(1, mid, 0, 0, 1_000 + mid);
        records.push(Record::new(key, vec![mid as u8]));
    }
    channel.puta(&records).unwrap();

    let (found, result) = channel.get(KeyRange::everything());
    result.unwrap();
    assert_eq!(found.len(), 30);
    let mut acqs: Vec<i64> = found.iter().map(|r| r.key.acq).collect();
    acqs.sort();
    let expected: Vec<i64> = (0..30i64).map(|mid| 1_000 + mid).collect();
    assert_eq!(acqs, expected);

    channel.close().unwrap();
}

#[test]
fn streaming_get_under_tight_budget_delivers_in_multiple_batches() {
    let (addr, _server) = spawn_mock_server();
    let mut channel: Channel<Vec<u8>> = Channel::new(addr.ip().to_string(), addr.port());
    channel.set_memory_limit(512);
    channel.connect().unwrap();

    let mut records = RecordsSet::new();
    for mid in 0..10_000i64 {
        records.push(Record::new(Key::new(1, mid, 0, 0, 0), vec![0u8; 4]));
    }
    channel.put(&records).unwrap();

    let mut batches = 0usize;
    let mut seen: Vec<i64> = Vec::new();
    let result = channel.get_stream(KeyRange::everything(), &mut |batch| {
        batches += 1;
        seen.extend(batch.iter().map(|r| r.key.mid));
    });
    result.unwrap();

    assert!(batches >= 2, "expected at least 2 callback invocations, got {batches}");
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 10_000);

    channel.close().unwrap();
}

#[test]
fn invalid_key_range_is_rejected_before_any_socket_activity() {
    let (addr, _server) = spawn_mock_server();
    let mut channel = connected_channel(addr);

    let bad = KeyRange::new(Key::new(-1, 0, 0, 0, 0), Key::new(1, 0, 0, 0, 0));
    let (records, result) = channel.get(bad);
    assert!(records.is_empty());
    assert!(matches!(result.unwrap_err(), tstorage_client::Error::InvalidKey(_)));
    // Validation failures are detected before any I/O, so a channel that
    // was open stays open — unlike every other error path, which aborts.
    assert!(channel.is_open());

    let empty = KeyRange::new(Key::new(5, 5, 5, 5, 5), Key::new(5, 5, 5, 5, 5));
    let (records, result) = channel.get(empty);
    assert!(records.is_empty());
    assert!(matches!(result.unwrap_err(), tstorage_client::Error::EmptyKeyRange));
    assert!(channel.is_open());

    // The connection is still usable after both rejections.
    let (found, result) = channel.get(KeyRange::everything());
    result.unwrap();
    assert!(found.is_empty());

    channel.close().unwrap();
}

#[test]
fn large_payload_round_trips_through_puta_and_get() {
    let (addr, _server) = spawn_mock_server();
    let mut channel: Channel<Vec<u8>> = Channel::new(addr.ip().to_string(), addr.port());
    channel.set_memory_limit(33 * 1024 * 1024);
    channel.connect().unwrap();

    let payload = vec![0xABu8; 32 * 1024 * 1024];
    let mut records = RecordsSet::new();
    records.push(Record::new(Key::new(1, 0, 0, 0, 42), payload.clone()));
    channel.puta(&records).unwrap();

    let (found, result) = channel.get(KeyRange::everything());
    result.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.iter().next().unwrap().payload, payload);

    channel.close().unwrap();
}

#[test]
fn get_acq_returns_confirmation_timestamp_without_streaming() {
    let (addr, _server) = spawn_mock_server();
    let mut channel = connected_channel(addr);

    let mut records = RecordsSet::new();
    records.push(Record::new(Key::new(1, 0, 0, 0, 0), b"x".to_vec()));
    let (_, acq_max) = channel.put(&records).unwrap();

    let confirmed = channel.get_acq(KeyRange::everything()).unwrap();
    assert_eq!(confirmed, acq_max);

    channel.close().unwrap();
}
