//! End-to-end push/pull over a local RDMA device.
//!
//! These tests drive two Vans (one worker, one server) in the same process
//! over the loopback path of whatever RDMA device is present (a SoftRoCE
//! `rxe` device is enough). They are ignored by default because CI machines
//! rarely have one; run them with
//!
//! ```bash
//! cargo test --package rdmavan --test loopback -- --ignored --test-threads 1
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rdmavan::message::Segment;
use rdmavan::{Config, Message, Node, Role, Van};

const SERVER_ID: i32 = 8;
const WORKER_ID: i32 = 9;

fn local_hostname() -> String {
    std::env::var("RDMAVAN_TEST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn make_node(id: i32, role: Role, port: u16) -> Node {
    Node {
        id,
        role,
        hostname: local_hostname(),
        port,
    }
}

fn server_config() -> Config {
    Config {
        role: Some("server".into()),
        ..Config::default()
    }
}

fn worker_config() -> Config {
    Config {
        role: Some("worker".into()),
        ..Config::default()
    }
}

/// In-process parameter server storing one value blob per (key, sender).
fn run_server(van: Arc<Van>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut store: std::collections::HashMap<u64, Vec<u8>> = Default::default();
        while !stop.load(Ordering::Acquire) {
            let mut msg = Message::default();
            if van.recv_msg(&mut msg).is_err() {
                break;
            }
            if !msg.meta.is_pushpull() || !msg.meta.request {
                continue;
            }
            let mut resp = Message::default();
            resp.meta.recver = msg.meta.sender;
            resp.meta.key = msg.meta.key;
            resp.meta.push = msg.meta.push;
            resp.meta.request = false;
            if msg.meta.push {
                // keep a copy; the view dies with the landing buffer
                store.insert(msg.meta.key, msg.data[1].as_slice().to_vec());
            } else {
                let vals = store.get(&msg.meta.key).expect("pull before push").clone();
                let len = vals.len() as i32;
                resp.data = vec![
                    Segment::copy_of(&msg.meta.key.to_le_bytes()),
                    Segment::from_vec(vals),
                    Segment::copy_of(&len.to_le_bytes()),
                ];
            }
            van.send_msg(&mut resp).expect("server response");
        }
    })
}

fn push(van: &Van, key: u64, vals: &Segment) -> usize {
    let mut msg = Message::default();
    msg.meta.recver = SERVER_ID;
    msg.meta.request = true;
    msg.meta.push = true;
    msg.data = vec![
        Segment::copy_of(&key.to_le_bytes()),
        vals.clone(),
        Segment::copy_of(&(vals.len() as i32).to_le_bytes()),
    ];
    van.send_msg(&mut msg).expect("push")
}

fn pull(van: &Van, key: u64) -> Message {
    let mut msg = Message::default();
    msg.meta.recver = SERVER_ID;
    msg.meta.request = true;
    msg.meta.push = false;
    msg.data = vec![Segment::copy_of(&key.to_le_bytes())];
    van.send_msg(&mut msg).expect("pull request");

    let mut resp = Message::default();
    loop {
        van.recv_msg(&mut resp).expect("pull response");
        if resp.meta.is_pushpull() && !resp.meta.push && !resp.meta.request {
            return resp;
        }
    }
}

/// Waits for the push response so the push is globally visible.
fn push_wait(van: &Van, key: u64, vals: &Segment) {
    push(van, key, vals);
    let mut resp = Message::default();
    loop {
        van.recv_msg(&mut resp).expect("push response");
        if resp.meta.is_pushpull() && resp.meta.push && !resp.meta.request {
            return;
        }
    }
}

fn bring_up() -> (Arc<Van>, Arc<Van>, Arc<AtomicBool>, thread::JoinHandle<()>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let server = Van::new(make_node(SERVER_ID, Role::Server, 0), server_config());
    server.start(0);
    let server_port = server.bind(&make_node(SERVER_ID, Role::Server, 0), 10).unwrap();
    assert!(server_port > 0);

    let worker = Van::new(make_node(WORKER_ID, Role::Worker, 0), worker_config());
    worker.start(0);
    let worker_port = worker.bind(&make_node(WORKER_ID, Role::Worker, 0), 10).unwrap();
    assert!(worker_port > 0);

    let server_node = make_node(SERVER_ID, Role::Server, server_port as u16);
    let worker_node = make_node(WORKER_ID, Role::Worker, worker_port as u16);

    worker.connect(&server_node).expect("worker -> server");
    server.connect(&worker_node).expect("server -> worker");

    let stop = Arc::new(AtomicBool::new(false));
    let handle = run_server(Arc::clone(&server), Arc::clone(&stop));
    (server, worker, stop, handle)
}

fn tear_down(server: Arc<Van>, worker: Arc<Van>, stop: Arc<AtomicBool>, handle: thread::JoinHandle<()>) {
    stop.store(true, Ordering::Release);
    server.stop();
    let _ = handle.join();
    worker.stop();
}

#[test]
#[ignore = "requires an RDMA device"]
fn push_then_pull_roundtrip() {
    let (server, worker, stop, handle) = bring_up();

    let vals = Segment::from_vec(vec![0xAA; 1024]);
    push_wait(&worker, 7, &vals);

    let resp = pull(&worker, 7);
    assert_eq!(resp.meta.key, 7);
    assert_eq!(resp.data[1].len(), 1024);
    assert!(resp.data[1].as_slice().iter().all(|&b| b == 0xAA));

    tear_down(server, worker, stop, handle);
}

#[test]
#[ignore = "requires an RDMA device"]
fn repeated_push_reuses_landing() {
    let (server, worker, stop, handle) = bring_up();

    // the same tensor buffer backs both pushes: the first pays the
    // rendezvous, the second rides the cached landing
    let mut backing = vec![0x11u8; 4096];
    let seg = unsafe { Segment::view(backing.as_ptr(), backing.len()) };
    push_wait(&worker, 9, &seg);

    backing.iter_mut().for_each(|b| *b = 0x22);
    push_wait(&worker, 9, &seg);

    let resp = pull(&worker, 9);
    assert!(resp.data[1].as_slice().iter().all(|&b| b == 0x22));

    tear_down(server, worker, stop, handle);
}

#[test]
#[ignore = "requires an RDMA device"]
fn zero_length_value_push() {
    let (server, worker, stop, handle) = bring_up();

    let empty = Segment::from_vec(Vec::new());
    push_wait(&worker, 11, &empty);

    let resp = pull(&worker, 11);
    assert_eq!(resp.data[1].len(), 0);

    tear_down(server, worker, stop, handle);
}

#[test]
#[ignore = "requires an RDMA device"]
fn bind_retries_busy_port() {
    let _ = env_logger::builder().is_test(true).try_init();

    let first = Van::new(make_node(1, Role::Server, 0), server_config());
    first.start(0);
    let port = first.bind(&make_node(1, Role::Server, 0), 10).unwrap();
    assert!(port > 0);

    // a retry budget finds a random high port
    let second = Van::new(make_node(2, Role::Server, 0), server_config());
    second.start(0);
    let other = second
        .bind(&make_node(2, Role::Server, port as u16), 3)
        .unwrap();
    assert_ne!(other, port);
    if other > 0 {
        assert!((10000..50000).contains(&other));
    }

    // no retry budget on a held port reports failure
    let third = Van::new(make_node(3, Role::Server, 0), server_config());
    third.start(0);
    let failed = third.bind(&make_node(3, Role::Server, port as u16), 0).unwrap();
    assert_eq!(failed, -1);

    third.stop();
    second.stop();
    first.stop();
}
