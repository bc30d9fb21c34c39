//! End-to-end transfer tests over a real loopback UDP relay that can
//! drop, corrupt, duplicate, and reorder segments in flight. The relay
//! stands in for the artificial lossy layer this crate's core does not
//! own (out of scope, per the purpose section).

use std::collections::VecDeque;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use btcp::{Accepter, Config, Connector};

/// Grab a port the OS currently considers free. Racy in general, but
/// good enough for a same-process test that immediately rebinds it.
fn free_addr() -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.local_addr().unwrap()
}

struct RelayConfig {
    drop_pct: f64,
    corrupt_pct: f64,
    dup_pct: f64,
    reorder_window: usize,
}

impl RelayConfig {
    fn ideal() -> RelayConfig {
        RelayConfig { drop_pct: 0.0, corrupt_pct: 0.0, dup_pct: 0.0, reorder_window: 0 }
    }

    fn lossy() -> RelayConfig {
        RelayConfig { drop_pct: 0.10, corrupt_pct: 0.02, dup_pct: 0.10, reorder_window: 0 }
    }

    fn reordering() -> RelayConfig {
        RelayConfig { drop_pct: 0.0, corrupt_pct: 0.0, dup_pct: 0.0, reorder_window: 6 }
    }
}

/// Forwards datagrams from `inbound` to `outbound_target` via
/// `outbound`, applying the configured impairments. Run one instance
/// per direction.
fn relay_direction(
    inbound: UdpSocket,
    outbound: UdpSocket,
    outbound_target: Arc<Mutex<Option<SocketAddr>>>,
    learned_source: Arc<Mutex<Option<SocketAddr>>>,
    cfg: Arc<RelayConfig>,
    seed: u64,
    stop: Arc<AtomicBool>,
) {
    inbound.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut held: VecDeque<Vec<u8>> = VecDeque::new();

    while !stop.load(Ordering::Acquire) {
        let mut buf = [0u8; 2048];
        let (n, src) = match inbound.recv_from(&mut buf) {
            Ok(v) => v,
            Err(_) => continue,
        };
        *learned_source.lock().unwrap() = Some(src);
        let Some(dst) = *outbound_target.lock().unwrap() else { continue };

        let mut bytes = buf[..n].to_vec();

        if rng.gen_bool(cfg.drop_pct) {
            continue;
        }
        if rng.gen_bool(cfg.corrupt_pct) {
            let i = rng.gen_range(0..bytes.len());
            bytes[i] ^= 0xFF;
        }
        if rng.gen_bool(cfg.dup_pct) {
            let _ = outbound.send_to(&bytes, dst);
        }

        if cfg.reorder_window == 0 {
            let _ = outbound.send_to(&bytes, dst);
            continue;
        }

        held.push_back(bytes);
        if held.len() >= cfg.reorder_window {
            let i = rng.gen_range(0..held.len());
            let picked = held.remove(i).unwrap();
            let _ = outbound.send_to(&picked, dst);
        }
    }

    for bytes in held {
        if let Some(dst) = *outbound_target.lock().unwrap() {
            let _ = outbound.send_to(&bytes, dst);
        }
    }
}

/// Spawns a two-directional relay between `client_facing` and
/// `server_facing`, each learning its peer's address from the first
/// datagram it forwards in that direction.
fn spawn_relay(
    client_facing: UdpSocket,
    server_facing: UdpSocket,
    server_addr: SocketAddr,
    cfg: RelayConfig,
) -> (SocketAddr, Arc<AtomicBool>, Vec<thread::JoinHandle<()>>) {
    let relay_addr = client_facing.local_addr().unwrap();
    let cfg = Arc::new(cfg);
    let stop = Arc::new(AtomicBool::new(false));

    let client_addr_slot: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let server_target: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(Some(server_addr)));

    let forward = {
        let inbound = client_facing.try_clone().unwrap();
        let outbound = server_facing.try_clone().unwrap();
        let target = server_target.clone();
        let learned = client_addr_slot.clone();
        let cfg = cfg.clone();
        let stop = stop.clone();
        thread::spawn(move || relay_direction(inbound, outbound, target, learned, cfg, 1, stop))
    };

    let backward = {
        let inbound = server_facing;
        let outbound = client_facing;
        let target = client_addr_slot;
        let learned = Arc::new(Mutex::new(None));
        let cfg = cfg;
        let stop = stop.clone();
        thread::spawn(move || relay_direction(inbound, outbound, target, learned, cfg, 2, stop))
    };

    (relay_addr, stop, vec![forward, backward])
}

fn run_transfer(payload: Vec<u8>, relay_cfg: RelayConfig, cfg: Config) -> Vec<u8> {
    let accepter_addr = free_addr();
    let accepter = Accepter::new(accepter_addr, cfg).unwrap();
    let accepter_handle = thread::spawn(move || {
        accepter.accept().unwrap();
        let mut out = Vec::new();
        loop {
            let chunk = accepter.recv().unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend(chunk);
        }
        out
    });

    let relay_client_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let relay_server_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let (relay_addr, stop, handles) =
        spawn_relay(relay_client_sock, relay_server_sock, accepter_addr, relay_cfg);

    let connector = Connector::new(free_addr(), cfg).unwrap();
    connector.connect(relay_addr).unwrap();

    let mut offset = 0;
    while offset < payload.len() {
        offset += connector.send(&payload[offset..]).unwrap();
    }
    connector.shutdown().unwrap();
    drop(connector);

    let result = accepter_handle.join().unwrap();
    stop.store(true, Ordering::Release);
    for h in handles {
        let _ = h.join();
    }
    result
}

fn sample_payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

#[test]
fn ideal_network_delivers_byte_identical_stream() {
    let payload = sample_payload(64 * 1024, 7);
    let cfg = Config::new(16, 80).unwrap();
    let got = run_transfer(payload.clone(), RelayConfig::ideal(), cfg);
    assert_eq!(got, payload);
}

#[test]
fn lossy_network_still_delivers_byte_identical_stream() {
    let payload = sample_payload(96 * 1024, 11);
    let cfg = Config::new(16, 40).unwrap();
    let got = run_transfer(payload.clone(), RelayConfig::lossy(), cfg);
    assert_eq!(got, payload);
}

#[test]
fn reordering_network_still_delivers_in_order() {
    let payload = sample_payload(48 * 1024, 23);
    let cfg = Config::new(24, 80).unwrap();
    let got = run_transfer(payload.clone(), RelayConfig::reordering(), cfg);
    assert_eq!(got, payload);
}

#[test]
fn stop_and_wait_window_of_one_still_completes() {
    let payload = sample_payload(8 * 1024, 31);
    let cfg = Config::new(1, 60).unwrap();
    let got = run_transfer(payload.clone(), RelayConfig::ideal(), cfg);
    assert_eq!(got, payload);
}

#[test]
fn empty_send_is_a_no_op_and_still_shuts_down_cleanly() {
    let cfg = Config::new(8, 80).unwrap();
    let got = run_transfer(Vec::new(), RelayConfig::ideal(), cfg);
    assert!(got.is_empty());
}

#[test]
fn writer_facade_matches_send() {
    let accepter_addr = free_addr();
    let cfg = Config::new(8, 80).unwrap();
    let accepter = Accepter::new(accepter_addr, cfg).unwrap();
    let accepter_handle = thread::spawn(move || {
        accepter.accept().unwrap();
        let mut out = Vec::new();
        loop {
            let chunk = accepter.recv().unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend(chunk);
        }
        out
    });

    let mut connector = Connector::new(free_addr(), cfg).unwrap();
    connector.connect(accepter_addr).unwrap();
    connector.write_all(b"hello over a Write impl").unwrap();
    connector.flush().unwrap();
    connector.shutdown().unwrap();
    drop(connector);

    assert_eq!(accepter_handle.join().unwrap(), b"hello over a Write impl");
}
