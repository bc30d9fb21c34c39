//! Application facade for the accepter role (C6): `accept`, `recv`,
//! `close`. The accepter is the data sink; it drives the receiver engine
//! (C5) and responds to the peer-initiated handshake and termination.

use std::io::{self, Read};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::info;
use rand::Rng;

use crate::clock::{RetryOutcome, RetryTimer, TICK_INTERVAL};
use crate::codec::{decode, encode, Flags, Segment, SeqNum};
use crate::config::Config;
use crate::err::{Error, Result};
use crate::net::{self, Datagram, WorkerHandles};
use crate::receiver::{DataOutcome, ReceiverEngine};
use crate::state::ConnState;

/// The responder's 2x-timeout give-up bound on the final ACK of
/// termination (spec.md §4.3): "If the final ACK never arrives within
/// 2x timeout, the responder closes anyway." Modeled as two retry slots
/// of one timeout interval each, rather than the general-purpose
/// handshake/termination retry budget.
const TERMINATION_GIVE_UP_ATTEMPTS: u32 = 2;

struct Shared {
    state: ConnState,
    isn: SeqNum,
    remote_isn: SeqNum,
    negotiated_window: u8,
    peer: Option<SocketAddr>,
    receiver: Option<ReceiverEngine>,
    handshake_retry: Option<RetryTimer>,
    termination_retry: Option<RetryTimer>,
}

/// The accepter side of a bTCP connection: waits for an incoming
/// handshake, reassembles the byte stream, and responds to termination.
pub struct Accepter {
    shared: Arc<Mutex<Shared>>,
    estab: Arc<Condvar>,
    recv_ready: Arc<Condvar>,
    cfg: Config,
    outbound_tx: SyncSender<Datagram>,
    workers: Mutex<Option<WorkerHandles>>,
    engine_handle: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
}

impl Accepter {
    pub fn new(local_addr: SocketAddr, cfg: Config) -> Result<Accepter> {
        let socket = Arc::new(UdpSocket::bind(local_addr)?);
        let (outbound_tx, inbound_rx, workers) = net::spawn(socket);

        let shared = Arc::new(Mutex::new(Shared {
            state: ConnState::Closed,
            isn: SeqNum(0),
            remote_isn: SeqNum(0),
            negotiated_window: cfg.window,
            peer: None,
            receiver: None,
            handshake_retry: None,
            termination_retry: None,
        }));
        let estab = Arc::new(Condvar::new());
        let recv_ready = Arc::new(Condvar::new());
        let closing = Arc::new(AtomicBool::new(false));

        let engine_handle = {
            let shared = shared.clone();
            let estab = estab.clone();
            let recv_ready = recv_ready.clone();
            let closing = closing.clone();
            let outbound_tx = outbound_tx.clone();
            thread::spawn(move || {
                run_engine(shared, inbound_rx, outbound_tx, cfg, estab, recv_ready, closing)
            })
        };

        Ok(Accepter {
            shared,
            estab,
            recv_ready,
            cfg,
            outbound_tx,
            workers: Mutex::new(Some(workers)),
            engine_handle: Mutex::new(Some(engine_handle)),
            closing,
        })
    }

    /// Wait for a peer to complete the handshake. Blocks until
    /// established or the attempt budget is exhausted.
    pub fn accept(&self) -> Result<SocketAddr> {
        let mut sh = self.shared.lock().unwrap();
        if sh.state != ConnState::Closed {
            return Err(Error::AlreadyConnected);
        }
        sh.state = ConnState::Accepting;

        while sh.state == ConnState::Accepting || sh.state == ConnState::SynRcvd {
            sh = self.estab.wait(sh).unwrap();
        }

        if sh.state == ConnState::Established {
            let peer = sh.peer.expect("peer is set once a SYN has been accepted");
            info!("accepter: handshake complete, established with {peer}");
            Ok(peer)
        } else {
            sh.state = ConnState::Closed;
            Err(Error::HandshakeFailed(self.cfg.max_handshake_attempts))
        }
    }

    /// Block until bytes are available or the connection has closed.
    /// An empty result signals end-of-stream.
    pub fn recv(&self) -> Result<Vec<u8>> {
        let mut sh = self.shared.lock().unwrap();
        loop {
            if let Some(receiver) = sh.receiver.as_mut() {
                if receiver.has_deliverable() {
                    return Ok(receiver.drain_deliverable());
                }
            }
            if sh.state != ConnState::Established {
                return Ok(Vec::new());
            }
            sh = self.recv_ready.wait(sh).unwrap();
        }
    }

    /// Release the socket and worker threads. Idempotent.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut sh = self.shared.lock().unwrap();
            sh.state = ConnState::Closed;
        }
        self.estab.notify_all();
        self.recv_ready.notify_all();

        if let Some(h) = self.engine_handle.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(mut w) = self.workers.lock().unwrap().take() {
            w.close();
        }
    }
}

impl Read for Accepter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = Accepter::recv(self).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        // A caller reading with a buffer shorter than one recv() batch
        // loses the remainder; callers that need byte-exact framing
        // should read with a buffer at least PAYLOAD_SIZE * window long.
        Ok(n)
    }
}

impl Drop for Accepter {
    fn drop(&mut self) {
        self.close();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_engine(
    shared: Arc<Mutex<Shared>>,
    inbound_rx: Receiver<Datagram>,
    outbound_tx: SyncSender<Datagram>,
    cfg: Config,
    estab: Arc<Condvar>,
    recv_ready: Arc<Condvar>,
    closing: Arc<AtomicBool>,
) {
    loop {
        if closing.load(Ordering::Acquire) {
            break;
        }

        match inbound_rx.recv_timeout(TICK_INTERVAL) {
            Ok((bytes, src)) => {
                let mut sh = shared.lock().unwrap();
                let accept_from_anyone = sh.state == ConnState::Accepting;
                if accept_from_anyone || sh.peer == Some(src) {
                    if let Ok(seg) = decode(&bytes) {
                        dispatch(&mut sh, seg, &outbound_tx, src, &cfg, &estab, &recv_ready);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let mut sh = shared.lock().unwrap();
        tick(&mut sh, &outbound_tx, &cfg, &estab);
    }
}

fn dispatch(
    sh: &mut Shared,
    seg: Segment,
    outbound_tx: &SyncSender<Datagram>,
    peer: SocketAddr,
    cfg: &Config,
    estab: &Condvar,
    recv_ready: &Condvar,
) {
    let h = seg.header;
    if h.window == 0 {
        return;
    }

    match sh.state {
        ConnState::Accepting => {
            if h.flags.is_syn() && !h.flags.is_ack() && !h.flags.is_fin() {
                let isn = SeqNum(rand::thread_rng().gen());
                sh.isn = isn;
                sh.remote_isn = h.seq;
                sh.negotiated_window = cfg.window.min(h.window);
                sh.peer = Some(peer);
                sh.state = ConnState::SynRcvd;
                sh.handshake_retry = Some(RetryTimer::start(
                    Duration::from_millis(cfg.timeout_ms),
                    cfg.max_handshake_attempts,
                ));

                let syn_ack = encode(
                    isn,
                    sh.remote_isn.wrapping_add(1),
                    Flags::SYN | Flags::ACK,
                    sh.negotiated_window,
                    &[],
                );
                let _ = outbound_tx.try_send((syn_ack.to_vec(), peer));
            }
        }
        ConnState::SynRcvd => {
            if Some(peer) != sh.peer {
                return;
            }
            if h.flags.is_syn() && !h.flags.is_ack() {
                // The connector's SYN was itself a retransmit; our
                // SYN+ACK must have been lost. Resend it idempotently.
                let syn_ack = encode(
                    sh.isn,
                    sh.remote_isn.wrapping_add(1),
                    Flags::SYN | Flags::ACK,
                    sh.negotiated_window,
                    &[],
                );
                let _ = outbound_tx.try_send((syn_ack.to_vec(), peer));
            } else if h.flags.is_ack() && !h.flags.is_syn() && !h.flags.is_fin() {
                if h.ack == sh.isn.wrapping_add(1) {
                    sh.receiver = Some(ReceiverEngine::new(
                        sh.remote_isn.wrapping_add(1),
                        &Config {
                            window: sh.negotiated_window,
                            ..*cfg
                        },
                    ));
                    sh.state = ConnState::Established;
                    sh.handshake_retry = None;
                    estab.notify_all();
                }
            }
        }
        ConnState::Established => {
            if Some(peer) != sh.peer {
                return;
            }
            if h.flags.is_fin() && !h.flags.is_ack() {
                let fin_seq = h.seq;
                sh.state = ConnState::Closing;
                sh.termination_retry = Some(RetryTimer::start(
                    Duration::from_millis(cfg.timeout_ms),
                    TERMINATION_GIVE_UP_ATTEMPTS,
                ));
                // Stash the peer's FIN sequence number in `remote_isn`;
                // it has no further use once established.
                sh.remote_isn = fin_seq;

                let fin_ack = encode(
                    sh.isn.wrapping_add(1),
                    fin_seq.wrapping_add(1),
                    Flags::FIN | Flags::ACK,
                    sh.negotiated_window,
                    &[],
                );
                let _ = outbound_tx.try_send((fin_ack.to_vec(), peer));
                recv_ready.notify_all();
                return;
            }

            if !h.flags.is_syn() && !h.flags.is_fin() && !h.flags.is_ack() {
                if let Some(receiver) = sh.receiver.as_mut() {
                    let outcome = receiver.on_data(h.seq, &seg.payload);
                    if outcome != DataOutcome::Dropped {
                        let ack = encode(
                            sh.isn.wrapping_add(1),
                            receiver.rcv_next,
                            Flags::ACK,
                            receiver.remaining_window(),
                            &[],
                        );
                        let _ = outbound_tx.try_send((ack.to_vec(), peer));
                        recv_ready.notify_all();
                    }
                }
            }
        }
        ConnState::Closing => {
            if Some(peer) != sh.peer {
                return;
            }
            if h.flags.is_fin() && !h.flags.is_ack() {
                // Duplicate FIN: our FIN+ACK must have been lost, resend.
                let fin_ack = encode(
                    sh.isn.wrapping_add(1),
                    sh.remote_isn.wrapping_add(1),
                    Flags::FIN | Flags::ACK,
                    sh.negotiated_window,
                    &[],
                );
                let _ = outbound_tx.try_send((fin_ack.to_vec(), peer));
            } else if h.flags.is_ack() && !h.flags.is_syn() && !h.flags.is_fin() {
                if h.ack == sh.isn.wrapping_add(2) {
                    sh.state = ConnState::Closed;
                    sh.termination_retry = None;
                    recv_ready.notify_all();
                }
            }
        }
        ConnState::Closed | ConnState::SynSent | ConnState::FinSent => {
            // The accepter never occupies these states.
        }
    }
}

fn tick(sh: &mut Shared, outbound_tx: &SyncSender<Datagram>, cfg: &Config, estab: &Condvar) {
    let Some(peer) = sh.peer else { return };
    let timeout = Duration::from_millis(cfg.timeout_ms);

    match sh.state {
        ConnState::SynRcvd => {
            let isn = sh.isn;
            let remote_isn = sh.remote_isn;
            let window = sh.negotiated_window;
            if let Some(timer) = sh.handshake_retry.as_mut() {
                match timer.poll(timeout) {
                    RetryOutcome::Pending => {}
                    RetryOutcome::Retry => {
                        let syn_ack = encode(
                            isn,
                            remote_isn.wrapping_add(1),
                            Flags::SYN | Flags::ACK,
                            window,
                            &[],
                        );
                        let _ = outbound_tx.try_send((syn_ack.to_vec(), peer));
                    }
                    RetryOutcome::Exhausted => {
                        sh.state = ConnState::Closed;
                        estab.notify_all();
                    }
                }
            }
        }
        ConnState::Closing => {
            let isn = sh.isn;
            let fin_seq = sh.remote_isn;
            let window = sh.negotiated_window;
            if let Some(timer) = sh.termination_retry.as_mut() {
                match timer.poll(timeout) {
                    RetryOutcome::Pending => {}
                    RetryOutcome::Retry => {
                        let fin_ack = encode(
                            isn.wrapping_add(1),
                            fin_seq.wrapping_add(1),
                            Flags::FIN | Flags::ACK,
                            window,
                            &[],
                        );
                        let _ = outbound_tx.try_send((fin_ack.to_vec(), peer));
                    }
                    RetryOutcome::Exhausted => {
                        // The final ACK never arrived within 2x timeout;
                        // close anyway rather than wait indefinitely.
                        sh.state = ConnState::Closed;
                    }
                }
            }
        }
        ConnState::Closed
        | ConnState::Accepting
        | ConnState::SynSent
        | ConnState::Established
        | ConnState::FinSent => {}
    }
}
