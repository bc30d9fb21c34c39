//! Application facade for the connector role (C6): `connect`, `send`,
//! `shutdown`, `close`. The connector is the data source; it drives the
//! sender engine (C4) and both ends of the handshake/termination state
//! machine from its side.

use std::io::{self, Write};
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
use crate::sender::SenderEngine;
use crate::state::ConnState;

struct Shared {
    state: ConnState,
    isn: SeqNum,
    remote_isn: SeqNum,
    negotiated_window: u8,
    peer: Option<SocketAddr>,
    sender: Option<SenderEngine>,
    handshake_retry: Option<RetryTimer>,
    handshake_failed: bool,
    term_seq: SeqNum,
    termination_retry: Option<RetryTimer>,
    shutdown_failed: bool,
}

/// The connector side of a bTCP connection: opens the handshake, streams
/// bytes, and drives graceful shutdown.
pub struct Connector {
    shared: Arc<Mutex<Shared>>,
    estab: Arc<Condvar>,
    send_space: Arc<Condvar>,
    closed_cv: Arc<Condvar>,
    cfg: Config,
    outbound_tx: SyncSender<Datagram>,
    workers: Mutex<Option<WorkerHandles>>,
    engine_handle: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
}

impl Connector {
    pub fn new(local_addr: SocketAddr, cfg: Config) -> Result<Connector> {
        let socket = Arc::new(UdpSocket::bind(local_addr)?);
        let (outbound_tx, inbound_rx, workers) = net::spawn(socket);

        let shared = Arc::new(Mutex::new(Shared {
            state: ConnState::Closed,
            isn: SeqNum(0),
            remote_isn: SeqNum(0),
            negotiated_window: cfg.window,
            peer: None,
            sender: None,
            handshake_retry: None,
            handshake_failed: false,
            term_seq: SeqNum(0),
            termination_retry: None,
            shutdown_failed: false,
        }));
        let estab = Arc::new(Condvar::new());
        let send_space = Arc::new(Condvar::new());
        let closed_cv = Arc::new(Condvar::new());
        let closing = Arc::new(AtomicBool::new(false));

        let engine_handle = {
            let shared = shared.clone();
            let estab = estab.clone();
            let send_space = send_space.clone();
            let closed_cv = closed_cv.clone();
            let closing = closing.clone();
            let outbound_tx = outbound_tx.clone();
            thread::spawn(move || {
                run_engine(shared, inbound_rx, outbound_tx, cfg, estab, send_space, closed_cv, closing)
            })
        };

        Ok(Connector {
            shared,
            estab,
            send_space,
            closed_cv,
            cfg,
            outbound_tx,
            workers: Mutex::new(Some(workers)),
            engine_handle: Mutex::new(Some(engine_handle)),
            closing,
        })
    }

    /// Perform the three-way handshake. Blocks until established or the
    /// attempt budget is exhausted.
    pub fn connect(&self, peer: SocketAddr) -> Result<()> {
        let mut sh = self.shared.lock().unwrap();
        if sh.state != ConnState::Closed {
            return Err(Error::AlreadyConnected);
        }

        let isn = SeqNum(rand::thread_rng().gen());
        sh.isn = isn;
        sh.peer = Some(peer);
        sh.state = ConnState::SynSent;
        sh.handshake_failed = false;
        sh.handshake_retry = Some(RetryTimer::start(
            Duration::from_millis(self.cfg.timeout_ms),
            self.cfg.max_handshake_attempts,
        ));

        let syn = encode(isn, SeqNum(0), Flags::SYN, self.cfg.window, &[]);
        let _ = self.outbound_tx.try_send((syn.to_vec(), peer));

        while sh.state == ConnState::SynSent {
            sh = self.estab.wait(sh).unwrap();
        }

        if sh.state == ConnState::Established {
            info!("connector: handshake complete, established with {peer}");
            Ok(())
        } else {
            Err(Error::HandshakeFailed(self.cfg.max_handshake_attempts))
        }
    }

    /// Buffer `bytes` for transmission. Blocks only while the send
    /// buffer is full; returns the number of bytes actually accepted.
    pub fn send(&self, bytes: &[u8]) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }

        let mut sh = self.shared.lock().unwrap();
        loop {
            if sh.state != ConnState::Established {
                return Err(Error::Closed);
            }
            let has_space = sh.sender.as_ref().map(SenderEngine::has_send_buf_space).unwrap_or(false);
            if has_space {
                break;
            }
            sh = self.send_space.wait(sh).unwrap();
        }

        let peer = sh.peer.expect("peer is set once established");
        let sender = sh.sender.as_mut().expect("sender exists once established");
        let n = sender.enqueue(bytes);
        for wire in sender.pump() {
            let _ = self.outbound_tx.try_send((wire, peer));
        }
        Ok(n)
    }

    /// Drain the retransmission queue, then run the termination state
    /// machine. Blocks until the connection closes or termination fails.
    pub fn shutdown(&self) -> Result<()> {
        let mut sh = self.shared.lock().unwrap();
        if sh.state != ConnState::Established {
            return Err(Error::Closed);
        }

        loop {
            let drained = sh.sender.as_ref().map(SenderEngine::all_acked).unwrap_or(true);
            if drained {
                break;
            }
            sh = self.send_space.wait(sh).unwrap();
            if sh.state != ConnState::Established {
                return Err(Error::Closed);
            }
        }

        let peer = sh.peer.expect("peer is set once established");
        let fin_seq = sh.sender.as_ref().expect("sender exists once established").next_seq;
        sh.term_seq = fin_seq;
        sh.state = ConnState::FinSent;
        sh.shutdown_failed = false;
        sh.termination_retry = Some(RetryTimer::start(
            Duration::from_millis(self.cfg.timeout_ms),
            self.cfg.max_termination_attempts,
        ));

        let fin = encode(fin_seq, SeqNum(0), Flags::FIN, sh.negotiated_window, &[]);
        let _ = self.outbound_tx.try_send((fin.to_vec(), peer));

        while sh.state == ConnState::FinSent {
            sh = self.closed_cv.wait(sh).unwrap();
        }

        if sh.shutdown_failed {
            Err(Error::ShutdownFailed(self.cfg.max_termination_attempts))
        } else {
            info!("connector: termination complete");
            Ok(())
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
        self.send_space.notify_all();
        self.closed_cv.notify_all();

        if let Some(h) = self.engine_handle.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(mut w) = self.workers.lock().unwrap().take() {
            w.close();
        }
    }
}

impl Write for Connector {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Connector::send(self, buf).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut sh = self.shared.lock().unwrap();
        loop {
            if sh.state != ConnState::Established {
                return Ok(());
            }
            let empty = sh.sender.as_ref().map(SenderEngine::send_buf_is_empty).unwrap_or(true);
            if empty {
                return Ok(());
            }
            sh = self.send_space.wait(sh).unwrap();
        }
    }
}

impl Drop for Connector {
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
    send_space: Arc<Condvar>,
    closed_cv: Arc<Condvar>,
    closing: Arc<AtomicBool>,
) {
    loop {
        if closing.load(Ordering::Acquire) {
            break;
        }

        match inbound_rx.recv_timeout(TICK_INTERVAL) {
            Ok((bytes, src)) => {
                let mut sh = shared.lock().unwrap();
                if sh.peer == Some(src) {
                    if let Ok(seg) = decode(&bytes) {
                        dispatch(&mut sh, seg, &outbound_tx, src, &cfg, &estab, &send_space, &closed_cv);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let mut sh = shared.lock().unwrap();
        tick(&mut sh, &outbound_tx, &cfg, &estab, &send_space, &closed_cv);
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    sh: &mut Shared,
    seg: Segment,
    outbound_tx: &SyncSender<Datagram>,
    peer: SocketAddr,
    cfg: &Config,
    estab: &Condvar,
    send_space: &Condvar,
    closed_cv: &Condvar,
) {
    let h = seg.header;
    if h.window == 0 {
        return;
    }

    match sh.state {
        ConnState::SynSent => {
            if h.flags.is_syn()
                && h.flags.is_ack()
                && !h.flags.is_fin()
                && h.ack == sh.isn.wrapping_add(1)
            {
                sh.remote_isn = h.seq;
                sh.negotiated_window = cfg.window.min(h.window);
                let my_seq = sh.isn.wrapping_add(1);
                let their_next = sh.remote_isn.wrapping_add(1);

                let ack = encode(my_seq, their_next, Flags::ACK, sh.negotiated_window, &[]);
                let _ = outbound_tx.try_send((ack.to_vec(), peer));

                sh.sender = Some(SenderEngine::new(
                    my_seq,
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
        ConnState::Established => {
            if h.flags.is_syn() && h.flags.is_ack() {
                // A retransmitted SYN+ACK arriving after we already
                // finished the handshake: the accepter never saw our
                // final ACK. Re-ACK idempotently using the stored ISNs
                // rather than re-running the handshake.
                if h.seq == sh.remote_isn && h.ack == sh.isn.wrapping_add(1) {
                    let ack = encode(
                        sh.isn.wrapping_add(1),
                        sh.remote_isn.wrapping_add(1),
                        Flags::ACK,
                        sh.negotiated_window,
                        &[],
                    );
                    let _ = outbound_tx.try_send((ack.to_vec(), peer));
                }
            } else if h.flags.is_ack() && !h.flags.is_syn() && !h.flags.is_fin() {
                if let Some(sender) = sh.sender.as_mut() {
                    if let Some(retransmit) = sender.on_ack(h.ack) {
                        let _ = outbound_tx.try_send((retransmit, peer));
                    }
                }
                send_space.notify_all();
            }
        }
        ConnState::FinSent => {
            if h.flags.is_fin() && h.flags.is_ack() && h.ack == sh.term_seq.wrapping_add(1) {
                let final_ack = encode(
                    sh.term_seq.wrapping_add(1),
                    h.seq.wrapping_add(1),
                    Flags::ACK,
                    sh.negotiated_window,
                    &[],
                );
                let _ = outbound_tx.try_send((final_ack.to_vec(), peer));
                sh.state = ConnState::Closed;
                sh.termination_retry = None;
                closed_cv.notify_all();
            }
        }
        ConnState::Closed | ConnState::Accepting | ConnState::SynRcvd | ConnState::Closing => {
            // The connector never occupies these states.
        }
    }
}

fn tick(
    sh: &mut Shared,
    outbound_tx: &SyncSender<Datagram>,
    cfg: &Config,
    estab: &Condvar,
    send_space: &Condvar,
    closed_cv: &Condvar,
) {
    let Some(peer) = sh.peer else { return };
    let timeout = Duration::from_millis(cfg.timeout_ms);

    match sh.state {
        ConnState::SynSent => {
            let isn = sh.isn;
            let window = cfg.window;
            if let Some(timer) = sh.handshake_retry.as_mut() {
                match timer.poll(timeout) {
                    RetryOutcome::Pending => {}
                    RetryOutcome::Retry => {
                        let syn = encode(isn, SeqNum(0), Flags::SYN, window, &[]);
                        let _ = outbound_tx.try_send((syn.to_vec(), peer));
                    }
                    RetryOutcome::Exhausted => {
                        sh.state = ConnState::Closed;
                        sh.handshake_failed = true;
                        estab.notify_all();
                    }
                }
            }
        }
        ConnState::Established => {
            if let Some(sender) = sh.sender.as_mut() {
                for wire in sender.pump() {
                    let _ = outbound_tx.try_send((wire, peer));
                }
                for wire in sender.check_timeouts() {
                    let _ = outbound_tx.try_send((wire, peer));
                }
            }
            send_space.notify_all();
        }
        ConnState::FinSent => {
            let term_seq = sh.term_seq;
            let window = sh.negotiated_window;
            if let Some(timer) = sh.termination_retry.as_mut() {
                match timer.poll(timeout) {
                    RetryOutcome::Pending => {}
                    RetryOutcome::Retry => {
                        let fin = encode(term_seq, SeqNum(0), Flags::FIN, window, &[]);
                        let _ = outbound_tx.try_send((fin.to_vec(), peer));
                    }
                    RetryOutcome::Exhausted => {
                        sh.state = ConnState::Closed;
                        sh.shutdown_failed = true;
                        closed_cv.notify_all();
                    }
                }
            }
        }
        ConnState::Closed | ConnState::Accepting | ConnState::SynRcvd | ConnState::Closing => {}
    }
}
