//! Datagram I/O workers (C2): two threads that move raw bytes between the
//! OS socket and the bounded queues the engine reads and writes. They do
//! no framing and no checksum work — only `Vec<u8>` in, `Vec<u8>` out.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use crate::config::{QUEUE_CAPACITY, SEGMENT_SIZE, SOCKET_READ_TIMEOUT_MS};

pub type Datagram = (Vec<u8>, SocketAddr);

/// Join handles for the running sender/receiver worker pair, kept apart
/// from the queue endpoints so the engine thread can own the `Receiver`
/// directly instead of sharing it.
pub struct WorkerHandles {
    closed: Arc<AtomicBool>,
    sender_handle: Option<JoinHandle<()>>,
    receiver_handle: Option<JoinHandle<()>>,
}

/// Start the sender and receiver workers for `socket`. Returns the
/// outbound sender (cloneable, one per producer context), the inbound
/// receiver (single consumer: the engine thread), and a handle used to
/// stop both threads from [`WorkerHandles::close`].
pub fn spawn(socket: Arc<UdpSocket>) -> (SyncSender<Datagram>, Receiver<Datagram>, WorkerHandles) {
    socket
        .set_read_timeout(Some(Duration::from_millis(SOCKET_READ_TIMEOUT_MS)))
        .expect("UDP sockets support read timeouts");

    let (outbound_tx, outbound_rx) = sync_channel::<Datagram>(QUEUE_CAPACITY);
    let (inbound_tx, inbound_rx) = sync_channel::<Datagram>(QUEUE_CAPACITY);
    let closed = Arc::new(AtomicBool::new(false));

    let sender_handle = {
        let socket = socket.clone();
        let closed = closed.clone();
        thread::spawn(move || sender_worker(&socket, outbound_rx, closed))
    };

    let receiver_handle = {
        let socket = socket.clone();
        let closed = closed.clone();
        thread::spawn(move || receiver_worker(&socket, inbound_tx, closed))
    };

    (
        outbound_tx,
        inbound_rx,
        WorkerHandles {
            closed,
            sender_handle: Some(sender_handle),
            receiver_handle: Some(receiver_handle),
        },
    )
}

impl WorkerHandles {
    /// Stop both workers and wait for them to exit. Idempotent: a second
    /// call is a no-op because the join handles are only `Some` once.
    /// Both workers notice `closed` within one bounded wait — the sender
    /// worker's queue read and the receiver worker's socket read — so
    /// this never blocks on an outstanding `SyncSender` clone held
    /// elsewhere (e.g. by the engine thread).
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);

        if let Some(h) = self.sender_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.receiver_handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for WorkerHandles {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn sender_worker(socket: &UdpSocket, outbound_rx: Receiver<Datagram>, closed: Arc<AtomicBool>) {
    while !closed.load(Ordering::Acquire) {
        let (bytes, peer) = match outbound_rx.recv_timeout(Duration::from_millis(SOCKET_READ_TIMEOUT_MS)) {
            Ok(datagram) => datagram,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match socket.send_to(&bytes, peer) {
            Ok(_) => {}
            Err(e) if is_transient(&e) => {
                warn!("sender worker: dropping segment after transient I/O error: {e}");
            }
            Err(e) => {
                error!("sender worker: terminal I/O error, exiting: {e}");
                return;
            }
        }
    }
    debug!("sender worker: closed, exiting");
}

fn receiver_worker(socket: &UdpSocket, inbound_tx: SyncSender<Datagram>, closed: Arc<AtomicBool>) {
    let mut buf = [0u8; SEGMENT_SIZE];
    while !closed.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                if inbound_tx.try_send((buf[..n].to_vec(), peer)).is_err() {
                    warn!("receiver worker: inbound queue full, dropping segment from {peer}");
                }
            }
            Err(e) if is_timeout(&e) => continue,
            Err(e) if is_transient(&e) => {
                warn!("receiver worker: transient I/O error, continuing: {e}");
            }
            Err(e) => {
                error!("receiver worker: terminal I/O error, exiting: {e}");
                return;
            }
        }
    }
    debug!("receiver worker: closed, exiting");
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}
