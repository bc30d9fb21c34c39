//! Sender engine (C4): sliding window, retransmission queue, duplicate-ACK
//! fast retransmit, and timeout-driven retransmit.

use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, trace};

use crate::clock::now;
use crate::codec::{encode, Flags, SeqNum};
use crate::config::{Config, DUP_ACK_FAST_RETRANSMIT_THRESHOLD, PAYLOAD_SIZE};

/// One outstanding, unacknowledged segment.
#[derive(Debug, Clone)]
pub struct RetransEntry {
    pub seq: SeqNum,
    pub wire: Vec<u8>,
    pub first_sent: Instant,
    pub retries: u32,
}

pub struct SenderEngine {
    /// Oldest unacknowledged SEQ.
    pub send_base: SeqNum,
    /// Next SEQ to assign to a freshly formed segment.
    pub next_seq: SeqNum,
    /// Negotiated window, frozen at handshake time.
    pub window: u8,
    /// Entries ordered by SEQ (oldest first); invariant: no duplicate SEQs.
    pub retrans: VecDeque<RetransEntry>,
    pub last_ack: SeqNum,
    pub dup_ack_count: u32,
    /// Bytes accepted by `send()` but not yet framed into a segment.
    send_buf: VecDeque<u8>,
    send_buf_cap: usize,
    timeout: std::time::Duration,
}

impl SenderEngine {
    pub fn new(isn: SeqNum, cfg: &Config) -> SenderEngine {
        SenderEngine {
            send_base: isn,
            next_seq: isn,
            window: cfg.window,
            retrans: VecDeque::new(),
            last_ack: isn,
            dup_ack_count: 0,
            send_buf: VecDeque::new(),
            send_buf_cap: cfg.window as usize * PAYLOAD_SIZE,
            timeout: std::time::Duration::from_millis(cfg.timeout_ms),
        }
    }

    pub fn outstanding(&self) -> u16 {
        self.next_seq.wrapping_sub(self.send_base)
    }

    pub fn has_send_buf_space(&self) -> bool {
        self.send_buf.len() < self.send_buf_cap
    }

    /// Accept up to the available buffer space; returns the number of
    /// bytes actually buffered (may be less than `bytes.len()`).
    pub fn enqueue(&mut self, bytes: &[u8]) -> usize {
        let room = self.send_buf_cap - self.send_buf.len();
        let n = room.min(bytes.len());
        self.send_buf.extend(bytes[..n].iter().copied());
        n
    }

    pub fn send_buf_is_empty(&self) -> bool {
        self.send_buf.is_empty()
    }

    pub fn all_acked(&self) -> bool {
        self.send_buf.is_empty() && self.retrans.is_empty() && self.send_base == self.next_seq
    }

    /// Form and emit as many fresh data segments as the window allows.
    /// Returns the wire bytes to hand to the outbound queue, in order.
    pub fn pump(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while self.outstanding() < self.window as u16 && !self.send_buf.is_empty() {
            let len = self.send_buf.len().min(PAYLOAD_SIZE);
            let payload: Vec<u8> = self.send_buf.drain(..len).collect();

            // Pure data segments never set ACK (spec.md §4.4: flags=0), so
            // the ACK field they carry is unused by the receiver and is
            // set to zero rather than tracking a reverse data stream this
            // one-way transport never has.
            let wire = encode(self.next_seq, SeqNum(0), Flags::NONE, self.window, &payload)
                .to_vec();

            trace!("sender: formed segment seq={:?} len={}", self.next_seq, len);

            self.retrans.push_back(RetransEntry {
                seq: self.next_seq,
                wire: wire.clone(),
                first_sent: now(),
                retries: 0,
            });
            out.push(wire);
            self.next_seq = self.next_seq.wrapping_add(1);
        }
        out
    }

    /// Process an incoming cumulative ACK. Returns the wire bytes of any
    /// segment that should be fast-retransmitted right now.
    pub fn on_ack(&mut self, ack: SeqNum) -> Option<Vec<u8>> {
        let before = self.retrans.len();
        // Cumulative ACK: drop every entry whose SEQ precedes `ack`.
        self.retrans.retain(|e| !e.seq.precedes(ack));
        if self.retrans.len() != before {
            self.send_base = self.retrans.front().map(|e| e.seq).unwrap_or(self.next_seq);
        }

        let mut fast_retransmit = None;
        if ack == self.last_ack && ack.precedes(self.next_seq) {
            self.dup_ack_count += 1;
            if self.dup_ack_count == DUP_ACK_FAST_RETRANSMIT_THRESHOLD {
                if let Some(entry) = self.retrans.front() {
                    debug!("sender: fast retransmit seq={:?}", entry.seq);
                    fast_retransmit = Some(entry.wire.clone());
                }
            }
        } else {
            self.dup_ack_count = 0;
        }
        self.last_ack = ack;

        fast_retransmit
    }

    /// Scan the retransmission queue for entries whose deadline has
    /// passed and resend them, in SEQ order, up to the current window.
    /// Returns the wire bytes to re-emit.
    pub fn check_timeouts(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let deadline = self.timeout;
        for entry in self.retrans.iter_mut() {
            if now().duration_since(entry.first_sent) >= deadline {
                entry.retries += 1;
                entry.first_sent = now();
                out.push(entry.wire.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(window: u8) -> Config {
        Config::new(window, 50).unwrap()
    }

    #[test]
    fn window_caps_outstanding_segments() {
        let mut s = SenderEngine::new(SeqNum(0), &cfg(2));
        s.enqueue(&[0u8; PAYLOAD_SIZE * 5]);
        let first = s.pump();
        assert_eq!(first.len(), 2);
        assert_eq!(s.outstanding(), 2);
        // Window full: a second pump without an ACK produces nothing new.
        assert!(s.pump().is_empty());
    }

    #[test]
    fn cumulative_ack_drains_retransmission_queue() {
        let mut s = SenderEngine::new(SeqNum(10), &cfg(4));
        s.enqueue(&[1, 2, 3]);
        s.pump();
        assert_eq!(s.retrans.len(), 1);
        s.on_ack(SeqNum(11));
        assert!(s.retrans.is_empty());
        assert_eq!(s.send_base, SeqNum(11));
    }

    #[test]
    fn no_duplicate_seqs_in_retransmission_queue() {
        let mut s = SenderEngine::new(SeqNum(0), &cfg(8));
        s.enqueue(&[0u8; PAYLOAD_SIZE * 3]);
        s.pump();
        let mut seen = std::collections::HashSet::new();
        for e in &s.retrans {
            assert!(seen.insert(e.seq.0), "duplicate SEQ in retransmission queue");
        }
    }

    #[test]
    fn first_duplicate_ack_triggers_fast_retransmit() {
        let mut s = SenderEngine::new(SeqNum(0), &cfg(4));
        s.enqueue(&[0u8; PAYLOAD_SIZE * 2]);
        s.pump();
        assert!(s.on_ack(SeqNum(0)).is_none()); // first ACK at 0 just sets last_ack
        let retransmit = s.on_ack(SeqNum(0)); // duplicate
        assert!(retransmit.is_some());
    }

    #[test]
    fn timeout_resends_unacked_segments() {
        let mut s = SenderEngine::new(SeqNum(0), &cfg(4));
        s.enqueue(&[1, 2, 3]);
        s.pump();
        assert!(s.check_timeouts().is_empty());
        std::thread::sleep(std::time::Duration::from_millis(60));
        let resent = s.check_timeouts();
        assert_eq!(resent.len(), 1);
        assert_eq!(s.retrans[0].retries, 1);
    }
}
