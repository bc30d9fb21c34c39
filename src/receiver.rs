//! Receiver engine (C5): in-order delivery, out-of-order reassembly, and
//! cumulative ACK generation.

use std::collections::HashMap;
use std::collections::VecDeque;

use log::trace;

use crate::codec::SeqNum;
use crate::config::{Config, PAYLOAD_SIZE};

/// What became of a data segment handed to [`ReceiverEngine::on_data`].
/// Both outcomes except [`Dropped`] must still produce a cumulative ACK
/// (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// Delivered in order, possibly draining reassembled segments behind it.
    DeliveredInOrder,
    /// Stored out of order, or already-buffered duplicate of one.
    BufferedOutOfOrder,
    /// Already-delivered duplicate; `rcv_next` does not move.
    DuplicateOfDelivered,
    /// Reassembly set or delivery buffer is full, or the segment lies
    /// beyond the negotiated window: discarded, no ACK sent.
    Dropped,
}

pub struct ReceiverEngine {
    pub rcv_next: SeqNum,
    window: u8,
    reassembly: HashMap<u16, Vec<u8>>,
    delivery: VecDeque<u8>,
    delivery_cap: usize,
}

impl ReceiverEngine {
    pub fn new(irs: SeqNum, cfg: &Config) -> ReceiverEngine {
        ReceiverEngine {
            rcv_next: irs,
            window: cfg.window,
            reassembly: HashMap::new(),
            delivery: VecDeque::new(),
            delivery_cap: cfg.window as usize * PAYLOAD_SIZE,
        }
    }

    /// Remaining capacity to advertise in the ACK's WINDOW field.
    pub fn remaining_window(&self) -> u8 {
        self.window.saturating_sub(self.reassembly.len() as u8)
    }

    /// Handle one incoming data segment (no SYN/FIN, LENGTH already
    /// validated `<= PAYLOAD_SIZE` by the codec).
    pub fn on_data(&mut self, seq: SeqNum, payload: &[u8]) -> DataOutcome {
        if seq == self.rcv_next {
            if self.delivery.len() + payload.len() > self.delivery_cap {
                return DataOutcome::Dropped;
            }
            self.delivery.extend(payload.iter().copied());
            self.rcv_next = self.rcv_next.wrapping_add(1);
            self.drain_reassembled();
            return DataOutcome::DeliveredInOrder;
        }

        let window_end = self.rcv_next.wrapping_add(self.window as u16);
        if seq.is_between(self.rcv_next, window_end) {
            if self.reassembly.contains_key(&seq.0) {
                return DataOutcome::BufferedOutOfOrder;
            }
            if self.reassembly.len() >= self.window.saturating_sub(1) as usize {
                return DataOutcome::Dropped;
            }
            trace!("receiver: buffering out-of-order seq={:?}", seq);
            self.reassembly.insert(seq.0, payload.to_vec());
            return DataOutcome::BufferedOutOfOrder;
        }

        if seq.precedes(self.rcv_next) {
            return DataOutcome::DuplicateOfDelivered;
        }

        // Beyond the advertised window: cannot happen from a well-behaved
        // sender bounded by the same negotiated window, but treat it the
        // same as a capacity violation rather than trusting the peer.
        DataOutcome::Dropped
    }

    fn drain_reassembled(&mut self) {
        loop {
            let key = self.rcv_next.0;
            let Some(len) = self.reassembly.get(&key).map(Vec::len) else {
                break;
            };
            if self.delivery.len() + len > self.delivery_cap {
                break;
            }
            let buf = self.reassembly.remove(&key).unwrap();
            self.delivery.extend(buf);
            self.rcv_next = self.rcv_next.wrapping_add(1);
        }
    }

    pub fn has_deliverable(&self) -> bool {
        !self.delivery.is_empty()
    }

    pub fn drain_deliverable(&mut self) -> Vec<u8> {
        self.delivery.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(window: u8) -> ReceiverEngine {
        ReceiverEngine::new(SeqNum(0), &Config::new(window, 50).unwrap())
    }

    #[test]
    fn in_order_segment_delivers_immediately() {
        let mut r = engine(4);
        assert_eq!(r.on_data(SeqNum(0), b"abc"), DataOutcome::DeliveredInOrder);
        assert_eq!(r.rcv_next, SeqNum(1));
        assert_eq!(r.drain_deliverable(), b"abc");
    }

    #[test]
    fn out_of_order_segment_is_buffered_then_drained() {
        let mut r = engine(4);
        assert_eq!(r.on_data(SeqNum(2), b"ghi"), DataOutcome::BufferedOutOfOrder);
        assert_eq!(r.rcv_next, SeqNum(0));
        assert_eq!(r.on_data(SeqNum(1), b"def"), DataOutcome::BufferedOutOfOrder);
        assert_eq!(r.on_data(SeqNum(0), b"abc"), DataOutcome::DeliveredInOrder);
        assert_eq!(r.rcv_next, SeqNum(3));
        assert_eq!(r.drain_deliverable(), b"abcdefghi");
    }

    #[test]
    fn duplicate_segment_does_not_move_rcv_next() {
        let mut r = engine(4);
        r.on_data(SeqNum(0), b"abc");
        let before = r.rcv_next;
        assert_eq!(r.on_data(SeqNum(0), b"abc"), DataOutcome::DuplicateOfDelivered);
        assert_eq!(r.rcv_next, before);
    }

    #[test]
    fn reassembly_dedup_ignores_repeat_out_of_order_segment() {
        let mut r = engine(4);
        r.on_data(SeqNum(1), b"def");
        assert_eq!(r.on_data(SeqNum(1), b"xyz"), DataOutcome::BufferedOutOfOrder);
        r.on_data(SeqNum(0), b"abc");
        // The first copy of segment 1 won, not the later duplicate.
        assert_eq!(r.drain_deliverable(), b"abcdef");
    }
}
