//! The retransmission guard's per-direction transmit buffer.
//!
//! Every outbound segment with payload is cloned into this buffer on egress.
//! When the sender retransmits, the guard replays the buffered clone rather
//! than the arriving bytes, so a forged retransmission with the same sequence
//! number cannot overwrite content the endpoint already holds.

use crate::conn::{seq_leq, seq_lt};
use crate::memory::mbuf::Mbuf;

use std::collections::VecDeque;

#[derive(Debug)]
struct Buffered {
    /// Wire sequence number of the clone (post-rewrite).
    seq: u32,
    payload_len: u32,
    mbuf: Mbuf,
}

/// Outcome of a replay request.
#[derive(Debug)]
pub(crate) enum Replay {
    /// A clone of the buffered segment to send in place of the arrival.
    Segment(Mbuf),
    /// Same segment as the previous replay; suppressed.
    Suppressed,
    /// No buffered segment carries this sequence number.
    Missing,
}

/// FIFO of unacked transmitted segments, ascending by sequence number.
/// Memory is bounded by the sender's receive window: a sender cannot have
/// more unacked bytes in flight than the peer advertised.
#[derive(Debug, Default)]
pub(crate) struct RetransmitBuffer {
    buf: VecDeque<Buffered>,
    bytes: u64,
    last_replayed: Option<u32>,
}

impl RetransmitBuffer {
    pub(crate) fn new() -> Self {
        RetransmitBuffer::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Buffered payload bytes.
    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Clones `mbuf` into the buffer. Callers only buffer segments with
    /// payload; pure ACKs carry nothing worth replaying.
    pub(crate) fn buffer(&mut self, seq: u32, payload_len: u32, mbuf: &Mbuf) {
        debug_assert!(payload_len > 0);
        if let Some(last) = self.buf.back() {
            debug_assert!(seq_lt(last.seq, seq) || last.seq == seq);
        }
        self.buf.push_back(Buffered {
            seq,
            payload_len,
            mbuf: mbuf.clone(),
        });
        self.bytes += payload_len as u64;
        self.last_replayed = None;
    }

    /// Drops every segment fully covered by the cumulative `ack`.
    pub(crate) fn prune(&mut self, ack: u32) {
        while let Some(front) = self.buf.front() {
            if seq_leq(front.seq.wrapping_add(front.payload_len), ack) {
                self.bytes -= front.payload_len as u64;
                self.buf.pop_front();
            } else {
                break;
            }
        }
    }

    /// Answers a retransmission for wire sequence `seq`. Consecutive
    /// requests for the same segment yield one replay.
    pub(crate) fn replay(&mut self, seq: u32) -> Replay {
        match self.buf.iter().find(|b| b.seq == seq) {
            Some(buffered) => {
                if self.last_replayed == Some(seq) {
                    Replay::Suppressed
                } else {
                    self.last_replayed = Some(seq);
                    Replay::Segment(buffered.mbuf.clone())
                }
            }
            None => Replay::Missing,
        }
    }

    /// Drops the whole buffer when the connection dies.
    pub(crate) fn kill(&mut self) {
        self.buf.clear();
        self.bytes = 0;
        self.last_replayed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mbuf(tag: u8) -> Mbuf {
        Mbuf::from_bytes(&[tag; 48])
    }

    #[test]
    fn core_retransmit_replay_uses_buffered_bytes() {
        let mut buf = RetransmitBuffer::new();
        buf.buffer(1001, 10, &mbuf(b'A'));

        match buf.replay(1001) {
            Replay::Segment(clone) => assert!(clone.data().iter().all(|&b| b == b'A')),
            other => panic!("expected replay, got {:?}", other),
        }
        // The consecutive duplicate is suppressed.
        assert!(matches!(buf.replay(1001), Replay::Suppressed));
    }

    #[test]
    fn core_retransmit_prune_by_cumulative_ack() {
        let mut buf = RetransmitBuffer::new();
        buf.buffer(1001, 100, &mbuf(1));
        buf.buffer(1101, 100, &mbuf(2));
        buf.buffer(1201, 100, &mbuf(3));

        // Covers the first two segments exactly.
        buf.prune(1201);
        assert_eq!(buf.len(), 1);
        assert!(matches!(buf.replay(1001), Replay::Missing));
        assert!(matches!(buf.replay(1201), Replay::Segment(_)));
    }

    #[test]
    fn core_retransmit_kill_drops_everything() {
        let mut buf = RetransmitBuffer::new();
        buf.buffer(1001, 10, &mbuf(1));
        buf.kill();
        assert_eq!(buf.len(), 0);
        assert!(matches!(buf.replay(1001), Replay::Missing));
    }
}
