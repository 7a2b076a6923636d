//! Out-of-order segment buffering and retransmission classification.

use crate::conn::pdu::Segment;
use crate::conn::{seq_leq, seq_lt};

use std::collections::VecDeque;

use anyhow::{bail, Result};

/// What to do with a segment whose sequence number is below the expected one.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum RetransmitClass {
    /// Overlaps the expected sequence: part of the payload is new. Forwarded
    /// whole; the receiver discards the overlap.
    Split,
    /// Entirely old and already released downstream: candidates for an
    /// authenticated replay from the guard buffer.
    Replay,
    /// Entirely old but never released; the original is still held in the
    /// reorder buffer, so replaying the arriving bytes would only enable
    /// sequence-overwrite attacks.
    Drop,
}

/// Classifies a segment against the direction's reorder state. Returns
/// `None` when the segment is not a retransmission (at or past expected).
pub(crate) fn classify_retransmission(
    expected_seq: u32,
    last_sent: u32,
    seq_no: u32,
    end_seq: u32,
) -> Option<RetransmitClass> {
    if !seq_lt(seq_no, expected_seq) {
        return None;
    }
    if seq_lt(expected_seq, end_seq) {
        return Some(RetransmitClass::Split);
    }
    if seq_leq(seq_no, last_sent) {
        return Some(RetransmitClass::Replay);
    }
    Some(RetransmitClass::Drop)
}

/// Held out-of-order segments, ascending by sequence number, no duplicates.
#[derive(Debug)]
pub(crate) struct OooBuffer {
    buf: VecDeque<Segment>,
    capacity: usize,
}

pub(crate) enum OooInsert {
    Held,
    Duplicate,
}

impl OooBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        OooBuffer {
            buf: VecDeque::new(),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }

    /// Inserts a future segment at its sorted position. A segment whose
    /// sequence number is already held is dropped.
    pub(crate) fn insert(&mut self, segment: Segment) -> Result<OooInsert> {
        let seq = segment.seq_no();
        let mut at = self.buf.len();
        for (idx, held) in self.buf.iter().enumerate() {
            if held.seq_no() == seq {
                log::debug!("Duplicate out-of-order segment at {}", seq);
                return Ok(OooInsert::Duplicate);
            }
            if seq_lt(seq, held.seq_no()) {
                at = idx;
                break;
            }
        }
        if self.buf.len() >= self.capacity {
            bail!("Out-of-order buffer overflow.");
        }
        self.buf.insert(at, segment);
        Ok(OooInsert::Held)
    }

    /// Pops the next segment that continues the in-order stream at
    /// `expected_seq`. Segments the stream has already moved past are
    /// discarded along the way.
    pub(crate) fn pop_in_order(&mut self, expected_seq: u32) -> Option<Segment> {
        while let Some(head) = self.buf.front() {
            let seq = head.seq_no();
            if seq == expected_seq {
                return self.buf.pop_front();
            }
            if seq_lt(seq, expected_seq) {
                log::debug!("Dropping stale held segment at {}", seq);
                self.buf.pop_front();
                continue;
            }
            break;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::pdu::TcpContext;
    use crate::flowtable::flow_id::FlowId;
    use crate::memory::mbuf::Mbuf;
    use crate::protocols::packet::tcp::ACK;
    use std::net::Ipv4Addr;

    fn segment(seq: u32, len: usize) -> Segment {
        let ctxt = TcpContext {
            flow: FlowId {
                src_ip: Ipv4Addr::new(10, 0, 0, 1),
                dst_ip: Ipv4Addr::new(10, 0, 0, 2),
                src_port: 1000,
                dst_port: 80,
            },
            ip_offset: 0,
            tcp_offset: 20,
            offset: 40,
            length: len,
            seq_no: seq,
            ack_no: 0,
            flags: ACK,
            window: 1024,
        };
        Segment::new(Mbuf::from_bytes(&vec![0u8; 40 + len]), ctxt)
    }

    #[test]
    fn core_reorder_sorted_insert_and_drain() {
        let mut buf = OooBuffer::new(16);
        for seq in [1301u32, 1101, 1201] {
            assert!(matches!(buf.insert(segment(seq, 100)), Ok(OooInsert::Held)));
        }
        assert_eq!(buf.len(), 3);

        // Nothing at the hole yet.
        assert!(buf.pop_in_order(1001).is_none());

        let mut expected = 1101;
        let mut drained = vec![];
        while let Some(seg) = buf.pop_in_order(expected) {
            expected = seg.ctxt.next_seq();
            drained.push(seg.seq_no());
        }
        assert_eq!(drained, vec![1101, 1201, 1301]);
        assert!(buf.is_empty());
    }

    #[test]
    fn core_reorder_duplicate_dropped() {
        let mut buf = OooBuffer::new(16);
        assert!(matches!(buf.insert(segment(1101, 100)), Ok(OooInsert::Held)));
        assert!(matches!(buf.insert(segment(1101, 50)), Ok(OooInsert::Duplicate)));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn core_reorder_overflow() {
        let mut buf = OooBuffer::new(2);
        buf.insert(segment(1101, 10)).unwrap();
        buf.insert(segment(1201, 10)).unwrap();
        assert!(buf.insert(segment(1301, 10)).is_err());
    }

    #[test]
    fn core_reorder_classification() {
        // In-order and future segments are not retransmissions.
        assert_eq!(classify_retransmission(1000, 900, 1000, 1100), None);
        assert_eq!(classify_retransmission(1000, 900, 1500, 1600), None);

        // Overlapping the expected sequence: split.
        assert_eq!(
            classify_retransmission(1000, 900, 950, 1050),
            Some(RetransmitClass::Split)
        );
        // Old and already released downstream: replay.
        assert_eq!(
            classify_retransmission(1000, 900, 850, 950),
            Some(RetransmitClass::Replay)
        );
        // Old but still held upstream of the release point: drop.
        assert_eq!(
            classify_retransmission(2000, 900, 1000, 1100),
            Some(RetransmitClass::Drop)
        );
    }
}
