//! The per-direction flow control block.

use crate::conn::common::TcpCommon;
use crate::conn::reorder::OooBuffer;
use crate::conn::retransmit::RetransmitBuffer;
use crate::stream::modification::ModificationList;

use std::sync::Arc;

use hashlink::LinkedHashMap;

/// Per-direction flow state. Created when the first segment of a direction
/// arrives; bound to the shared block on SYN (allocated) or SYN/ACK
/// (adopted through the reverse-tuple index).
pub(crate) struct Fcb {
    /// Shared two-sided block; `None` until the handshake binds it.
    pub(crate) common: Option<Arc<TcpCommon>>,
    /// Direction index into the shared block's arrays. The handshake
    /// initiator is 0.
    pub(crate) dir: usize,
    /// Next in-order sequence number expected from this direction.
    pub(crate) expected_seq: u32,
    /// Highest sequence number released downstream.
    pub(crate) last_sent: u32,
    /// This side's FIN has been counted toward the graceful close.
    pub(crate) fin_seen: bool,
    /// A RST was already emitted for traffic arriving after close.
    pub(crate) rst_emitted: bool,
    /// Held out-of-order segments.
    pub(crate) ooo: OooBuffer,
    /// Planned payload edits per original sequence number, consumed at
    /// egress.
    pub(crate) mods: LinkedHashMap<u32, ModificationList>,
    /// Unacked transmitted segments for authenticated replay.
    pub(crate) retransmit: RetransmitBuffer,
}

impl Fcb {
    pub(crate) fn new(max_out_of_order: usize) -> Self {
        Fcb {
            common: None,
            dir: 0,
            expected_seq: 0,
            last_sent: 0,
            fin_seen: false,
            rst_emitted: false,
            ooo: OooBuffer::new(max_out_of_order),
            mods: LinkedHashMap::new(),
            retransmit: RetransmitBuffer::new(),
        }
    }

    pub(crate) fn opposite(&self) -> usize {
        1 - self.dir
    }

    /// Clears this side's buffers and trackers, keeping the common binding.
    /// Used on socket reuse and before release.
    pub(crate) fn reset_side(&mut self) {
        self.fin_seen = false;
        self.rst_emitted = false;
        self.ooo.clear();
        self.mods.clear();
        self.retransmit.kill();
    }

    /// Returns the modification list for the packet with original sequence
    /// `seq`, creating it on first use.
    pub(crate) fn modification_list(&mut self, seq: u32) -> &mut ModificationList {
        self.mods
            .entry(seq)
            .or_insert_with(|| ModificationList::new(seq))
    }

    /// Takes the modification list for `seq` out of the tracker; it is
    /// committed exactly once, on egress.
    pub(crate) fn take_modification_list(&mut self, seq: u32) -> Option<ModificationList> {
        self.mods.remove(&seq)
    }

    /// `true` once a packet of this direction has been seen by the gate.
    pub(crate) fn bound(&self) -> bool {
        self.common.is_some()
    }
}
