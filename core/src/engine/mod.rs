//! The per-worker middlebox engine.
//!
//! One `TcpMiddlebox` is maintained per worker; the host dispatch must keep
//! per-flow affinity so a flow's two directions are the only state shared
//! across workers (through the connection's common block). The engine owns
//! the flow table, the reverse-tuple index binding the two directions of a
//! connection, the shared-block pool, and the counters.
//!
//! Boundary to the host graph:
//! - [`TcpMiddlebox::push`]: ingress gate (per-direction port 0 input);
//! - [`TcpMiddlebox::egress`]: the rewriter, after downstream elements ran;
//! - [`TcpMiddlebox::retransmit`]: the guard's retransmit input (port 1);
//! - `remove_bytes` / `insert_bytes` / `request_more_packets` /
//!   `close_connection`: the downstream modification protocol;
//! - [`TcpMiddlebox::check_expired`]: amortised expiry scan.

pub(crate) mod egress;
pub(crate) mod gate;

use crate::config::RuntimeConfig;
use crate::conn::common::{CommonPool, TcpCommon};
use crate::conn::fcb::Fcb;
use crate::conn::pdu::{Segment, TcpContext};
use crate::conn::state::TcpState;
use crate::flowtable::clock::Tick;
use crate::flowtable::flow_id::FlowId;
use crate::flowtable::{FlowTable, ScanCursor};
use crate::memory::mbuf::Mbuf;
use crate::protocols::packet::checksum;
use crate::stats::Stats;

use std::sync::Weak;

use anyhow::{anyhow, Result};

/// Packets leaving the engine after one call: `forward` continues downstream
/// (port 0), `opposite` is injected toward the segment's sender (port 1) for
/// middlebox-originated control segments.
#[derive(Debug, Default)]
pub struct Delivery {
    pub forward: Vec<Mbuf>,
    pub opposite: Vec<Mbuf>,
}

impl Delivery {
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.opposite.is_empty()
    }
}

/// Engine options resolved from the runtime configuration.
pub(crate) struct EngineConfig {
    pub(crate) max_flows: usize,
    pub(crate) scan_buckets: usize,
    pub(crate) pool_capacity: usize,
    /// Soft flow timeout in clock ticks, armed at SYN and refreshed per
    /// packet.
    pub(crate) flow_timeout: u16,
    pub(crate) max_out_of_order: usize,
    pub(crate) reorder: bool,
    pub(crate) proactive_dup_ack: bool,
    pub(crate) allow_resize: bool,
    pub(crate) software_checksum: bool,
    pub(crate) verify_checksum: bool,
    pub(crate) reack_on_retransmit: bool,
}

impl From<&RuntimeConfig> for EngineConfig {
    fn from(config: &RuntimeConfig) -> Self {
        EngineConfig {
            max_flows: config.flow_table.max_flows,
            scan_buckets: config.flow_table.scan_buckets,
            pool_capacity: config.pools.tcp_common,
            flow_timeout: config.tcp.timeout_ticks(),
            max_out_of_order: config.reorder.max_out_of_order,
            reorder: config.reorder.enabled,
            proactive_dup_ack: config.reorder.proactive_dup_ack,
            allow_resize: config.rewrite.allow_resize,
            software_checksum: config.rewrite.software_checksum,
            verify_checksum: config.rewrite.verify_checksum,
            reack_on_retransmit: config.rewrite.reack_on_retransmit,
        }
    }
}

/// The transparent TCP middlebox core for one worker.
pub struct TcpMiddlebox {
    cfg: EngineConfig,
    /// Per-direction flow control blocks.
    flows: FlowTable<Fcb>,
    /// Reverse-tuple index: SYN registers, SYN/ACK adopts.
    commons: FlowTable<Weak<TcpCommon>>,
    pool: CommonPool,
    stats: Stats,
    flow_cursor: ScanCursor,
    common_cursor: ScanCursor,
}

impl TcpMiddlebox {
    pub fn new(config: &RuntimeConfig) -> Self {
        let cfg = EngineConfig::from(config);
        TcpMiddlebox {
            flows: FlowTable::with_capacity(cfg.max_flows),
            commons: FlowTable::with_capacity(cfg.max_flows),
            pool: CommonPool::new(cfg.pool_capacity),
            stats: Stats::default(),
            flow_cursor: ScanCursor::default(),
            common_cursor: ScanCursor::default(),
            cfg,
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Current state of the connection the oriented 4-tuple belongs to.
    pub fn connection_state(&self, flow: &FlowId, now: Tick) -> Option<TcpState> {
        let fcb = self.flows.get(flow, now)?;
        fcb.common.as_ref().map(|common| common.state())
    }

    /// Ingress gate: runs the state machine and the reorderer over a batch
    /// of same-direction-ordered segments.
    pub fn push(&mut self, batch: Vec<Mbuf>, now: Tick) -> Delivery {
        let mut out = Delivery::default();
        for mbuf in batch {
            self.stats.packets += 1;
            let ctxt = match TcpContext::parse(&mbuf) {
                Ok(ctxt) => ctxt,
                Err(e) => {
                    log::debug!("Dropping unparseable packet: {}", e);
                    self.stats.malformed += 1;
                    continue;
                }
            };
            if self.cfg.verify_checksum && !checksum_ok(&mbuf, &ctxt) {
                self.stats.checksum_failed += 1;
                continue;
            }
            self.ingress_segment(Segment::new(mbuf, ctxt), now, &mut out);
        }
        self.stats.forwarded += out.forward.len() as u64;
        self.stats.crafted += out.opposite.len() as u64;
        out
    }

    fn ingress_segment(&mut self, seg: Segment, now: Tick, out: &mut Delivery) {
        let Self {
            cfg,
            flows,
            commons,
            pool,
            stats,
            ..
        } = self;
        let flow = seg.ctxt.flow;
        let expiry = now.advanced(cfg.flow_timeout);

        if flows.get_mut(&flow, now).is_some() {
            flows.refresh(&flow, now, expiry);
        } else if let Err(e) = flows.insert(flow, Fcb::new(cfg.max_out_of_order), expiry, now) {
            log::error!("Flow table rejected {}: {}", flow, e);
            stats.resource_exhausted += 1;
            return;
        }
        let fcb = flows.get_mut(&flow, now).expect("flow entry just ensured");

        let mut ctx = gate::GateCtx {
            cfg: &*cfg,
            commons: &mut *commons,
            pool: &mut *pool,
            stats: &mut *stats,
            now,
        };
        match gate::process(fcb, seg, &mut ctx, out) {
            gate::FlowAction::Keep => {}
            gate::FlowAction::Release => {
                if let Some(mut fcb) = flows.delete(&flow, now) {
                    gate::release_fcb(&mut fcb, pool);
                }
            }
        }
    }

    /// Egress gate: rewrites sequence/ack fields for the committed payload
    /// edits and feeds the retransmission guard's buffer (port 0).
    pub fn egress(&mut self, mbuf: Mbuf, now: Tick) -> Delivery {
        let mut out = Delivery::default();
        let Self {
            cfg, flows, stats, ..
        } = self;
        let ctxt = match TcpContext::parse(&mbuf) {
            Ok(ctxt) => ctxt,
            Err(e) => {
                log::debug!("Dropping unparseable egress packet: {}", e);
                stats.malformed += 1;
                return out;
            }
        };
        match flows.get_mut(&ctxt.flow, now) {
            Some(fcb) => egress::process(fcb, mbuf, ctxt, cfg, stats, &mut out),
            None => {
                log::error!("Egress packet for unknown flow {}", ctxt.flow);
                stats.malformed += 1;
            }
        }
        stats.crafted += out.opposite.len() as u64;
        out
    }

    /// Retransmit input (guard port 1).
    pub fn retransmit(&mut self, batch: Vec<Mbuf>, now: Tick) -> Delivery {
        let mut out = Delivery::default();
        let Self {
            cfg,
            flows,
            commons,
            pool,
            stats,
            ..
        } = self;
        for mbuf in batch {
            let ctxt = match TcpContext::parse(&mbuf) {
                Ok(ctxt) => ctxt,
                Err(e) => {
                    log::debug!("Dropping unparseable retransmission: {}", e);
                    stats.malformed += 1;
                    continue;
                }
            };
            let Some(fcb) = flows.get_mut(&ctxt.flow, now) else {
                // Never saw the flow; nothing to authenticate against.
                out.forward.push(mbuf);
                continue;
            };
            let Some(common) = fcb.common.clone() else {
                out.forward.push(mbuf);
                continue;
            };
            if common.state() == TcpState::Closed {
                // Let RSTs and stragglers of a dead flow through untouched.
                out.forward.push(mbuf);
                continue;
            }
            let mut ctx = gate::GateCtx {
                cfg: &*cfg,
                commons: &mut *commons,
                pool: &mut *pool,
                stats: &mut *stats,
                now,
            };
            gate::guard_retransmit_segment(fcb, &common, Segment::new(mbuf, ctxt), &mut ctx, &mut out);
        }
        out
    }

    /// Downstream modification protocol: shrinks `length` payload bytes at
    /// `position` (relative to the payload start), recording the edit for
    /// the egress rewrite.
    pub fn remove_bytes(&mut self, mbuf: &mut Mbuf, position: u32, length: u32, now: Tick) -> Result<()> {
        let ctxt = TcpContext::parse(mbuf)?;
        let fcb = self
            .flows
            .get_mut(&ctxt.flow, now)
            .ok_or_else(|| anyhow!("no flow state for {}", ctxt.flow))?;
        let flow_position = ctxt.seq_no.wrapping_add(position);
        fcb.modification_list(ctxt.seq_no)
            .add_modification(flow_position, -(length as i64))?;
        mbuf.remove_bytes(ctxt.offset + position as usize, length as usize)?;
        Ok(())
    }

    /// Downstream modification protocol: grows the payload by `length` zeroed
    /// bytes at `position`, recording the edit for the egress rewrite.
    pub fn insert_bytes(&mut self, mut mbuf: Mbuf, position: u32, length: u32, now: Tick) -> Result<Mbuf> {
        let ctxt = TcpContext::parse(&mbuf)?;
        let fcb = self
            .flows
            .get_mut(&ctxt.flow, now)
            .ok_or_else(|| anyhow!("no flow state for {}", ctxt.flow))?;
        let flow_position = ctxt.seq_no.wrapping_add(position);
        fcb.modification_list(ctxt.seq_no)
            .add_modification(flow_position, length as i64)?;
        mbuf.insert_bytes(ctxt.offset + position as usize, length as usize)?;
        Ok(mbuf)
    }

    /// Downstream modification protocol: emits an ACK toward the sender of
    /// `mbuf` to open its window.
    pub fn request_more_packets(&mut self, mbuf: &Mbuf, force: bool, now: Tick) -> Delivery {
        let mut out = Delivery::default();
        let Self {
            cfg, flows, stats, ..
        } = self;
        let Ok(ctxt) = TcpContext::parse(mbuf) else {
            return out;
        };
        let Some(fcb) = flows.get_mut(&ctxt.flow, now) else {
            return out;
        };
        let Some(common) = fcb.common.clone() else {
            return out;
        };
        if common.state() == TcpState::Closed {
            log::warn!("Requesting more packets for a closed connection");
            return out;
        }
        let seq = if cfg.allow_resize {
            mbuf.ann().initial_ack
        } else {
            ctxt.ack_no
        };
        let mut ack = ctxt.seq_no.wrapping_add(ctxt.length as u32);
        if ctxt.syn() || ctxt.fin() {
            ack = ack.wrapping_add(1);
        }
        let opp = fcb.opposite();
        let mut guard = common.lock();
        let crafted = egress::forge_ack(
            &mut guard.maintainers[opp],
            ctxt.flow.reversed(),
            seq,
            ack,
            force,
        );
        drop(guard);
        if let Some(packet) = crafted {
            stats.acks_crafted += 1;
            out.opposite.push(packet);
        }
        out
    }

    /// Downstream modification protocol: drives the connection of `mbuf` to
    /// an artificial close. Graceful sends a FIN onward; forceful resets
    /// both endpoints and kills the flow's buffers.
    pub fn close_connection(&mut self, mbuf: &Mbuf, graceful: bool, now: Tick) -> Delivery {
        let mut out = Delivery::default();
        let Self { flows, stats, .. } = self;
        let Ok(ctxt) = TcpContext::parse(mbuf) else {
            return out;
        };
        let Some(fcb) = flows.get_mut(&ctxt.flow, now) else {
            return out;
        };
        let Some(common) = fcb.common.clone() else {
            return out;
        };
        let dir = fcb.dir;
        let opp = fcb.opposite();

        let mut guard = common.lock();
        if graceful {
            guard.set_state(TcpState::BeingClosedArtificially1);
            if let Some(fin) = egress::send_closing_packet(&mut guard.maintainers[dir], ctxt.flow, true)
            {
                stats.crafted += 1;
                out.forward.push(fin);
            }
        } else {
            guard.set_state(TcpState::Closed);
            if let Some(rst) =
                egress::send_closing_packet(&mut guard.maintainers[dir], ctxt.flow, false)
            {
                stats.crafted += 1;
                out.forward.push(rst);
            }
            if let Some(rst) = egress::send_closing_packet(
                &mut guard.maintainers[opp],
                ctxt.flow.reversed(),
                false,
            ) {
                stats.crafted += 1;
                out.opposite.push(rst);
            }
            drop(guard);
            fcb.reset_side();
        }
        out
    }

    /// Amortised expiry scan; call once per batch. Releases flows whose soft
    /// timeout elapsed and reaps dead reverse-tuple entries.
    pub fn check_expired(&mut self, now: Tick) {
        let Self {
            cfg,
            flows,
            commons,
            pool,
            stats,
            flow_cursor,
            common_cursor,
            ..
        } = self;
        flows.scan(flow_cursor, now, cfg.scan_buckets, |flow, fcb, expired| {
            if !expired {
                return true;
            }
            log::debug!("Expiring flow {}", flow);
            stats.flows_expired += 1;
            gate::release_fcb(fcb, pool);
            false
        });
        commons.scan(common_cursor, now, cfg.scan_buckets, |_, weak, expired| {
            !expired && weak.upgrade().is_some()
        });
    }
}

/// Verifies the TCP checksum of an ingress segment. A correct segment sums
/// to zero with its stored checksum included.
fn checksum_ok(mbuf: &Mbuf, ctxt: &TcpContext) -> bool {
    match mbuf.get_data_slice(ctxt.tcp_offset, mbuf.data_len() - ctxt.tcp_offset) {
        Ok(segment) => {
            checksum::tcp_checksum(
                u32::from(ctxt.flow.src_ip),
                u32::from(ctxt.flow.dst_ip),
                segment,
            ) == 0
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::protocols::packet::tcp::{ACK, FIN, PSH, RST, SYN};

    use std::net::Ipv4Addr;
    use std::sync::Arc;

    const WIN: u16 = 1024;

    fn flow_ab() -> FlowId {
        FlowId {
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 40_000,
            dst_port: 80,
        }
    }

    fn packet(flow: FlowId, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Mbuf {
        egress::forge_packet(flow, seq, ack, WIN, flags, payload)
    }

    fn parsed(mbuf: &Mbuf) -> TcpContext {
        TcpContext::parse(mbuf).unwrap()
    }

    fn payload_of(mbuf: &Mbuf) -> Vec<u8> {
        let ctxt = parsed(mbuf);
        mbuf.data()[ctxt.offset..].to_vec()
    }

    fn middlebox() -> TcpMiddlebox {
        // Small table so one expiry scan covers every bucket.
        let mut config = default_config();
        config.flow_table.max_flows = 1024;
        TcpMiddlebox::new(&config)
    }

    /// SYN / SYN+ACK / ACK; returns the two direction tuples.
    fn establish(mb: &mut TcpMiddlebox, now: Tick) -> (FlowId, FlowId) {
        let ab = flow_ab();
        let ba = ab.reversed();
        let out = mb.push(vec![packet(ab, 1000, 0, SYN, &[])], now);
        assert_eq!(out.forward.len(), 1);
        let out = mb.push(vec![packet(ba, 5000, 1001, SYN | ACK, &[])], now);
        assert_eq!(out.forward.len(), 1);
        let out = mb.push(vec![packet(ab, 1001, 5001, ACK, &[])], now);
        assert_eq!(out.forward.len(), 1);
        assert_eq!(mb.connection_state(&ab, now), Some(TcpState::Open));
        (ab, ba)
    }

    #[test]
    fn core_handshake_establishes_state() {
        let now = Tick(0);
        let mut mb = middlebox();
        let ab = flow_ab();
        let ba = ab.reversed();

        mb.push(vec![packet(ab, 1000, 0, SYN, &[])], now);
        assert_eq!(mb.connection_state(&ab, now), Some(TcpState::Establishing1));

        mb.push(vec![packet(ba, 5000, 1001, SYN | ACK, &[])], now);
        assert_eq!(mb.connection_state(&ba, now), Some(TcpState::Establishing2));

        mb.push(vec![packet(ab, 1001, 5001, ACK, &[])], now);
        assert_eq!(mb.connection_state(&ab, now), Some(TcpState::Open));

        let fcb_a = mb.flows.get(&ab, now).unwrap();
        let fcb_b = mb.flows.get(&ba, now).unwrap();
        assert_eq!(fcb_a.expected_seq, 1001);
        assert_eq!(fcb_b.expected_seq, 5001);
        assert_eq!(fcb_a.dir, 0);
        assert_eq!(fcb_b.dir, 1);

        // One shared block, held by both sides.
        let common = fcb_a.common.as_ref().unwrap();
        assert!(Arc::ptr_eq(common, fcb_b.common.as_ref().unwrap()));
        assert_eq!(Arc::strong_count(common), 2);
        assert_eq!(mb.pool.outstanding(), 1);
    }

    #[test]
    fn core_reorder_fills_hole() {
        let now = Tick(0);
        let mut mb = middlebox();
        let (ab, _) = establish(&mut mb, now);

        // The future segment is held, releasing nothing.
        let p2 = packet(ab, 1101, 5001, ACK | PSH, &[b'2'; 100]);
        let out = mb.push(vec![p2], now);
        assert!(out.forward.is_empty());
        assert_eq!(mb.flows.get(&ab, now).unwrap().ooo.len(), 1);

        // Filling the hole releases both, in order.
        let p1 = packet(ab, 1001, 5001, ACK | PSH, &[b'1'; 100]);
        let out = mb.push(vec![p1], now);
        assert_eq!(out.forward.len(), 2);
        assert_eq!(parsed(&out.forward[0]).seq_no, 1001);
        assert_eq!(parsed(&out.forward[1]).seq_no, 1101);
        assert_eq!(mb.flows.get(&ab, now).unwrap().expected_seq, 1201);
    }

    #[test]
    fn core_retransmission_replays_buffered_payload() {
        let now = Tick(0);
        let mut mb = middlebox();
        let (ab, _) = establish(&mut mb, now);

        let p1 = packet(ab, 1001, 5001, ACK | PSH, b"AAAAAAAAAA");
        let mut out = mb.push(vec![p1], now);
        let forwarded = out.forward.pop().unwrap();
        let out = mb.egress(forwarded, now);
        assert_eq!(out.forward.len(), 1);
        assert_eq!(mb.flows.get(&ab, now).unwrap().retransmit.len(), 1);

        // A "retransmission" carrying different bytes must never reach the
        // receiver; the buffered original is replayed instead.
        let forged = packet(ab, 1001, 5001, ACK | PSH, b"XXXXXXXXXX");
        let out = mb.retransmit(vec![forged], now);
        assert_eq!(out.forward.len(), 1);
        assert_eq!(payload_of(&out.forward[0]), b"AAAAAAAAAA");

        // An immediate duplicate yields exactly one replay.
        let forged = packet(ab, 1001, 5001, ACK | PSH, b"XXXXXXXXXX");
        let out = mb.retransmit(vec![forged], now);
        assert!(out.forward.is_empty());
        assert_eq!(mb.stats.replays, 1);
        assert_eq!(mb.stats.replays_suppressed, 1);
    }

    #[test]
    fn core_payload_removal_rewrites_sequences() {
        let now = Tick(0);
        let mut mb = middlebox();
        let (ab, ba) = establish(&mut mb, now);

        let p1 = packet(ab, 1001, 5001, ACK | PSH, &[b'x'; 100]);
        let mut out = mb.push(vec![p1], now);
        let mut p1 = out.forward.pop().unwrap();

        // A downstream filter trims 10 bytes mid-payload before egress.
        mb.remove_bytes(&mut p1, 50, 10, now).unwrap();
        let out = mb.egress(p1, now);
        let p1 = &out.forward[0];
        let ctxt = parsed(p1);
        assert_eq!(ctxt.seq_no, 1001);
        assert_eq!(ctxt.length, 90);
        assert_eq!(p1.data_len(), 130);

        // The receiver's ACK is translated for the original sender.
        let ack = packet(ba, 5001, 1101, ACK, &[]);
        let out = mb.push(vec![ack], now);
        assert_eq!(out.forward.len(), 1);
        assert_eq!(parsed(&out.forward[0]).ack_no, 1091);

        // Later sequence numbers of the same direction shift by the removal.
        let later = packet(ab, 1200, 5001, ACK | PSH, &[b'y'; 40]);
        let out = mb.egress(later, now);
        assert_eq!(parsed(&out.forward[0]).seq_no, 1190);
    }

    #[test]
    fn core_insert_bytes_grows_and_rewrites() {
        let now = Tick(0);
        let mut mb = middlebox();
        let (ab, ba) = establish(&mut mb, now);

        let p1 = packet(ab, 1001, 5001, ACK | PSH, &[b'x'; 50]);
        let mut out = mb.push(vec![p1], now);
        let p1 = out.forward.pop().unwrap();

        let p1 = mb.insert_bytes(p1, 10, 5, now).unwrap();
        let out = mb.egress(p1, now);
        let ctxt = parsed(&out.forward[0]);
        assert_eq!(ctxt.length, 55);

        // The receiver acks the grown stream; the sender sees its own.
        let ack = packet(ba, 5001, 1051, ACK, &[]);
        let out = mb.push(vec![ack], now);
        assert_eq!(parsed(&out.forward[0]).ack_no, 1056);
    }

    #[test]
    fn core_socket_reuse_in_time_wait() {
        let now = Tick(0);
        let mut mb = middlebox();
        let (ab, _ba) = establish(&mut mb, now);

        // A RST kills the connection; both sides stay in the table.
        let out = mb.push(vec![packet(ab, 1001, 5001, RST | ACK, &[])], now);
        assert_eq!(out.forward.len(), 1);
        assert_eq!(mb.connection_state(&ab, now), Some(TcpState::Closed));
        assert_eq!(mb.pool.outstanding(), 1);

        // The same 4-tuple reappears: the block is reinitialized in place.
        let out = mb.push(vec![packet(ab, 7000, 0, SYN, &[])], now);
        assert_eq!(out.forward.len(), 1);
        assert_eq!(mb.connection_state(&ab, now), Some(TcpState::Establishing1));
        let fcb_a = mb.flows.get(&ab, now).unwrap();
        assert_eq!(fcb_a.expected_seq, 7001);
        assert_eq!(Arc::strong_count(fcb_a.common.as_ref().unwrap()), 2);

        // No second block was allocated, nothing leaked.
        assert_eq!(mb.pool.outstanding(), 1);
        assert_eq!(mb.stats.flows_reused, 1);
    }

    #[test]
    fn core_synack_reuse_detected_on_open() {
        let now = Tick(0);
        let mut mb = middlebox();
        let (_ab, ba) = establish(&mut mb, now);

        // The responder's SYN/ACK of a reused 5-tuple arrives while the old
        // connection still looks open: this side re-establishes in place.
        let out = mb.push(vec![packet(ba, 9000, 7001, SYN | ACK, &[])], now);
        assert_eq!(out.forward.len(), 1);
        assert_eq!(
            mb.connection_state(&ba, now),
            Some(TcpState::Establishing2)
        );
        assert_eq!(mb.flows.get(&ba, now).unwrap().expected_seq, 9001);
        assert_eq!(mb.pool.outstanding(), 1);
    }

    #[test]
    fn core_graceful_close_releases_state_once() {
        let now = Tick(0);
        let mut mb = middlebox();
        let (ab, ba) = establish(&mut mb, now);

        let out = mb.push(vec![packet(ab, 1001, 5001, FIN | ACK, &[])], now);
        assert_eq!(out.forward.len(), 1);
        assert_eq!(
            mb.connection_state(&ab, now),
            Some(TcpState::BeingClosedGraceful1)
        );

        let out = mb.push(vec![packet(ba, 5001, 1002, FIN | ACK, &[])], now);
        assert_eq!(out.forward.len(), 1);
        assert_eq!(
            mb.connection_state(&ba, now),
            Some(TcpState::BeingClosedGraceful2)
        );

        let out = mb.push(vec![packet(ab, 1002, 5002, ACK, &[])], now);
        assert_eq!(out.forward.len(), 1);
        assert_eq!(mb.connection_state(&ab, now), Some(TcpState::Closed));
        assert_eq!(mb.pool.outstanding(), 1);

        // The expiry scan returns both FCBs and the shared block to their
        // pools, exactly once.
        let later = now.advanced(400);
        mb.check_expired(later);
        assert_eq!(mb.flows.occupied(), 0);
        assert_eq!(mb.pool.outstanding(), 0);
        assert_eq!(mb.stats.flows_expired, 2);
    }

    #[test]
    fn core_closed_connection_rst_once() {
        let now = Tick(0);
        let mut mb = middlebox();
        let (ab, _) = establish(&mut mb, now);
        mb.push(vec![packet(ab, 1001, 5001, RST | ACK, &[])], now);
        assert_eq!(mb.connection_state(&ab, now), Some(TcpState::Closed));

        // Payload after close: dropped, RST emitted toward the sender.
        let out = mb.push(vec![packet(ab, 1001, 5001, ACK | PSH, &[1; 20])], now);
        assert!(out.forward.is_empty());
        assert_eq!(out.opposite.len(), 1);
        assert!(parsed(&out.opposite[0]).rst());

        // Only the first occurrence answers with a RST.
        let out = mb.push(vec![packet(ab, 1001, 5001, ACK | PSH, &[1; 20])], now);
        assert!(out.forward.is_empty());
        assert!(out.opposite.is_empty());
        assert_eq!(mb.stats.closed_in_flight, 2);
    }

    #[test]
    fn core_artificial_close_full_path() {
        let now = Tick(0);
        let mut mb = middlebox();
        let (ab, ba) = establish(&mut mb, now);

        // Move one data segment so the egress bookkeeping has a seq/ack.
        let p = packet(ab, 1001, 5001, ACK | PSH, &[9; 10]);
        let mut out = mb.push(vec![p], now);
        let forwarded = out.forward.pop().unwrap();
        let mut out = mb.egress(forwarded, now);
        let trigger = out.forward.pop().unwrap();

        // A downstream element decides to end the connection gracefully.
        let out = mb.close_connection(&trigger, true, now);
        assert_eq!(out.forward.len(), 1);
        let fin = parsed(&out.forward[0]);
        assert!(fin.fin());
        assert_eq!(fin.seq_no, 1011);
        assert_eq!(
            mb.connection_state(&ab, now),
            Some(TcpState::BeingClosedArtificially1)
        );

        // The peer answers with its FIN, acking the FIN we injected; the
        // extra sequence number is peeled off its ACK.
        let out = mb.push(vec![packet(ba, 5001, 1012, FIN | ACK, &[])], now);
        assert_eq!(out.forward.len(), 1);
        assert_eq!(parsed(&out.forward[0]).ack_no, 1011);
        assert_eq!(
            mb.connection_state(&ba, now),
            Some(TcpState::BeingClosedArtificially2)
        );

        // The original sender's FIN is absorbed: acked on the peer's
        // behalf, stripped, and forwarded one sequence number later.
        let out = mb.push(vec![packet(ab, 1011, 5002, FIN | ACK, &[])], now);
        assert_eq!(out.forward.len(), 1);
        let absorbed = parsed(&out.forward[0]);
        assert!(!absorbed.fin());
        assert_eq!(absorbed.seq_no, 1012);
        assert_eq!(out.opposite.len(), 1);
        assert_eq!(parsed(&out.opposite[0]).ack_no, 1012);
        assert_eq!(mb.connection_state(&ab, now), Some(TcpState::Closed));
    }

    #[test]
    fn core_reordered_arrival_yields_same_byte_stream() {
        let now = Tick(0);
        let payloads: Vec<Vec<u8>> = (0..4).map(|i| vec![b'a' + i as u8; 50]).collect();
        let seqs = [1001u32, 1051, 1101, 1151];

        let run = |order: &[usize]| -> Vec<u8> {
            let mut mb = middlebox();
            let (ab, _) = establish(&mut mb, now);
            let mut stream = vec![];
            for &i in order {
                let p = packet(ab, seqs[i], 5001, ACK | PSH, &payloads[i]);
                let out = mb.push(vec![p], now);
                for forwarded in &out.forward {
                    stream.extend(payload_of(forwarded));
                }
            }
            stream
        };

        let in_order = run(&[0, 1, 2, 3]);
        assert_eq!(in_order.len(), 200);
        for order in [[3, 2, 1, 0], [1, 0, 3, 2], [2, 3, 0, 1]] {
            assert_eq!(run(&order), in_order);
        }
    }

    #[test]
    fn core_proactive_dup_ack_on_gap() {
        let now = Tick(0);
        let mut config = default_config();
        config.flow_table.max_flows = 1024;
        config.reorder.proactive_dup_ack = true;
        let mut mb = TcpMiddlebox::new(&config);
        let (ab, _) = establish(&mut mb, now);

        // A gap opens: the sender is nudged with a duplicate ACK for the
        // last in-order byte.
        let out = mb.push(vec![packet(ab, 1101, 5001, ACK | PSH, &[7; 100])], now);
        assert!(out.forward.is_empty());
        assert_eq!(out.opposite.len(), 1);
        let dup = parsed(&out.opposite[0]);
        assert!(dup.ack());
        assert_eq!(dup.ack_no, 1001);
        assert_eq!(dup.flow, ab.reversed());
    }

    #[test]
    fn core_request_more_packets_crafts_ack() {
        let now = Tick(0);
        let mut mb = middlebox();
        let (ab, _) = establish(&mut mb, now);

        let p = packet(ab, 1001, 5001, ACK | PSH, &[3; 30]);
        let mut out = mb.push(vec![p], now);
        let forwarded = out.forward.pop().unwrap();

        let out = mb.request_more_packets(&forwarded, true, now);
        assert_eq!(out.opposite.len(), 1);
        let ack = parsed(&out.opposite[0]);
        assert_eq!(ack.ack_no, 1031);
        assert_eq!(ack.flow, ab.reversed());
    }

    #[test]
    fn core_retransmit_of_acked_data_is_re_acked() {
        let now = Tick(0);
        let mut mb = middlebox();
        let (ab, ba) = establish(&mut mb, now);

        // Data travels and the receiver acknowledges it.
        let p = packet(ab, 1001, 5001, ACK | PSH, &[5; 100]);
        let mut out = mb.push(vec![p], now);
        let forwarded = out.forward.pop().unwrap();
        mb.egress(forwarded, now);
        let out = mb.push(vec![packet(ba, 5001, 1101, ACK, &[])], now);
        assert_eq!(out.forward.len(), 1);

        // The sender retransmits anyway: it never saw the ACK. No replay;
        // the ACK is repeated toward it.
        let dup = packet(ab, 1001, 5001, ACK | PSH, &[5; 100]);
        let out = mb.retransmit(vec![dup], now);
        assert!(out.forward.is_empty());
        assert_eq!(out.opposite.len(), 1);
        let reack = parsed(&out.opposite[0]);
        assert_eq!(reack.ack_no, 1101);
        assert_eq!(reack.flow, ab.reversed());
    }
}
