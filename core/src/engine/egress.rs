//! The egress gate: sequence/ack rewriting, modification-list commit, and
//! crafting of middlebox-originated segments.

use crate::conn::fcb::Fcb;
use crate::conn::pdu::TcpContext;
use crate::conn::{seq_leq, seq_lt};
use crate::engine::{Delivery, EngineConfig};
use crate::flowtable::flow_id::FlowId;
use crate::memory::mbuf::Mbuf;
use crate::protocols::packet::{checksum, ipv4, tcp};
use crate::stats::Stats;
use crate::stream::maintainer::ByteStreamMaintainer;

/// Floor for the transmit-buffer bound while the peer's window is still
/// unknown (one unscaled maximum window).
const MIN_TRANSMIT_BUFFER: u64 = 65_535;

/// Rewrites one packet on its way downstream and runs the retransmission
/// guard's buffering input (port 0).
pub(crate) fn process(
    fcb: &mut Fcb,
    mut mbuf: Mbuf,
    ctxt: TcpContext,
    cfg: &EngineConfig,
    stats: &mut Stats,
    out: &mut Delivery,
) {
    let Some(common) = fcb.common.clone() else {
        log::error!("Connection released before all packets drained, dropping egress packet");
        return;
    };
    let dir = fcb.dir;
    let opp = fcb.opposite();
    let flow = ctxt.flow;

    let (wire_seq, last_ack_opp, window_cap);
    if cfg.allow_resize {
        let mut guard = common.lock();

        // Map the sequence number through the edits committed by previous
        // packets of this direction.
        let prev_seq = ctxt.seq_no;
        let new_seq = guard.maintainers[dir].map_seq(prev_seq);
        if new_seq != prev_seq {
            log::debug!("Map SEQ {} -> {}", prev_seq, new_seq);
            let _ = tcp::set_seq_no(&mut mbuf, ctxt.tcp_offset, new_seq);
        }
        guard.maintainers[dir].last_seq_sent = Some(new_seq);
        guard.maintainers[dir].window_size = ctxt.window;

        let prev_ack = ctxt.ack_no;
        let prev_last_ack = guard.maintainers[dir].last_ack_sent;
        if ctxt.ack() {
            // Never emit an ACK below one the middlebox already sent on this
            // direction's behalf.
            let clamped = guard.maintainers[dir].record_ack_sent(prev_ack);
            if clamped != prev_ack {
                let _ = tcp::set_ack_no(&mut mbuf, ctxt.tcp_offset, clamped);
            }
        }

        // Reflect any payload resize in the IP header. The parsed context
        // still carries the pre-resize total length.
        let initial_total = ctxt.length + ctxt.offset - ctxt.ip_offset;
        let current_total = mbuf.data_len() - ctxt.ip_offset;
        let delta = current_total as i64 - initial_total as i64;
        if delta != 0 {
            let _ = ipv4::set_total_length(&mut mbuf, ctxt.ip_offset, current_total as u16);
        }
        guard.maintainers[dir].last_payload_length = (ctxt.length as i64 + delta) as u32;

        // Commit this packet's planned edits; they apply to every later
        // sequence number of the direction.
        if let Some(list) = fcb.take_modification_list(prev_seq) {
            if let Err(e) = list.commit(&mut guard.maintainers[dir]) {
                log::warn!(
                    "Dropping inconsistent modification list for seq {}: {}",
                    prev_seq,
                    e
                );
            }
            let payload_now = mbuf.data_len().saturating_sub(ctxt.offset);
            if payload_now == 0 {
                // The packet was scrubbed empty. Acknowledge the original
                // bytes ourselves; the sender must not retransmit them.
                let mut ack_of = prev_seq.wrapping_add(ctxt.length as u32);
                if ctxt.syn() || ctxt.fin() {
                    ack_of = ack_of.wrapping_add(1);
                }
                let seq = mbuf.ann().initial_ack;
                if let Some(crafted) =
                    forge_ack(&mut guard.maintainers[opp], flow.reversed(), seq, ack_of, false)
                {
                    stats.acks_crafted += 1;
                    out.opposite.push(crafted);
                }
                // An empty segment whose ACK brings nothing new is dead
                // weight; anything else (flags, fresh ACK) still travels.
                let ack_only = ctxt.ack() && ctxt.flags & (tcp::SYN | tcp::FIN | tcp::RST) == 0;
                if ack_only {
                    if let Some(last) = prev_last_ack {
                        if seq_leq(prev_ack, last) {
                            log::debug!("Killing useless ACK after scrub");
                            stats.duplicates_dropped += 1;
                            return;
                        }
                    }
                }
            }
        }
        wire_seq = new_seq;
        last_ack_opp = guard.last_ack_received[opp];
        window_cap = guard.maintainers[opp].scaled_window();
    } else {
        let mut guard = common.lock();
        guard.maintainers[dir].last_seq_sent = Some(ctxt.seq_no);
        guard.maintainers[dir].last_payload_length = ctxt.length as u32;
        guard.maintainers[dir].window_size = ctxt.window;
        if ctxt.ack() {
            guard.maintainers[dir].record_ack_sent(ctxt.ack_no);
        }
        wire_seq = ctxt.seq_no;
        last_ack_opp = guard.last_ack_received[opp];
        window_cap = guard.maintainers[opp].scaled_window();
    }

    if cfg.software_checksum {
        let _ = ipv4::compute_header_checksum(
            &mut mbuf,
            ctxt.ip_offset,
            ctxt.tcp_offset - ctxt.ip_offset,
        );
        let _ = tcp::compute_checksum(
            &mut mbuf,
            ctxt.tcp_offset,
            u32::from(flow.src_ip),
            u32::from(flow.dst_ip),
        );
    }

    // Retransmission guard, port 0: prune what the opposite side has
    // acknowledged, then buffer this segment's payload for authenticated
    // replay. ACK-only segments are not buffered.
    if let Some(ack) = last_ack_opp {
        fcb.retransmit.prune(ack);
    }
    let payload_len = mbuf.data_len().saturating_sub(ctxt.offset);
    if payload_len > 0 {
        // Bounded by what the receiver lets the sender keep in flight.
        let cap = window_cap.max(MIN_TRANSMIT_BUFFER);
        if fcb.retransmit.bytes() + payload_len as u64 <= cap {
            fcb.retransmit.buffer(wire_seq, payload_len as u32, &mbuf);
        } else {
            log::debug!("Transmit buffer window full on {}, not buffering", flow);
        }
    }
    out.forward.push(mbuf);
}

/// Crafts an ACK on the middlebox's behalf, unless it brings no new
/// knowledge and `force` is unset. The sequence number is clamped so the
/// crafted packet never rolls back what this direction already sent.
pub(crate) fn forge_ack(
    maintainer: &mut ByteStreamMaintainer,
    to: FlowId,
    seq: u32,
    ack: u32,
    force: bool,
) -> Option<Mbuf> {
    if !force {
        if let Some(last) = maintainer.last_ack_sent {
            if seq_leq(ack, last) {
                log::debug!("Ack {} not sent, no new knowledge", ack);
                return None;
            }
        }
    }
    maintainer.record_ack_sent(ack);

    let mut seq = seq;
    if let Some(last_seq) = maintainer.last_seq_sent {
        if seq_lt(seq, last_seq) {
            seq = last_seq;
        }
    }
    Some(forge_packet(to, seq, ack, maintainer.window_size, tcp::ACK, &[]))
}

/// Crafts the FIN (graceful) or RST (forceful) that tears a connection down
/// on the middlebox's initiative, continuing the direction `maintainer`
/// tracks.
pub(crate) fn send_closing_packet(
    maintainer: &mut ByteStreamMaintainer,
    to: FlowId,
    graceful: bool,
) -> Option<Mbuf> {
    let (Some(last_seq), Some(last_ack)) = (maintainer.last_seq_sent, maintainer.last_ack_sent)
    else {
        log::warn!("Cannot close a connection that never had a packet out");
        return None;
    };
    let seq = last_seq.wrapping_add(maintainer.last_payload_length);
    let mut flags = tcp::ACK;
    if graceful {
        flags |= tcp::FIN;
        // Our FIN consumes one sequence number.
        maintainer.last_seq_sent = Some(seq.wrapping_add(1));
        maintainer.last_payload_length = 0;
    } else {
        flags |= tcp::RST;
    }
    Some(forge_packet(to, seq, last_ack, maintainer.window_size, flags, &[]))
}

/// Builds a stock IPv4/TCP segment from scratch, checksums included. The
/// middlebox never injects options into crafted packets.
pub(crate) fn forge_packet(
    flow: FlowId,
    seq: u32,
    ack: u32,
    window: u16,
    flags: u8,
    payload: &[u8],
) -> Mbuf {
    const IP_HDR: usize = 20;
    const TCP_HDR: usize = 20;
    let total = IP_HDR + TCP_HDR + payload.len();
    let mut data = vec![0u8; total];

    data[0] = 0x45;
    data[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    data[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
    data[8] = 64;
    data[9] = tcp::TCP_PROTOCOL as u8;
    data[12..16].copy_from_slice(&flow.src_ip.octets());
    data[16..20].copy_from_slice(&flow.dst_ip.octets());
    let ip_cksum = checksum::ipv4_header_checksum(&data[..IP_HDR]);
    data[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    let t = IP_HDR;
    data[t..t + 2].copy_from_slice(&flow.src_port.to_be_bytes());
    data[t + 2..t + 4].copy_from_slice(&flow.dst_port.to_be_bytes());
    data[t + 4..t + 8].copy_from_slice(&seq.to_be_bytes());
    data[t + 8..t + 12].copy_from_slice(&ack.to_be_bytes());
    data[t + 12] = (TCP_HDR as u8 / 4) << 4;
    data[t + 13] = flags;
    data[t + 14..t + 16].copy_from_slice(&window.to_be_bytes());
    data[IP_HDR + TCP_HDR..].copy_from_slice(payload);
    let tcp_cksum = checksum::tcp_checksum(
        u32::from(flow.src_ip),
        u32::from(flow.dst_ip),
        &data[IP_HDR..],
    );
    data[t + 16..t + 18].copy_from_slice(&tcp_cksum.to_be_bytes());

    Mbuf::from_bytes(&data)
}
