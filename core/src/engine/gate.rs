//! The ingress gate: binds connections, drives the TCP state machine,
//! reorders arrivals, and dispatches retransmissions to the guard.

use crate::conn::common::{CommonPool, TcpCommon};
use crate::conn::fcb::Fcb;
use crate::conn::pdu::{Segment, TcpContext};
use crate::conn::reorder::{classify_retransmission, OooInsert, RetransmitClass};
use crate::conn::retransmit::Replay;
use crate::conn::state::TcpState;
use crate::conn::{seq_gt, seq_lt};
use crate::engine::{egress, Delivery, EngineConfig};
use crate::flowtable::clock::Tick;
use crate::flowtable::FlowTable;
use crate::protocols::packet::tcp;
use crate::stats::Stats;

use std::sync::{Arc, Weak};

/// Split-borrowed engine state the gate works against while it holds the
/// packet's FCB.
pub(crate) struct GateCtx<'a> {
    pub(crate) cfg: &'a EngineConfig,
    pub(crate) commons: &'a mut FlowTable<Weak<TcpCommon>>,
    pub(crate) pool: &'a mut CommonPool,
    pub(crate) stats: &'a mut Stats,
    pub(crate) now: Tick,
}

/// Whether the packet's flow entry survives this packet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum FlowAction {
    Keep,
    Release,
}

/// Releases one side's hold on its connection.
pub(crate) fn release_fcb(fcb: &mut Fcb, pool: &mut CommonPool) {
    fcb.reset_side();
    if let Some(common) = fcb.common.take() {
        pool.release(common);
    }
}

fn establishing_state(dir: usize) -> TcpState {
    if dir == 0 {
        TcpState::Establishing1
    } else {
        TcpState::Establishing2
    }
}

/// Entry point for one ingress segment.
pub(crate) fn process(
    fcb: &mut Fcb,
    seg: Segment,
    ctx: &mut GateCtx,
    out: &mut Delivery,
) -> FlowAction {
    if !fcb.bound() {
        return bind_first(fcb, seg, ctx, out);
    }
    let common = fcb.common.as_ref().expect("bound").clone();

    if seg.ctxt.syn() {
        return syn_on_bound(fcb, &common, seg, ctx, out);
    }

    // Handshake completion: an ACK while establishing opens the connection.
    // The ordered path below records the ACK value itself.
    if seg.ctxt.ack() && common.state() < TcpState::Open {
        let mut guard = common.lock();
        if guard.state() < TcpState::Open {
            guard.set_state(TcpState::Open);
        }
    }

    if common.state() == TcpState::BeingClosedArtificially2 && seg.ctxt.fin() {
        absorb_final_fin(fcb, &common, seg, ctx, out);
        return FlowAction::Keep;
    }

    reorder_and_process(fcb, &common, seg, ctx, out);
    FlowAction::Keep
}

/// Binds the connection for the first segment seen on this direction.
fn bind_first(fcb: &mut Fcb, seg: Segment, ctx: &mut GateCtx, out: &mut Delivery) -> FlowAction {
    let ctxt = seg.ctxt;

    if ctxt.rst() {
        // A RST may close a pending reverse flow; either way the endpoints
        // must learn of it, so it bypasses the stack.
        let reverse = ctxt.flow.reversed();
        if let Some(common) = ctx
            .commons
            .get_mut(&reverse, ctx.now)
            .and_then(|weak| weak.upgrade())
        {
            common.lock().set_state(TcpState::Closed);
            ctx.commons.delete(&reverse, ctx.now);
        }
        out.forward.push(seg.mbuf);
        return FlowAction::Release;
    }

    if ctxt.synack() {
        let reverse = ctxt.flow.reversed();
        let common = ctx
            .commons
            .get_mut(&reverse, ctx.now)
            .and_then(|weak| weak.upgrade());
        let Some(common) = common else {
            log::debug!("SYN/ACK for {} without a pending SYN, dropping", ctxt.flow);
            ctx.stats.protocol_violations += 1;
            return FlowAction::Release;
        };
        ctx.commons.delete(&reverse, ctx.now);
        fcb.dir = 1;
        fcb.common = Some(common.clone());
        init_side(fcb, &ctxt);
        common.lock().set_state(TcpState::Establishing2);
        finish_first(fcb, &common, seg, ctx, out);
        return FlowAction::Keep;
    }

    if ctxt.syn() {
        let common = match ctx.pool.allocate() {
            Ok(common) => common,
            Err(e) => {
                log::error!("Failed to allocate a connection block: {}", e);
                ctx.stats.resource_exhausted += 1;
                return FlowAction::Release;
            }
        };
        ctx.stats.flows_created += 1;
        fcb.dir = 0;
        fcb.common = Some(common.clone());
        init_side(fcb, &ctxt);
        common.lock().set_state(establishing_state(fcb.dir));

        // Register the reverse-tuple mapping the SYN/ACK will adopt.
        let expiry = ctx.now.advanced(ctx.cfg.flow_timeout);
        if let Err(e) = ctx
            .commons
            .insert(ctxt.flow, Arc::downgrade(&common), expiry, ctx.now)
        {
            log::error!("Reverse-tuple index rejected {}: {}", ctxt.flow, e);
            ctx.stats.resource_exhausted += 1;
            release_fcb(fcb, ctx.pool);
            return FlowAction::Release;
        }
        finish_first(fcb, &common, seg, ctx, out);
        return FlowAction::Keep;
    }

    log::debug!(
        "First segment of {} is not SYN/SYN+ACK/RST (flags {:#04x}), dropping",
        ctxt.flow,
        ctxt.flags
    );
    ctx.stats.protocol_violations += 1;
    FlowAction::Release
}

/// Resets this side's sequence tracking to start at `ctxt`'s segment. The
/// segment itself is checked immediately afterwards, so it processes as
/// in-order.
fn init_side(fcb: &mut Fcb, ctxt: &TcpContext) {
    fcb.fin_seen = false;
    fcb.rst_emitted = false;
    fcb.expected_seq = ctxt.seq_no;
    fcb.last_sent = ctxt.seq_no;
}

/// Option management plus normal processing for a segment that just bound
/// or re-bound its side.
fn finish_first(
    fcb: &mut Fcb,
    common: &Arc<TcpCommon>,
    mut seg: Segment,
    ctx: &mut GateCtx,
    out: &mut Delivery,
) {
    manage_options(fcb, common, &mut seg, ctx);
    reorder_and_process(fcb, common, seg, ctx, out);
}

/// Records MSS and window scale from SYN options and strips SACK-permitted
/// when the pipeline may resize payloads (the middlebox cannot honor
/// selective acknowledgments over a rewritten stream).
fn manage_options(fcb: &mut Fcb, common: &Arc<TcpCommon>, seg: &mut Segment, ctx: &mut GateCtx) {
    if !seg.ctxt.syn() {
        return;
    }
    let header_len = seg.ctxt.offset - seg.ctxt.tcp_offset;
    let parsed = tcp::parse_options(&seg.mbuf, seg.ctxt.tcp_offset, header_len);
    let dir = fcb.dir;
    let opp = fcb.opposite();

    let mut guard = common.lock();
    if let Some(shift) = parsed.window_scale {
        let shift = shift.min(14);
        let scale = if shift >= 1 { 2u16 << (shift - 1) } else { 1 };
        guard.maintainers[dir].window_scale = scale;
        guard.maintainers[dir].use_window_scale = true;
        // A SYN/ACK tells us whether the other side accepted the option; if
        // it never offered it, scaling is off for the connection.
        if seg.ctxt.ack() && !guard.maintainers[opp].use_window_scale {
            guard.maintainers[dir].use_window_scale = false;
        }
    }
    if let Some(mss) = parsed.mss {
        guard.maintainers[dir].mss = mss;
        guard.maintainers[dir].cwnd = mss as u64;
    }
    drop(guard);

    if ctx.cfg.allow_resize {
        if let Some(opt_offset) = parsed.sack_permitted {
            if let Err(e) = tcp::strip_sack_permitted(&mut seg.mbuf, seg.ctxt.tcp_offset, opt_offset)
            {
                log::warn!("Failed to strip SACK-permitted: {}", e);
            }
        }
    }
}

/// A SYN arriving on a side that already carries connection state: socket
/// reuse, handshake retry, or a retransmission.
fn syn_on_bound(
    fcb: &mut Fcb,
    common: &Arc<TcpCommon>,
    seg: Segment,
    ctx: &mut GateCtx,
    out: &mut Delivery,
) -> FlowAction {
    let state = common.state();

    if state == TcpState::Closed {
        if seg.ctxt.ack() {
            log::debug!("SYN/ACK on a closed connection, awaiting the SYN first");
            ctx.stats.protocol_violations += 1;
            return FlowAction::Keep;
        }
        // Socket reuse. The peer may be releasing concurrently; look once
        // more before giving up on the in-place path.
        let mut reusable = Arc::strong_count(common) == 2;
        if !reusable {
            ctx.stats.state_races += 1;
            reusable = Arc::strong_count(common) == 2;
        }
        if reusable {
            // The other side still holds the block (TIME_WAIT): reuse it in
            // place.
            log::debug!("Reusing socket for {}", seg.ctxt.flow);
            ctx.stats.flows_reused += 1;
            fcb.reset_side();
            {
                let mut guard = common.lock();
                guard.reinit();
                guard.set_state(establishing_state(fcb.dir));
            }
            init_side(fcb, &seg.ctxt);
            finish_first(fcb, common, seg, ctx, out);
            return FlowAction::Keep;
        }
        // The other side released: drop our hold and bind from scratch.
        log::debug!("Renewing socket for {}", seg.ctxt.flow);
        release_fcb(fcb, ctx.pool);
        return bind_first(fcb, seg, ctx, out);
    }

    if state < TcpState::Open {
        if seg.ctxt.synack() {
            // SYN/ACK of a reused or retried handshake: reinitialize this
            // side against the existing block.
            fcb.reset_side();
            init_side(fcb, &seg.ctxt);
            {
                let mut guard = common.lock();
                guard.maintainers[fcb.dir].reinit();
                guard.set_state(TcpState::Establishing2);
            }
            finish_first(fcb, common, seg, ctx, out);
            return FlowAction::Keep;
        }
        // Some stacks retry a SYN with a perturbed sequence number: restart
        // this side's establishment.
        fcb.reset_side();
        init_side(fcb, &seg.ctxt);
        {
            let mut guard = common.lock();
            guard.maintainers[fcb.dir].reinit();
            guard.set_state(establishing_state(fcb.dir));
        }
        finish_first(fcb, common, seg, ctx, out);
        return FlowAction::Keep;
    }

    // Established connection: a retransmitted SYN goes to the guard. A
    // SYN/ACK with a fresh sequence number while both sides still hold the
    // block is the responder half of a reused 5-tuple whose new SYN we
    // missed; re-establish this side in place.
    match classify_retransmission(
        fcb.expected_seq,
        fcb.last_sent,
        seg.ctxt.seq_no,
        seg.ctxt.end_seq(),
    ) {
        Some(_) => guard_retransmit_segment(fcb, common, seg, ctx, out),
        None if seg.ctxt.synack() && Arc::strong_count(common) == 2 => {
            log::debug!("SYN/ACK of a reused 5-tuple on {}", seg.ctxt.flow);
            ctx.stats.flows_reused += 1;
            fcb.reset_side();
            init_side(fcb, &seg.ctxt);
            {
                let mut guard = common.lock();
                guard.maintainers[fcb.dir].reinit();
                guard.set_state(TcpState::Establishing2);
            }
            finish_first(fcb, common, seg, ctx, out);
        }
        None => {
            log::debug!(
                "Unexpected SYN on {} in state {}, dropping",
                seg.ctxt.flow,
                state
            );
            ctx.stats.protocol_violations += 1;
        }
    }
    FlowAction::Keep
}

/// The peer's FIN during an artificial close: acknowledge it on the other
/// endpoint's behalf, strip the FIN, and account for the sequence number the
/// crafted ACK consumed.
fn absorb_final_fin(
    fcb: &mut Fcb,
    common: &Arc<TcpCommon>,
    seg: Segment,
    ctx: &mut GateCtx,
    out: &mut Delivery,
) {
    let Segment { mut mbuf, ctxt } = seg;
    let opp = fcb.opposite();

    let ack_of = ctxt
        .seq_no
        .wrapping_add(ctxt.length as u32)
        .wrapping_add(1);
    {
        let mut guard = common.lock();
        if let Some(crafted) = egress::forge_ack(
            &mut guard.maintainers[opp],
            ctxt.flow.reversed(),
            ctxt.ack_no,
            ack_of,
            true,
        ) {
            ctx.stats.acks_crafted += 1;
            out.opposite.push(crafted);
        }
    }

    let (mapped_seq, mapped_ack) = if ctx.cfg.allow_resize {
        let guard = common.lock();
        (
            guard.maintainers[fcb.dir].map_seq(ctxt.seq_no),
            guard.maintainers[opp].map_ack(ctxt.ack_no),
        )
    } else {
        (ctxt.seq_no, ctxt.ack_no)
    };
    let _ = tcp::set_ack_no(&mut mbuf, ctxt.tcp_offset, mapped_ack);
    let _ = tcp::set_seq_no(&mut mbuf, ctxt.tcp_offset, mapped_seq.wrapping_add(1));
    let _ = tcp::set_flags(&mut mbuf, ctxt.tcp_offset, ctxt.flags & !tcp::FIN);
    out.forward.push(mbuf);

    common.lock().set_state(TcpState::Closed);
    fcb.expected_seq = ctxt.next_seq();
    fcb.last_sent = ctxt.seq_no;
}

/// Reordering front: in-order segments process immediately, future segments
/// park in the out-of-order list, old segments classify as retransmissions.
fn reorder_and_process(
    fcb: &mut Fcb,
    common: &Arc<TcpCommon>,
    seg: Segment,
    ctx: &mut GateCtx,
    out: &mut Delivery,
) {
    let ctxt = seg.ctxt;
    if ctx.cfg.reorder && ctxt.seq_no != fcb.expected_seq {
        // A RST is processed immediately regardless of the reorder window.
        if ctxt.rst() {
            process_ordered(fcb, common, seg, ctx, out);
            drain_in_order(fcb, common, ctx, out);
            return;
        }
        match classify_retransmission(fcb.expected_seq, fcb.last_sent, ctxt.seq_no, ctxt.end_seq())
        {
            Some(RetransmitClass::Split) => {
                // Part of the payload is new; forwarded whole, the receiver
                // discards the overlap.
                log::debug!(
                    "Split retransmission at {} (expected {})",
                    ctxt.seq_no,
                    fcb.expected_seq
                );
                out.forward.push(seg.mbuf);
                return;
            }
            Some(RetransmitClass::Replay) => {
                guard_retransmit_segment(fcb, common, seg, ctx, out);
                return;
            }
            Some(RetransmitClass::Drop) => {
                // The original is still held upstream; replaying arriving
                // bytes would permit a sequence-overwrite attack.
                log::debug!(
                    "Dropping old segment {} (expected {})",
                    ctxt.seq_no,
                    fcb.expected_seq
                );
                ctx.stats.duplicates_dropped += 1;
                return;
            }
            None => {}
        }

        // Future segment: a gap just opened.
        if ctx.cfg.proactive_dup_ack {
            proactive_dup_ack(fcb, common, &ctxt, ctx, out);
        }
        match fcb.ooo.insert(seg) {
            Ok(OooInsert::Held) => ctx.stats.held_out_of_order += 1,
            Ok(OooInsert::Duplicate) => ctx.stats.duplicates_dropped += 1,
            Err(e) => {
                log::warn!("{} on {}", e, ctxt.flow);
                ctx.stats.resource_exhausted += 1;
            }
        }
        return;
    }
    process_ordered(fcb, common, seg, ctx, out);
    drain_in_order(fcb, common, ctx, out);
}

/// Releases consecutive held segments once the hole is filled.
fn drain_in_order(fcb: &mut Fcb, common: &Arc<TcpCommon>, ctx: &mut GateCtx, out: &mut Delivery) {
    while let Some(seg) = fcb.ooo.pop_in_order(fcb.expected_seq) {
        process_ordered(fcb, common, seg, ctx, out);
    }
}

/// Duplicate ACK toward the sender to accelerate its fast retransmit.
fn proactive_dup_ack(
    fcb: &mut Fcb,
    common: &Arc<TcpCommon>,
    ctxt: &TcpContext,
    ctx: &mut GateCtx,
    out: &mut Delivery,
) {
    let ack = fcb.expected_seq;
    let opp = fcb.opposite();
    log::debug!("Sending proactive duplicate ACK for {}", ack);
    let mut guard = common.lock();
    let crafted = egress::forge_ack(
        &mut guard.maintainers[opp],
        ctxt.flow.reversed(),
        ctxt.ack_no,
        ack,
        true,
    );
    drop(guard);
    if let Some(packet) = crafted {
        ctx.stats.acks_crafted += 1;
        out.opposite.push(packet);
    }
}

/// Close-state bookkeeping for an in-order segment. Returns `true` when the
/// segment must be dropped (connection already closed).
fn detect_close(
    fcb: &mut Fcb,
    common: &Arc<TcpCommon>,
    seg: &mut Segment,
    ctx: &mut GateCtx,
    out: &mut Delivery,
) -> bool {
    let ctxt = seg.ctxt;
    let state = common.state();
    // Fast path; stale reads are fine, the slow path re-reads under lock.
    if state == TcpState::Open && !ctxt.fin() && !ctxt.rst() {
        return false;
    }
    if state < TcpState::Open && !ctxt.rst() {
        return false;
    }

    let mut guard = common.lock();
    if ctxt.rst() {
        guard.set_state(TcpState::Closed);
        drop(guard);
        fcb.ooo.clear();
        fcb.retransmit.kill();
        return false; // the RST itself travels
    }
    match guard.state() {
        TcpState::Open => {
            if ctxt.fin() {
                fcb.fin_seen = true;
                guard.set_state(TcpState::BeingClosedGraceful1);
            }
            false
        }
        s if s < TcpState::Open => false,
        TcpState::BeingClosedGraceful1 => {
            if ctxt.fin() && !fcb.fin_seen {
                fcb.fin_seen = true;
                guard.set_state(TcpState::BeingClosedGraceful2);
            }
            false
        }
        TcpState::BeingClosedGraceful2 => {
            guard.set_state(TcpState::Closed);
            false // the final ACK still travels
        }
        TcpState::BeingClosedArtificially1 => {
            if ctxt.fin() {
                // The peer answered the FIN we injected; its ACK covers a
                // sequence number the original sender never consumed.
                guard.set_state(TcpState::BeingClosedArtificially2);
                drop(guard);
                let adjusted = ctxt.ack_no.wrapping_sub(1);
                let _ = tcp::set_ack_no(&mut seg.mbuf, ctxt.tcp_offset, adjusted);
                seg.ctxt.ack_no = adjusted;
            }
            false
        }
        TcpState::BeingClosedArtificially2 => false,
        _ => {
            // Closed.
            if ctxt.bare_ack() {
                // Probable retransmission of the final ACK.
                return false;
            }
            drop(guard);
            if !fcb.rst_emitted {
                fcb.rst_emitted = true;
                let rst = egress::forge_packet(
                    ctxt.flow.reversed(),
                    ctxt.ack_no,
                    ctxt.next_seq(),
                    0,
                    tcp::RST | tcp::ACK,
                    &[],
                );
                out.opposite.push(rst);
            }
            true
        }
    }
}

/// Processes a segment that continues the in-order stream.
fn process_ordered(
    fcb: &mut Fcb,
    common: &Arc<TcpCommon>,
    mut seg: Segment,
    ctx: &mut GateCtx,
    out: &mut Delivery,
) {
    if detect_close(fcb, common, &mut seg, ctx, out) {
        log::debug!("Connection {} is already closed", seg.ctxt.flow);
        ctx.stats.closed_in_flight += 1;
        return;
    }
    let Segment { mut mbuf, ctxt } = seg;
    fcb.last_sent = ctxt.seq_no;
    fcb.expected_seq = ctxt.next_seq();

    let dir = fcb.dir;
    let opp = fcb.opposite();

    if !ctx.cfg.allow_resize {
        if ctxt.ack() {
            common.lock().last_ack_received[dir] = Some(ctxt.ack_no);
        }
        mbuf.ann_mut().content_offset = ctxt.offset as u16;
        out.forward.push(mbuf);
        return;
    }

    // Preserve the wire values downstream elements need before any rewrite.
    mbuf.ann_mut().initial_ack = ctxt.ack_no;
    mbuf.ann_mut().content_offset = ctxt.offset as u16;
    // FIN/RST mark the last segment worth inspecting downstream.
    mbuf.ann_mut().last_useful = ctxt.fin() || ctxt.rst();

    let mut guard = common.lock();
    let prev_window = guard.maintainers[dir].window_size;
    guard.maintainers[dir].window_size = ctxt.window;

    // Payload below what we already acknowledged for the peer means our ACK
    // was lost between the middlebox and the destination: re-ack, drop.
    if let Some(last_ack_sent) = guard.maintainers[opp].last_ack_sent {
        if !ctxt.syn() && seq_lt(ctxt.seq_no, last_ack_sent) {
            log::debug!(
                "Lost ACK on {}, re-acking (seq {}, acked {})",
                ctxt.flow,
                ctxt.seq_no,
                last_ack_sent
            );
            let mut ack_of = ctxt.seq_no.wrapping_add(ctxt.length as u32);
            if ctxt.syn() || ctxt.fin() {
                ack_of = ack_of.wrapping_add(1);
            }
            let crafted = egress::forge_ack(
                &mut guard.maintainers[opp],
                ctxt.flow.reversed(),
                ctxt.ack_no,
                ack_of,
                true,
            );
            drop(guard);
            if let Some(packet) = crafted {
                ctx.stats.acks_crafted += 1;
                out.opposite.push(packet);
            }
            ctx.stats.duplicates_dropped += 1;
            return;
        }
    }

    if ctxt.ack() {
        let ack = ctxt.ack_no;
        // Receiver-side ACK values were generated against the rewritten
        // stream; translate them for the original sender.
        let new_ack = guard.maintainers[opp].map_ack(ack);
        if new_ack != ack {
            log::debug!("Map ACK {} -> {}", ack, new_ack);
        }
        let prev_last = guard.last_ack_received[dir];

        // Fresh data acknowledged: grow the opposite congestion window.
        if let Some(prev) = prev_last {
            if seq_gt(ack, prev) {
                let maintainer = &mut guard.maintainers[opp];
                let mss = maintainer.mss as u64;
                let increase = if maintainer.cwnd <= maintainer.ssthresh {
                    mss
                } else {
                    mss * mss / maintainer.cwnd.max(1)
                };
                maintainer.cwnd += increase;
                guard.maintainers[dir].dup_acks = 0;
            }
        }
        guard.last_ack_received[dir] = Some(ack);
        guard.maintainers[opp].prune(ack);

        if ctxt.bare_ack() && prev_window == ctxt.window {
            let mut is_duplicate = false;
            if prev_last == Some(ack) {
                is_duplicate = true;
                let dup_acks = guard.maintainers[dir].dup_acks + 1;
                // Third duplicate triggers the sender's fast retransmit; the
                // counter restarts.
                guard.maintainers[dir].dup_acks = if dup_acks >= 3 {
                    log::debug!("Fast retransmit threshold on {}", ctxt.flow);
                    0
                } else {
                    dup_acks
                };
            }
            if !is_duplicate {
                if let Some(last_sent_ack) = guard.maintainers[dir].last_ack_sent {
                    if crate::conn::seq_leq(new_ack, last_sent_ack) {
                        log::debug!("Meaningless ACK on {}, dropping", ctxt.flow);
                        ctx.stats.duplicates_dropped += 1;
                        return;
                    }
                }
            }
        }
        if new_ack != ack {
            let _ = tcp::set_ack_no(&mut mbuf, ctxt.tcp_offset, new_ack);
        }
    }
    drop(guard);
    out.forward.push(mbuf);
}

/// Guard port 1: answers a retransmission with an authenticated replay, a
/// crafted ACK, or silence.
pub(crate) fn guard_retransmit_segment(
    fcb: &mut Fcb,
    common: &Arc<TcpCommon>,
    seg: Segment,
    ctx: &mut GateCtx,
    out: &mut Delivery,
) {
    let ctxt = seg.ctxt;

    // SYN and RST retransmissions on an unestablished connection pass
    // through untouched.
    if (common.state() < TcpState::Open && ctxt.syn()) || ctxt.rst() {
        log::debug!("Unestablished connection, letting the retransmission through");
        out.forward.push(seg.mbuf);
        return;
    }

    let mut guard = common.lock();
    let dir = fcb.dir;
    let opp = fcb.opposite();
    let mapped = if ctx.cfg.allow_resize {
        guard.maintainers[dir].map_seq(ctxt.seq_no)
    } else {
        ctxt.seq_no
    };

    let mut ack_of = ctxt.seq_no.wrapping_add(ctxt.length as u32);
    if ctxt.syn() || ctxt.fin() {
        ack_of = ack_of.wrapping_add(1);
    }

    if ctx.cfg.reack_on_retransmit {
        if let Some(last_ack) = guard.last_ack_received[opp] {
            if seq_lt(mapped, last_ack) {
                // The data arrived; only our ACK was lost. Tell the sender.
                log::debug!(
                    "Sender missed the ACK for {} (last ack {}), re-acking",
                    mapped,
                    last_ack
                );
                let crafted = egress::forge_ack(
                    &mut guard.maintainers[opp],
                    ctxt.flow.reversed(),
                    ctxt.ack_no,
                    ack_of,
                    true,
                );
                drop(guard);
                if let Some(packet) = crafted {
                    ctx.stats.acks_crafted += 1;
                    out.opposite.push(packet);
                }
                return;
            }
        }
    }

    if ctxt.length == 0 {
        // A retransmitted bare ACK carries nothing to authenticate.
        drop(guard);
        out.forward.push(seg.mbuf);
        return;
    }
    drop(guard);

    // Replay the buffered clone, never the bytes that just arrived.
    match fcb.retransmit.replay(mapped) {
        Replay::Segment(clone) => {
            log::debug!("Replaying buffered segment {}", mapped);
            ctx.stats.replays += 1;
            out.forward.push(clone);
        }
        Replay::Suppressed => {
            ctx.stats.replays_suppressed += 1;
        }
        Replay::Missing => {
            // Either pruned after the opposite side acknowledged it, or a
            // retransmission for bytes we never carried.
            ctx.stats.buffer_misses += 1;
            log::warn!(
                "Retransmit for a segment not in the buffer (seq {}, mapped {})",
                ctxt.seq_no,
                mapped
            );
            let mut guard = common.lock();
            let crafted = egress::forge_ack(
                &mut guard.maintainers[opp],
                ctxt.flow.reversed(),
                ctxt.ack_no,
                ack_of,
                true,
            );
            drop(guard);
            if let Some(packet) = crafted {
                ctx.stats.acks_crafted += 1;
                out.opposite.push(packet);
            }
        }
    }
}
