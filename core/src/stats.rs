//! Per-engine counters.
//!
//! Every recovered error of the per-packet path lands in a counter; nothing
//! at this layer is fatal. One instance lives in each worker's engine.

use std::fmt;

#[derive(Debug, Default)]
pub struct Stats {
    /// Segments handed to the ingress gate.
    pub packets: u64,
    /// Segments released downstream.
    pub forwarded: u64,
    /// Middlebox-originated segments (ACKs, closers, replays).
    pub crafted: u64,

    /// Unparseable packets.
    pub malformed: u64,
    /// Dropped on checksum verification.
    pub checksum_failed: u64,
    /// First segment was not SYN/SYN+ACK/RST, unexpected SYN, and similar.
    pub protocol_violations: u64,
    /// Pool or table exhaustion at flow creation.
    pub resource_exhausted: u64,
    /// Socket reuse raced with the peer releasing.
    pub state_races: u64,
    /// Retransmission for a segment neither buffered nor acknowledged.
    pub buffer_misses: u64,
    /// Segments arriving on a closed connection.
    pub closed_in_flight: u64,

    /// Segments parked in an out-of-order buffer.
    pub held_out_of_order: u64,
    /// Old or duplicate segments dropped.
    pub duplicates_dropped: u64,
    /// Authenticated replays emitted by the guard.
    pub replays: u64,
    /// Consecutive duplicate replays suppressed.
    pub replays_suppressed: u64,
    /// ACKs crafted on the middlebox's own behalf.
    pub acks_crafted: u64,

    /// Shared blocks allocated.
    pub flows_created: u64,
    /// Sockets reused in place out of TIME_WAIT.
    pub flows_reused: u64,
    /// Flows reclaimed by the expiry scan.
    pub flows_expired: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "packets: {} forwarded: {} crafted: {}",
            self.packets, self.forwarded, self.crafted
        )?;
        writeln!(
            f,
            "drops: malformed {} cksum {} proto {} exhausted {} closed {} dup {}",
            self.malformed,
            self.checksum_failed,
            self.protocol_violations,
            self.resource_exhausted,
            self.closed_in_flight,
            self.duplicates_dropped
        )?;
        writeln!(
            f,
            "guard: replays {} suppressed {} misses {} acks {}",
            self.replays, self.replays_suppressed, self.buffer_misses, self.acks_crafted
        )?;
        write!(
            f,
            "flows: created {} reused {} expired {} races {} held-ooo {}",
            self.flows_created,
            self.flows_reused,
            self.flows_expired,
            self.state_races,
            self.held_out_of_order
        )
    }
}
