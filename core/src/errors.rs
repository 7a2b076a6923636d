//! Core error taxonomy.
//!
//! Per-packet failures are recovered locally (drop + counter); flow-wide
//! failures close the flow and release its state. Nothing at this layer is
//! fatal to the process.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// First segment is not SYN/SYN+ACK/RST, unexpected SYN on an open
    /// connection, and similar. Dropped and logged at debug.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Pool empty, flow table full, or displacement depth exceeded. The
    /// affected flow initiation fails.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Socket reuse raced with the peer releasing its side.
    #[error("state race during flow reuse")]
    StateRace,

    /// A retransmission arrived for a segment that is neither buffered nor
    /// already acknowledged.
    #[error("retransmit for a segment not in buffer")]
    BufferMiss,

    /// Dropped silently; the IP/TCP layer should have caught it earlier.
    #[error("checksum verification failed")]
    ChecksumFailed,

    /// Segment arrived on a closed connection.
    #[error("packet arrived after close")]
    CloseDuringInflight,
}
