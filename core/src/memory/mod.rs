//! Packet buffers and fixed-capacity object pools.

pub mod mbuf;
pub mod mempool;
