//! Core of a transparent, flow-aware TCP middlebox.
//!
//! The crate reconstructs per-connection TCP state for traffic crossing a
//! middlebox, reorders out-of-order arrivals, keeps sequence/acknowledgment
//! arithmetic consistent when downstream elements rewrite payload bytes, and
//! answers retransmissions from an independent buffer of transmitted
//! segments so that sequence-number replay cannot overwrite content the
//! endpoints already exchanged.
//!
//! Four subsystems make up the core:
//!
//! - a concurrent, expiry-aware cuckoo flow table keyed by the 4-tuple
//!   ([flowtable]);
//! - the TCP connection state machine driving both half-directions of each
//!   connection through handshake, close, and socket reuse ([conn],
//!   [engine]);
//! - the per-direction reorderer and retransmission guard
//!   ([conn::reorder](conn), [conn::retransmit](conn));
//! - the byte-stream maintainer and modification lists that keep endpoints
//!   consistent across payload resizes ([stream]).
//!
//! The embedding packet-processing host owns I/O, dispatch, and content
//! filters; its boundary to this crate is [`engine::TcpMiddlebox`]: batches
//! in, a [`engine::Delivery`] of forwarded and injected segments out, plus
//! the downstream modification protocol (`remove_bytes`, `insert_bytes`,
//! `request_more_packets`, `close_connection`) and a 16-bit tick clock for
//! expiry.
//!
//! ```rust
//! use midstream_core::config::default_config;
//! use midstream_core::engine::TcpMiddlebox;
//! use midstream_core::flowtable::clock::Tick;
//!
//! let mut middlebox = TcpMiddlebox::new(&default_config());
//! let now = Tick(0);
//! // Per batch: ingress, then (after downstream elements ran) egress.
//! let delivery = middlebox.push(vec![], now);
//! assert!(delivery.is_empty());
//! middlebox.check_expired(now);
//! ```

pub mod config;
pub mod conn;
pub mod engine;
pub mod errors;
pub mod flowtable;
pub mod memory;
pub mod protocols;
pub mod stats;
pub mod stream;
pub mod utils;

pub use crate::engine::{Delivery, TcpMiddlebox};
pub use crate::errors::Error;
pub use crate::flowtable::clock::Tick;
pub use crate::flowtable::flow_id::FlowId;
pub use crate::memory::mbuf::Mbuf;
