//! Byte-stream offset tracking for payload-resizing pipelines.
//!
//! When a downstream element inserts or removes payload bytes, the sequence
//! numbers the two endpoints believe in diverge. Each direction of a
//! connection carries a [`ByteStreamMaintainer`](maintainer::ByteStreamMaintainer)
//! that owns the committed sequence-delta log, and every rewritten packet
//! carries a [`ModificationList`](modification::ModificationList) of planned
//! edits until they are committed on egress.

pub mod maintainer;
pub mod modification;
