//! Per-packet modification lists.
//!
//! Downstream elements announce payload edits before performing them; the
//! edits accumulate here, keyed by the packet's original sequence number,
//! and are committed into the direction's maintainer once, on egress.

use crate::conn::seq_lt;
use crate::errors::Error;
use crate::stream::maintainer::ByteStreamMaintainer;

/// Planned edits for one packet, in ascending flow position.
#[derive(Debug)]
pub struct ModificationList {
    /// Original sequence number of the packet the edits belong to.
    seq: u32,
    /// `(flow_position, delta)` pairs, strictly ascending by position.
    edits: Vec<(u32, i64)>,
}

impl ModificationList {
    pub fn new(seq: u32) -> Self {
        ModificationList {
            seq,
            edits: Vec::new(),
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Records an edit of `delta` bytes at absolute flow position
    /// `position`. Edits at the position of the previous record combine
    /// algebraically; a zero-sum combination disappears. Positions must not
    /// go backwards.
    pub fn add_modification(&mut self, position: u32, delta: i64) -> Result<(), Error> {
        match self.edits.last_mut() {
            Some((last, existing)) if *last == position => {
                *existing += delta;
                if *existing == 0 {
                    self.edits.pop();
                }
                Ok(())
            }
            Some((last, _)) if seq_lt(position, *last) => {
                log::debug!(
                    "Rejecting modification at {} behind {} (packet seq {})",
                    position,
                    last,
                    self.seq
                );
                Err(Error::ProtocolViolation("modification out of ascending order"))
            }
            _ => {
                if delta != 0 {
                    self.edits.push((position, delta));
                }
                Ok(())
            }
        }
    }

    /// Commits the list into `maintainer`. The list is consumed; keys reach
    /// the maintainer in strictly increasing order or not at all.
    pub fn commit(self, maintainer: &mut ByteStreamMaintainer) -> Result<(), Error> {
        for (position, delta) in self.edits {
            maintainer.add_edit(position, delta)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_modification_combine_same_position() {
        let mut list = ModificationList::new(1000);
        list.add_modification(1050, 10).unwrap();
        list.add_modification(1050, -4).unwrap();

        let mut maintainer = ByteStreamMaintainer::new();
        list.commit(&mut maintainer).unwrap();
        assert_eq!(maintainer.map_seq(1050), 1056);
        assert_eq!(maintainer.edit_count(), 1);
    }

    #[test]
    fn core_modification_zero_sum_dropped() {
        let mut list = ModificationList::new(1000);
        list.add_modification(1050, 10).unwrap();
        list.add_modification(1050, -10).unwrap();
        assert!(list.is_empty());

        let mut maintainer = ByteStreamMaintainer::new();
        list.commit(&mut maintainer).unwrap();
        assert_eq!(maintainer.edit_count(), 0);
    }

    #[test]
    fn core_modification_rejects_backwards() {
        let mut list = ModificationList::new(1000);
        list.add_modification(1050, -5).unwrap();
        assert!(list.add_modification(1020, -5).is_err());
        // Forward positions still accepted.
        list.add_modification(1080, 3).unwrap();
    }

    #[test]
    fn core_modification_commit_order() {
        let mut list = ModificationList::new(2000);
        list.add_modification(2010, -3).unwrap();
        list.add_modification(2050, 7).unwrap();

        let mut maintainer = ByteStreamMaintainer::new();
        list.commit(&mut maintainer).unwrap();
        assert_eq!(maintainer.map_seq(2010), 2007);
        assert_eq!(maintainer.map_seq(2050), 2014);
    }
}
