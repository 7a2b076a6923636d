//! Expiry-aware cuckoo hash table owning per-flow state.
//!
//! Keys are oriented 4-tuples; each key hashes to a primary and a secondary
//! bucket of eight slots. A slot carries a 16-bit high signature for cheap
//! compare, the full 32-bit secondary signature (the reverse hash used for
//! displacement), and a 16-bit expiration tick compared wrap-safe against a
//! fixed lifetime window. Expired slots are free slots.
//!
//! Each bucket keeps a 64-bit Bloom filter over the secondary signatures of
//! entries displaced out of it, so a lookup only probes the secondary bucket
//! when the key might actually live there. The filter resets when the last
//! displaced entry leaves.
//!
//! The table is single-writer: one table per worker, with per-flow affinity
//! guaranteed by the host dispatch. Cross-worker state lives in the shared
//! per-connection block, not here.

pub mod clock;
pub mod flow_id;

use self::clock::Tick;
use self::flow_id::FlowId;
use crate::errors::Error;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Slots per bucket.
const ENTRIES_PER_BUCKET: usize = 8;

/// Upper bound on displacement steps before an insert gives up.
const MAX_PUSHES: usize = 512;

/// Default number of buckets visited per amortised scan call.
pub const DEFAULT_SCAN_BUDGET: usize = 2048;

/// Result of a keyed probe.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Lookup {
    /// Key present and not expired.
    Hit,
    /// Key present but its lifetime elapsed; the slot is reusable.
    Expired,
    /// Key absent.
    Miss,
}

struct Slot<V> {
    /// High 16 bits of the hash that placed this entry in this bucket.
    sig_hi: u16,
    /// Primary-bucket signature, kept to maintain the home bucket's
    /// displaced-entry accounting.
    prim_sig: u32,
    /// Secondary-bucket signature; the alternate location under displacement.
    sec_sig: u32,
    /// Expiration tick.
    expiry: Tick,
    /// Entry lives in its secondary bucket.
    in_secondary: bool,
    entry: Option<(FlowId, V)>,
}

impl<V> Slot<V> {
    fn vacant() -> Self {
        Slot {
            sig_hi: 0,
            prim_sig: 0,
            sec_sig: 0,
            expiry: Tick(0),
            in_secondary: false,
            entry: None,
        }
    }
}

struct Bucket<V> {
    slots: [Slot<V>; ENTRIES_PER_BUCKET],
    /// Bloom filter of secondary signatures displaced out of this bucket.
    bloom: u64,
    /// Number of entries whose primary bucket is this one but which live in
    /// their secondary bucket.
    moved: u32,
}

impl<V> Bucket<V> {
    fn new() -> Self {
        Bucket {
            slots: array_init::array_init(|_| Slot::vacant()),
            bloom: 0,
            moved: 0,
        }
    }
}

/// Cursor for amortised table scans. Wraps around the bucket array.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanCursor {
    next: usize,
}

/// The flow table.
pub struct FlowTable<V> {
    buckets: Vec<Bucket<V>>,
    mask: u32,
    occupied: usize,
}

impl<V> FlowTable<V> {
    /// Creates a table sized for roughly `capacity` entries, rounded up to a
    /// power-of-two bucket count.
    pub fn with_capacity(capacity: usize) -> Self {
        let nb_buckets = (capacity / ENTRIES_PER_BUCKET).next_power_of_two().max(2);
        let mut buckets = Vec::with_capacity(nb_buckets);
        buckets.resize_with(nb_buckets, Bucket::new);
        FlowTable {
            buckets,
            mask: (nb_buckets - 1) as u32,
            occupied: 0,
        }
    }

    /// Number of occupied slots, counting not-yet-reclaimed expired entries.
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    fn signatures(key: &FlowId) -> (u32, u32) {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish();
        (hash as u32, (hash >> 32) as u32)
    }

    /// Four 6-bit hashes derived directly from the 32-bit secondary signature.
    fn bloom_bits(sec_sig: u32) -> u64 {
        let mut bits = 0u64;
        for i in 0..4 {
            bits |= 1u64 << ((sec_sig >> (6 * i)) & 0x3f);
        }
        bits
    }

    fn bloom_may_contain(&self, prim_bucket: usize, sec_sig: u32) -> bool {
        let bucket = &self.buckets[prim_bucket];
        let bits = Self::bloom_bits(sec_sig);
        bucket.moved > 0 && bucket.bloom & bits == bits
    }

    fn scan_bucket(&self, bucket: usize, sig_hi: u16, key: &FlowId) -> Option<usize> {
        self.buckets[bucket].slots.iter().position(|slot| {
            slot.sig_hi == sig_hi
                && matches!(&slot.entry, Some((slot_key, _)) if slot_key == key)
        })
    }

    /// Locates `key` regardless of expiration state.
    fn find(&self, key: &FlowId) -> Option<(usize, usize)> {
        let (prim, sec) = Self::signatures(key);
        let prim_bucket = (prim & self.mask) as usize;
        if let Some(slot) = self.scan_bucket(prim_bucket, (prim >> 16) as u16, key) {
            return Some((prim_bucket, slot));
        }
        if self.bloom_may_contain(prim_bucket, sec) {
            let sec_bucket = (sec & self.mask) as usize;
            if let Some(slot) = self.scan_bucket(sec_bucket, (sec >> 16) as u16, key) {
                return Some((sec_bucket, slot));
            }
        }
        None
    }

    /// Probes for `key` at time `now`.
    pub fn lookup(&self, key: &FlowId, now: Tick) -> Lookup {
        match self.find(key) {
            Some((bucket, slot)) => {
                if clock::expired(self.buckets[bucket].slots[slot].expiry, now) {
                    Lookup::Expired
                } else {
                    Lookup::Hit
                }
            }
            None => Lookup::Miss,
        }
    }

    /// Returns the live entry for `key`, if any.
    pub fn get(&self, key: &FlowId, now: Tick) -> Option<&V> {
        let (bucket, slot) = self.find(key)?;
        if clock::expired(self.buckets[bucket].slots[slot].expiry, now) {
            return None;
        }
        self.buckets[bucket].slots[slot]
            .entry
            .as_ref()
            .map(|(_, value)| value)
    }

    /// Returns the live entry for `key`, if any.
    pub fn get_mut(&mut self, key: &FlowId, now: Tick) -> Option<&mut V> {
        let (bucket, slot) = self.find(key)?;
        if clock::expired(self.buckets[bucket].slots[slot].expiry, now) {
            return None;
        }
        self.buckets[bucket].slots[slot]
            .entry
            .as_mut()
            .map(|(_, value)| value)
    }

    /// Re-arms the expiration of a live entry. Returns `false` on miss.
    pub fn refresh(&mut self, key: &FlowId, now: Tick, expiry: Tick) -> bool {
        match self.find(key) {
            Some((bucket, slot)) if !clock::expired(self.buckets[bucket].slots[slot].expiry, now) => {
                self.buckets[bucket].slots[slot].expiry = expiry;
                true
            }
            _ => false,
        }
    }

    fn note_secondary_removed(&mut self, prim_sig: u32) {
        let home = (prim_sig & self.mask) as usize;
        let bucket = &mut self.buckets[home];
        bucket.moved = bucket.moved.saturating_sub(1);
        if bucket.moved == 0 {
            bucket.bloom = 0;
        }
    }

    fn clear_slot(&mut self, bucket: usize, slot: usize) -> Option<V> {
        let (in_secondary, prim_sig) = {
            let slot = &self.buckets[bucket].slots[slot];
            (slot.in_secondary, slot.prim_sig)
        };
        let taken = self.buckets[bucket].slots[slot].entry.take();
        if taken.is_some() {
            self.occupied -= 1;
            if in_secondary {
                self.note_secondary_removed(prim_sig);
            }
        }
        taken.map(|(_, value)| value)
    }

    /// Finds a vacant or expired slot in `bucket`, reclaiming an expired one.
    fn free_slot(&mut self, bucket: usize, now: Tick) -> Option<usize> {
        let slots = &self.buckets[bucket].slots;
        if let Some(idx) = slots.iter().position(|slot| slot.entry.is_none()) {
            return Some(idx);
        }
        let expired = slots
            .iter()
            .position(|slot| slot.entry.is_some() && clock::expired(slot.expiry, now))?;
        self.clear_slot(bucket, expired);
        Some(expired)
    }

    #[allow(clippy::too_many_arguments)]
    fn place(
        &mut self,
        bucket: usize,
        slot: usize,
        key: FlowId,
        value: V,
        prim_sig: u32,
        sec_sig: u32,
        expiry: Tick,
        in_secondary: bool,
    ) {
        let dst = &mut self.buckets[bucket].slots[slot];
        dst.sig_hi = if in_secondary {
            (sec_sig >> 16) as u16
        } else {
            (prim_sig >> 16) as u16
        };
        dst.prim_sig = prim_sig;
        dst.sec_sig = sec_sig;
        dst.expiry = expiry;
        dst.in_secondary = in_secondary;
        dst.entry = Some((key, value));
        self.occupied += 1;
        if in_secondary {
            let home = (prim_sig & self.mask) as usize;
            self.buckets[home].bloom |= Self::bloom_bits(sec_sig);
            self.buckets[home].moved += 1;
        }
    }

    /// Frees a slot in `bucket` by recursively displacing an entry to its
    /// secondary bucket, spending at most `steps` moves.
    fn make_room(&mut self, bucket: usize, now: Tick, steps: &mut usize) -> Option<usize> {
        if let Some(slot) = self.free_slot(bucket, now) {
            return Some(slot);
        }
        for victim in 0..ENTRIES_PER_BUCKET {
            if *steps == 0 {
                return None;
            }
            *steps -= 1;

            let alt = {
                let slot = &self.buckets[bucket].slots[victim];
                // Entries already displaced once stay put; their alternate is
                // the bucket they came from.
                if slot.in_secondary {
                    continue;
                }
                (slot.sec_sig & self.mask) as usize
            };
            if alt == bucket {
                continue;
            }
            if let Some(dst) = self.make_room(alt, now, steps) {
                let moved = self.buckets[bucket].slots[victim].entry.take();
                let (prim_sig, sec_sig, expiry) = {
                    let slot = &self.buckets[bucket].slots[victim];
                    (slot.prim_sig, slot.sec_sig, slot.expiry)
                };
                self.occupied -= 1;
                let (key, value) = moved.expect("displacement victim vanished");
                self.place(alt, dst, key, value, prim_sig, sec_sig, expiry, true);
                return Some(victim);
            }
        }
        None
    }

    /// Free slots reachable by displacing one entry out of `bucket`.
    fn victim_headroom(&self, bucket: usize, now: Tick) -> usize {
        let mut headroom = 0;
        for slot in &self.buckets[bucket].slots {
            if slot.entry.is_none() || slot.in_secondary {
                continue;
            }
            let alt = (slot.sec_sig & self.mask) as usize;
            headroom += self.buckets[alt]
                .slots
                .iter()
                .filter(|s| s.entry.is_none() || clock::expired(s.expiry, now))
                .count();
        }
        headroom
    }

    /// Inserts `key` with lifetime ending at `expiry`. An existing entry for
    /// the key (live or expired) is replaced in place.
    pub fn insert(&mut self, key: FlowId, value: V, expiry: Tick, now: Tick) -> Result<(), Error> {
        let (prim, sec) = Self::signatures(&key);
        let prim_bucket = (prim & self.mask) as usize;
        let sec_bucket = (sec & self.mask) as usize;

        if let Some((bucket, slot)) = self.find(&key) {
            let dst = &mut self.buckets[bucket].slots[slot];
            dst.entry = Some((key, value));
            dst.expiry = expiry;
            return Ok(());
        }

        if let Some(slot) = self.free_slot(prim_bucket, now) {
            self.place(prim_bucket, slot, key, value, prim, sec, expiry, false);
            return Ok(());
        }
        if let Some(slot) = self.free_slot(sec_bucket, now) {
            self.place(sec_bucket, slot, key, value, prim, sec, expiry, true);
            return Ok(());
        }

        // Both candidates full: displace, starting from the side whose
        // victims have more room to move into.
        let mut steps = MAX_PUSHES;
        let candidates = if prim_bucket == sec_bucket {
            [(prim_bucket, false), (prim_bucket, false)]
        } else if self.victim_headroom(prim_bucket, now) >= self.victim_headroom(sec_bucket, now) {
            [(prim_bucket, false), (sec_bucket, true)]
        } else {
            [(sec_bucket, true), (prim_bucket, false)]
        };
        for (bucket, in_secondary) in candidates {
            if let Some(slot) = self.make_room(bucket, now, &mut steps) {
                self.place(bucket, slot, key, value, prim, sec, expiry, in_secondary);
                return Ok(());
            }
        }
        Err(Error::ResourceExhausted("flow table displacement depth exceeded"))
    }

    /// Removes `key`, returning its value.
    pub fn delete(&mut self, key: &FlowId, _now: Tick) -> Option<V> {
        let (bucket, slot) = self.find(key)?;
        self.clear_slot(bucket, slot)
    }

    /// Amortised scan over occupied slots, visiting at most `budget` buckets.
    ///
    /// `f` receives each entry with its expiration state and returns whether
    /// the entry should be retained. Returns the number of removed entries.
    pub fn scan<F>(&mut self, cursor: &mut ScanCursor, now: Tick, budget: usize, mut f: F) -> usize
    where
        F: FnMut(&FlowId, &mut V, bool) -> bool,
    {
        let nb_buckets = self.buckets.len();
        let mut removed = 0;
        for _ in 0..budget.min(nb_buckets) {
            let bucket = cursor.next % nb_buckets;
            cursor.next = (cursor.next + 1) % nb_buckets;
            for slot in 0..ENTRIES_PER_BUCKET {
                let retain = {
                    let s = &mut self.buckets[bucket].slots[slot];
                    let is_expired = clock::expired(s.expiry, now);
                    match &mut s.entry {
                        Some((key, value)) => f(key, value, is_expired),
                        None => continue,
                    }
                };
                if !retain {
                    self.clear_slot(bucket, slot);
                    removed += 1;
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key(i: u32) -> FlowId {
        FlowId {
            src_ip: Ipv4Addr::from(0x0a000000 | i),
            dst_ip: Ipv4Addr::new(192, 168, 0, 1),
            src_port: (i % 60000 + 1024) as u16,
            dst_port: 443,
        }
    }

    #[test]
    fn core_flowtable_insert_lookup_delete() {
        let now = Tick(0);
        let mut table: FlowTable<u32> = FlowTable::with_capacity(256);
        table.insert(key(1), 10, now.advanced(100), now).unwrap();

        assert_eq!(table.lookup(&key(1), now), Lookup::Hit);
        assert_eq!(table.lookup(&key(2), now), Lookup::Miss);
        assert_eq!(*table.get_mut(&key(1), now).unwrap(), 10);

        assert_eq!(table.delete(&key(1), now), Some(10));
        assert_eq!(table.lookup(&key(1), now), Lookup::Miss);
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn core_flowtable_expiry_frees_slot() {
        let now = Tick(0);
        let mut table: FlowTable<u32> = FlowTable::with_capacity(64);
        table.insert(key(7), 7, now.advanced(50), now).unwrap();

        // Observable until expiry elapses, expired afterwards.
        assert_eq!(table.lookup(&key(7), Tick(50)), Lookup::Hit);
        let later = now.advanced(50 + clock::MAX_LIFETIME);
        assert_eq!(table.lookup(&key(7), later), Lookup::Expired);
        assert!(table.get_mut(&key(7), later).is_none());

        // The expired slot is reusable and the new entry wins.
        table.insert(key(7), 8, later.advanced(100), later).unwrap();
        assert_eq!(table.lookup(&key(7), later), Lookup::Hit);
        assert_eq!(*table.get_mut(&key(7), later).unwrap(), 8);
    }

    #[test]
    fn core_flowtable_displacement_preserves_live_set() {
        let now = Tick(0);
        let expiry = now.advanced(1000);
        // Small table so inserts collide and displace.
        let mut table: FlowTable<u32> = FlowTable::with_capacity(64);

        let mut inserted = vec![];
        for i in 0..56 {
            if table.insert(key(i), i, expiry, now).is_ok() {
                inserted.push(i);
            }
        }
        assert!(inserted.len() >= 48, "table loaded too sparsely to displace");

        // Every key that went in is still observable exactly once.
        for &i in &inserted {
            assert_eq!(table.lookup(&key(i), now), Lookup::Hit, "lost key {}", i);
            assert_eq!(*table.get_mut(&key(i), now).unwrap(), i);
        }
        assert_eq!(table.occupied(), inserted.len());
    }

    #[test]
    fn core_flowtable_replace_existing() {
        let now = Tick(0);
        let mut table: FlowTable<u32> = FlowTable::with_capacity(64);
        table.insert(key(3), 1, now.advanced(10), now).unwrap();
        table.insert(key(3), 2, now.advanced(20), now).unwrap();
        assert_eq!(table.occupied(), 1);
        assert_eq!(*table.get_mut(&key(3), now).unwrap(), 2);
    }

    #[test]
    fn core_flowtable_scan_reclaims_expired() {
        let now = Tick(0);
        let mut table: FlowTable<u32> = FlowTable::with_capacity(256);
        for i in 0..16 {
            let lifetime = if i % 2 == 0 { 10 } else { 1000 };
            table.insert(key(i), i, now.advanced(lifetime), now).unwrap();
        }

        // Past the short lifetimes, before the long ones.
        let later = now.advanced(20);
        let mut cursor = ScanCursor::default();
        let mut seen_expired = 0;
        let removed = table.scan(&mut cursor, later, DEFAULT_SCAN_BUDGET, |_, _, expired| {
            if expired {
                seen_expired += 1;
            }
            !expired
        });
        assert_eq!(removed, 8);
        assert_eq!(seen_expired, 8);
        assert_eq!(table.occupied(), 8);
        for i in 0..16 {
            let want = if i % 2 == 0 { Lookup::Miss } else { Lookup::Hit };
            assert_eq!(table.lookup(&key(i), later), want);
        }
    }

    #[test]
    fn core_flowtable_refresh_extends_lifetime() {
        let now = Tick(0);
        let mut table: FlowTable<u32> = FlowTable::with_capacity(64);
        table.insert(key(9), 9, now.advanced(10), now).unwrap();
        assert!(table.refresh(&key(9), now, now.advanced(300)));

        let later = now.advanced(10 + clock::MAX_LIFETIME);
        // Would have expired under the original stamp.
        assert_eq!(table.lookup(&key(9), Tick(200)), Lookup::Hit);
        assert_eq!(table.lookup(&key(9), later), Lookup::Expired);
    }
}
