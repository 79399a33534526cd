//! A bounded-memory, open-addressed hash table mapping a key digest to
//! the offset of its most recent write.
//!
//! Backed by a single contiguous byte buffer so the memory footprint is
//! fixed at construction time -- no resizing, ever. Each slot is
//! `digest_len + 8` bytes: the key digest followed by a big-endian `i64`
//! offset. An all-zero digest with offset `-1` marks an empty slot.

use crate::error::{CleanerError, Result};
use crate::record::HashAlgorithm;

const EMPTY_OFFSET: i64 = -1;

pub struct OffsetMap {
    algorithm: HashAlgorithm,
    digest_len: usize,
    slot_len: usize,
    slots: usize,
    buf: Vec<u8>,
    occupied: usize,
}

impl OffsetMap {
    /// Builds a map whose slot count is `memory_bytes / (digest_len + 8)`.
    pub fn new(memory_bytes: u64, algorithm: HashAlgorithm) -> Self {
        let digest_len = algorithm.digest_len();
        let slot_len = digest_len + 8;
        let slots = ((memory_bytes / slot_len as u64) as usize).max(1);
        let mut map = OffsetMap {
            algorithm,
            digest_len,
            slot_len,
            slots,
            buf: vec![0u8; slots * slot_len],
            occupied: 0,
        };
        map.reset_sentinels();
        map
    }

    fn reset_sentinels(&mut self) {
        for slot in 0..self.slots {
            self.write_offset(slot, EMPTY_OFFSET);
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn utilization(&self) -> f64 {
        if self.slots == 0 {
            0.0
        } else {
            self.occupied as f64 / self.slots as f64
        }
    }

    pub fn clear(&mut self) {
        self.occupied = 0;
        for b in self.buf.iter_mut() {
            *b = 0;
        }
        self.reset_sentinels();
    }

    /// Inserts or overwrites `key -> offset`. Overwriting an existing key
    /// always succeeds, even at capacity; a *new* key into a full table is
    /// `MapFull` -- callers are expected to respect `utilization` and stop
    /// feeding keys before this happens.
    pub fn put(&mut self, key: &[u8], offset: u64) -> Result<()> {
        let digest = self.algorithm.digest(key);
        let start = self.probe_start(&digest);

        for i in 0..self.slots {
            let slot = (start + i) % self.slots;
            if self.slot_digest_matches(slot, &digest) {
                self.write_offset(slot, offset as i64);
                return Ok(());
            }
            if self.slot_is_empty(slot) {
                self.write_digest(slot, &digest);
                self.write_offset(slot, offset as i64);
                self.occupied += 1;
                return Ok(());
            }
        }

        Err(CleanerError::MapFull)
    }

    /// Returns the stored offset for `key`, or `-1` if absent.
    pub fn get(&self, key: &[u8]) -> i64 {
        let digest = self.algorithm.digest(key);
        let start = self.probe_start(&digest);

        for i in 0..self.slots {
            let slot = (start + i) % self.slots;
            if self.slot_is_empty(slot) {
                return EMPTY_OFFSET;
            }
            if self.slot_digest_matches(slot, &digest) {
                return self.read_offset(slot);
            }
        }
        EMPTY_OFFSET
    }

    fn probe_start(&self, digest: &[u8]) -> usize {
        let mut h: u64 = 0;
        for &b in digest {
            h = h.wrapping_mul(31).wrapping_add(b as u64);
        }
        (h % self.slots as u64) as usize
    }

    fn slot_offset_bytes(&self, slot: usize) -> usize {
        slot * self.slot_len
    }

    fn slot_digest_matches(&self, slot: usize, digest: &[u8]) -> bool {
        let base = self.slot_offset_bytes(slot);
        &self.buf[base..base + self.digest_len] == digest
    }

    fn slot_is_empty(&self, slot: usize) -> bool {
        self.read_offset(slot) == EMPTY_OFFSET && self.digest_is_zero(slot)
    }

    fn digest_is_zero(&self, slot: usize) -> bool {
        let base = self.slot_offset_bytes(slot);
        self.buf[base..base + self.digest_len].iter().all(|&b| b == 0)
    }

    fn write_digest(&mut self, slot: usize, digest: &[u8]) {
        let base = self.slot_offset_bytes(slot);
        self.buf[base..base + self.digest_len].copy_from_slice(digest);
    }

    fn read_offset(&self, slot: usize) -> i64 {
        let base = self.slot_offset_bytes(slot) + self.digest_len;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[base..base + 8]);
        i64::from_be_bytes(bytes)
    }

    fn write_offset(&mut self, slot: usize, offset: i64) {
        let base = self.slot_offset_bytes(slot) + self.digest_len;
        self.buf[base..base + 8].copy_from_slice(&offset.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> OffsetMap {
        OffsetMap::new(1024 * (16 + 8), HashAlgorithm::default())
    }

    #[test]
    fn absent_key_returns_sentinel() {
        let m = map();
        assert_eq!(m.get(b"nope"), -1);
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut m = map();
        m.put(b"a", 42).unwrap();
        assert_eq!(m.get(b"a"), 42);
    }

    #[test]
    fn later_put_overwrites_last_writer_wins() {
        let mut m = map();
        m.put(b"a", 1).unwrap();
        m.put(b"a", 2).unwrap();
        assert_eq!(m.get(b"a"), 2);
        assert_eq!(m.utilization(), 1.0 / m.slots() as f64);
    }

    #[test]
    fn clear_empties_the_map() {
        let mut m = map();
        m.put(b"a", 1).unwrap();
        m.clear();
        assert_eq!(m.get(b"a"), -1);
        assert_eq!(m.utilization(), 0.0);
    }

    #[test]
    fn utilization_tracks_distinct_keys_only() {
        let mut m = map();
        m.put(b"a", 1).unwrap();
        m.put(b"b", 2).unwrap();
        m.put(b"a", 3).unwrap();
        assert_eq!(m.utilization(), 2.0 / m.slots() as f64);
    }

    #[test]
    fn overwrite_succeeds_even_when_table_is_full() {
        // One slot: only one distinct key fits.
        let mut m = OffsetMap::new(1 * (16 + 8), HashAlgorithm::default());
        m.put(b"only", 1).unwrap();
        assert!(m.put(b"only", 2).is_ok());
        assert_eq!(m.get(b"only"), 2);
    }

    #[test]
    fn new_key_into_full_table_is_map_full() {
        let mut m = OffsetMap::new(1 * (16 + 8), HashAlgorithm::default());
        m.put(b"only", 1).unwrap();
        assert!(m.put(b"other", 2).is_err());
    }
}
