//! The record data model and the digest family used to key
//! the [`crate::offset_map::OffsetMap`].

use serde::{Deserialize, Serialize};

pub type Offset = u64;

/// A single record read from, or written to, a segment's message file.
///
/// A record with `payload: None` is a tombstone. A record with `key: None`
/// is forbidden in a compacted log (`CorruptLog`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub offset: Offset,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Encoded size in bytes, as it appears on disk. Tracked explicitly
    /// rather than recomputed, mirroring the on-disk format.
    pub size: u32,
}

impl Record {
    pub fn new(offset: Offset, key: Option<Vec<u8>>, payload: Option<Vec<u8>>) -> Self {
        let mut rec = Record {
            offset,
            key,
            payload,
            size: 0,
        };
        rec.size = bincode::serialized_size(&rec).unwrap_or(0) as u32;
        rec
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }
}

/// Hash algorithm used to digest keys before they are stored in the
/// [`crate::offset_map::OffsetMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256Truncated16,
}

impl HashAlgorithm {
    /// Width in bytes of the digest this algorithm produces for storage in
    /// the offset map's slots.
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256Truncated16 => 16,
        }
    }

    pub fn digest(self, key: &[u8]) -> Vec<u8> {
        use digest::Digest;
        match self {
            HashAlgorithm::Md5 => md5::Md5::digest(key).to_vec(),
            HashAlgorithm::Sha1 => sha1::Sha1::digest(key).to_vec(),
            HashAlgorithm::Sha256Truncated16 => sha2::Sha256::digest(key)[..16].to_vec(),
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Sha256Truncated16
    }
}

/// Length-prefixed wire encoding for a [`Record`], used both by the mock
/// `Log`/`Segment` (testing feature) and by [`crate::rewriter::SegmentRewriter`]
/// when it copies records verbatim into a destination segment.
pub fn encode_record(record: &Record) -> Vec<u8> {
    let body = bincode::serialize(record).expect("record serialization is infallible");
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decodes as many complete, length-prefixed records as `buf` contains.
/// Returns the decoded records and the number of bytes consumed. A `buf`
/// too short to hold even one complete record decodes to `(vec![], 0)` --
/// the caller (the rewriter's read-buffer-doubling loop) is expected to
/// grow the buffer and retry.
pub fn decode_chunk(buf: &[u8]) -> (Vec<Record>, usize) {
    let mut records = Vec::new();
    let mut pos = 0usize;
    loop {
        if buf.len() - pos < 4 {
            break;
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[pos..pos + 4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if buf.len() - pos - 4 < len {
            break;
        }
        let body = &buf[pos + 4..pos + 4 + len];
        match bincode::deserialize::<Record>(body) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        pos += 4 + len;
    }
    (records, pos)
}
