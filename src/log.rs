//! The external interfaces the engine consumes and the derived
//! bookkeeping types built on top of them. `Log` and `Segment` are narrow
//! capability traits; real instances are owned by the (out-of-scope)
//! `LogManager`, which is why the engine only ever holds
//! [`std::sync::Weak`] references to them.

use std::sync::Arc;

use crate::config::LogCleaningConfig;

/// Identifies a partition: `(topic, partition)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId {
    pub topic: String,
    pub partition: u32,
}

impl PartitionId {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        PartitionId {
            topic: topic.into(),
            partition,
        }
    }
}

/// A single immutable (or, for the last one, active) segment of a log.
pub trait Segment: Send + Sync {
    fn base_offset(&self) -> u64;
    fn size(&self) -> u64;
    fn last_modified_ms(&self) -> i64;
    fn index_size_in_bytes(&self) -> u64;
    fn index_interval_bytes(&self) -> u64;

    /// Reads up to `buf.len()` bytes starting at physical byte `position`
    /// into `buf`, returning the number of bytes read (0 at end of
    /// segment).
    fn read_at(&self, position: u64, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// A log: an ordered sequence of segments, exactly one of which (the last)
/// is active and receives appends.
pub trait Log: Send + Sync {
    fn name(&self) -> &str;
    fn dir(&self) -> &std::path::Path;
    fn config(&self) -> LogCleaningConfig;

    /// The single segment currently receiving appends. Never compacted.
    fn active_segment(&self) -> Arc<dyn Segment>;

    /// All segments whose `base_offset` is in `[from_offset, to_offset)`,
    /// in ascending offset order. Inclusive of any segment whose
    /// `base_offset < to_offset`, per the Log contract.
    fn log_segments(&self, from_offset: u64, to_offset: u64) -> Vec<Arc<dyn Segment>>;

    /// Monotonic counter bumped by any truncation; the optimistic
    /// concurrency token for [`Log::replace_segments`].
    fn number_of_truncates(&self) -> u32;

    /// Atomically swaps `old_segments` for `new_segment`, iff
    /// `number_of_truncates() == expected_truncate_count`. On mismatch,
    /// returns `Err` and the caller must delete any staged files itself.
    fn replace_segments(
        &self,
        new_segment: StagedSegment,
        old_segments: &[Arc<dyn Segment>],
        expected_truncate_count: u32,
    ) -> Result<(), OptimisticLockFailure>;
}

/// A staged `.cleaned` replacement segment, ready to be spliced in by
/// [`Log::replace_segments`]. Produced by [`crate::rewriter::SegmentRewriter`].
pub struct StagedSegment {
    pub base_offset: u64,
    pub size: u64,
    pub last_modified_ms: i64,
    /// Path to the `.cleaned` message file on disk, for `Log` implementations
    /// that rename staged files into place rather than re-reading them.
    pub path: std::path::PathBuf,
}

#[derive(Debug)]
pub struct OptimisticLockFailure;

/// A candidate log for cleaning, plus its dirtiness.
#[derive(Debug, Clone)]
pub struct LogToClean {
    pub partition: PartitionId,
    pub first_dirty_offset: u64,
    pub clean_bytes: u64,
    pub dirty_bytes: u64,
}

impl LogToClean {
    pub fn cleanable_ratio(&self) -> f64 {
        let total = self.clean_bytes + self.dirty_bytes;
        if total == 0 {
            0.0
        } else {
            self.dirty_bytes as f64 / total as f64
        }
    }
}

/// Per-run counters. Purely observational.
#[derive(Debug, Clone, Default)]
pub struct CleanerStats {
    pub bytes_read: u64,
    pub messages_read: u64,
    pub bytes_written: u64,
    pub messages_written: u64,
    pub index_build_time_ms: u64,
    pub elapsed_ms: u64,
}

/// An in-memory `Log`/`Segment` implementation used by this crate's own
/// tests and by downstream integration tests, backed by a real temp
/// directory rather than faking the filesystem calls.
#[cfg(any(test, feature = "testing"))]
pub mod mock {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{SystemTime, UNIX_EPOCH};

    use tempfile::TempDir;

    use super::{Log, OptimisticLockFailure, Segment, StagedSegment};
    use crate::config::LogCleaningConfig;
    use crate::record::{decode_chunk, encode_record, Record};

    pub struct MemSegment {
        base_offset: u64,
        data: Vec<u8>,
        last_modified_ms: i64,
        index_interval_bytes: u64,
    }

    impl Segment for MemSegment {
        fn base_offset(&self) -> u64 {
            self.base_offset
        }

        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        fn last_modified_ms(&self) -> i64 {
            self.last_modified_ms
        }

        fn index_size_in_bytes(&self) -> u64 {
            // A real index has one entry per `index_interval_bytes`, 8 bytes
            // wide (4-byte relative offset + 4-byte position).
            (self.data.len() as u64 / self.index_interval_bytes.max(1)) * 8
        }

        fn index_interval_bytes(&self) -> u64 {
            self.index_interval_bytes
        }

        fn read_at(&self, position: u64, buf: &mut [u8]) -> std::io::Result<usize> {
            let position = position as usize;
            if position >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - position);
            buf[..n].copy_from_slice(&self.data[position..position + n]);
            Ok(n)
        }
    }

    struct Inner {
        segments: Vec<Arc<MemSegment>>,
        truncates: u32,
    }

    /// An in-memory log. Owns a real temp directory on disk, since
    /// [`crate::rewriter::SegmentRewriter`] stages `.cleaned` files through
    /// the real filesystem.
    pub struct MemLog {
        topic: String,
        partition: u32,
        config: LogCleaningConfig,
        dir: TempDir,
        inner: Mutex<Inner>,
        clock_ms: AtomicI64,
    }

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
    }

    impl MemLog {
        pub fn new(topic: &str, partition: u32, config: LogCleaningConfig) -> Self {
            MemLog {
                topic: topic.to_string(),
                partition,
                config,
                dir: TempDir::new().expect("tempdir"),
                inner: Mutex::new(Inner {
                    segments: Vec::new(),
                    truncates: 0,
                }),
                clock_ms: AtomicI64::new(now_ms()),
            }
        }

        /// Overrides the wall-clock used for subsequently-appended segments'
        /// `last_modified_ms`, so tests can simulate tombstones past (or
        /// within) the delete horizon without sleeping.
        pub fn set_clock_ms(&self, ms: i64) {
            self.clock_ms.store(ms, Ordering::SeqCst);
        }

        /// Appends a new *immutable* segment containing `records`, whose
        /// base offset is the first record's offset.
        pub fn append_segment(&self, records: Vec<Record>) -> u64 {
            let base_offset = records.first().expect("non-empty segment").offset;
            let mut data = Vec::new();
            for r in &records {
                data.extend_from_slice(&encode_record(r));
            }
            let seg = Arc::new(MemSegment {
                base_offset,
                data,
                last_modified_ms: self.clock_ms.load(Ordering::SeqCst),
                index_interval_bytes: 4096,
            });
            let mut inner = self.inner.lock().unwrap();
            inner.segments.push(seg);
            base_offset
        }

        /// Starts a new, empty active segment at `base_offset`. Never
        /// touched by compaction.
        pub fn start_active_segment(&self, base_offset: u64) {
            let seg = Arc::new(MemSegment {
                base_offset,
                data: Vec::new(),
                last_modified_ms: self.clock_ms.load(Ordering::SeqCst),
                index_interval_bytes: 4096,
            });
            let mut inner = self.inner.lock().unwrap();
            inner.segments.push(seg);
        }

        /// Test hook simulating an external truncation.
        pub fn truncate(&self) {
            self.inner.lock().unwrap().truncates += 1;
        }

        /// Decodes every record in `[from_offset, to_offset)`, across
        /// however many segments that spans. Test helper only.
        pub fn records_in_range(&self, from_offset: u64, to_offset: u64) -> Vec<Record> {
            let inner = self.inner.lock().unwrap();
            let mut out = Vec::new();
            for seg in inner.segments.iter() {
                if seg.base_offset >= to_offset {
                    continue;
                }
                let (records, _) = decode_chunk(&seg.data);
                out.extend(
                    records
                        .into_iter()
                        .filter(|r| r.offset >= from_offset && r.offset < to_offset),
                );
            }
            out
        }
    }

    impl Log for MemLog {
        fn name(&self) -> &str {
            &self.topic
        }

        fn dir(&self) -> &std::path::Path {
            self.dir.path()
        }

        fn config(&self) -> LogCleaningConfig {
            self.config
        }

        fn active_segment(&self) -> Arc<dyn Segment> {
            let inner = self.inner.lock().unwrap();
            inner
                .segments
                .last()
                .cloned()
                .expect("active segment must exist") as Arc<dyn Segment>
        }

        fn log_segments(&self, from_offset: u64, to_offset: u64) -> Vec<Arc<dyn Segment>> {
            let inner = self.inner.lock().unwrap();
            let start_idx = inner
                .segments
                .iter()
                .rposition(|s| s.base_offset <= from_offset)
                .unwrap_or(0);
            inner.segments[start_idx..]
                .iter()
                .filter(|s| s.base_offset < to_offset)
                .map(|s| s.clone() as Arc<dyn Segment>)
                .collect()
        }

        fn number_of_truncates(&self) -> u32 {
            self.inner.lock().unwrap().truncates
        }

        fn replace_segments(
            &self,
            new_segment: StagedSegment,
            old_segments: &[Arc<dyn Segment>],
            expected_truncate_count: u32,
        ) -> Result<(), OptimisticLockFailure> {
            let mut inner = self.inner.lock().unwrap();
            if inner.truncates != expected_truncate_count {
                return Err(OptimisticLockFailure);
            }

            let data = std::fs::read(&new_segment.path).map_err(|_| OptimisticLockFailure)?;
            let old_offsets: Vec<u64> = old_segments.iter().map(|s| s.base_offset()).collect();
            inner.segments.retain(|s| !old_offsets.contains(&s.base_offset));

            let seg = Arc::new(MemSegment {
                base_offset: new_segment.base_offset,
                data,
                last_modified_ms: new_segment.last_modified_ms,
                index_interval_bytes: 4096,
            });
            inner.segments.push(seg);
            inner.segments.sort_by_key(|s| s.base_offset);
            drop(inner);

            let _ = std::fs::remove_file(&new_segment.path);
            Ok(())
        }
    }
}
