//! A log compaction engine for a partitioned, append-only commit log:
//! scans each log's dirty tail, keeps only the latest write per key (plus
//! tombstones within their retention window), and rewrites it in place.
//!
//! The crate is split along the same lines the rest of this workspace uses
//! for its storage engines: narrow collaborator traits (`Log`, `Segment`)
//! define what the embedding broker must provide, and everything else here
//! is pure logic over those traits.

mod checkpoint;
mod cleaner;
mod config;
mod error;
mod log;
mod manager;
mod offset_map;
mod record;
mod rewriter;
mod thread_pool;
mod throttler;

pub use checkpoint::CheckpointStore;
pub use cleaner::{build_offset_map, clean_log, group_segments, CleanerState};
pub use config::{CleanerConfig, LogCleaningConfig, MAX_BUFFER_MEMORY_PER_THREAD};
pub use error::{CleanerError, Result};
pub use log::{CleanerStats, Log, LogToClean, OptimisticLockFailure, PartitionId, Segment, StagedSegment};
pub use manager::{default_logger, CleanerManager};
pub use offset_map::OffsetMap;
pub use record::{decode_chunk, encode_record, HashAlgorithm, Offset, Record};
pub use rewriter::SegmentRewriter;
pub use thread_pool::{NaiveThreadPool, RayonThreadPool, SharedQueueThreadPool, ThreadPool};
pub use throttler::Throttler;

#[cfg(any(test, feature = "testing"))]
pub use log::mock;
