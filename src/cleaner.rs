//! The per-log cleaning algorithm: build the offset map, group
//! segments, rewrite each group, and report the new first-dirty-offset.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::CleanerConfig;
use crate::error::{CleanerError, Result};
use crate::log::{CleanerStats, Log, LogToClean, Segment};
use crate::offset_map::OffsetMap;
use crate::record::decode_chunk;
use crate::rewriter::SegmentRewriter;
use crate::throttler::Throttler;

/// The states a cleaner worker passes through while cleaning one log.
/// `CleanerManager` drives the `Picking` transition; everything from
/// `BuildingMap` on is driven by [`clean_log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanerState {
    Idle,
    Picking,
    BuildingMap,
    Rewriting,
    Checkpointing,
}

/// Scans segments in `[start_offset, active_segment.base_offset)`, feeding
/// non-null keys into `offset_map`. Returns the largest offset ingested.
/// Stops ingesting new *segments* (never mid-segment) once both (a) the
/// next segment's base offset is past `start_offset + slots * load_factor`
/// and (b) `offset_map.utilization() >= load_factor` -- intentionally
/// preserving the upstream "may overshoot by up to one segment" behavior
/// noted as an open question.
pub fn build_offset_map(
    log: &dyn Log,
    start_offset: u64,
    offset_map: &mut OffsetMap,
    load_factor: f64,
    throttler: &Arc<Throttler>,
    cancelled: &AtomicBool,
) -> Result<u64> {
    let active_base = log.active_segment().base_offset();
    let segments = log.log_segments(start_offset, active_base);
    let stop_after = start_offset + (offset_map.slots() as f64 * load_factor) as u64;

    let mut max_offset_seen: Option<u64> = None;

    for (idx, segment) in segments.iter().enumerate() {
        if cancelled.load(Ordering::SeqCst) {
            return Err(CleanerError::Cancelled);
        }

        scan_segment_into_map(segment.as_ref(), offset_map, throttler, cancelled, &mut max_offset_seen)?;

        let next_base = segments.get(idx + 1).map(|s| s.base_offset());
        let can_stop = match next_base {
            Some(nb) => nb > stop_after,
            None => true,
        };
        if can_stop && offset_map.utilization() >= load_factor {
            break;
        }
    }

    // No records at all: the end offset stays at start_offset.
    Ok(max_offset_seen.map_or(start_offset, |o| o + 1))
}

fn scan_segment_into_map(
    segment: &dyn Segment,
    offset_map: &mut OffsetMap,
    throttler: &Arc<Throttler>,
    cancelled: &AtomicBool,
    max_offset_seen: &mut Option<u64>,
) -> Result<()> {
    let mut pos: u64 = 0;
    let size = segment.size();
    let mut buf = vec![0u8; 64 * 1024];
    let mut carry: Vec<u8> = Vec::new();

    while pos < size || !carry.is_empty() {
        if cancelled.load(Ordering::SeqCst) {
            return Err(CleanerError::Cancelled);
        }
        throttler.maybe_throttle(buf.len() as u64);
        let n = segment.read_at(pos, &mut buf)?;
        if n == 0 && carry.is_empty() {
            break;
        }
        pos += n as u64;

        let mut chunk = std::mem::take(&mut carry);
        chunk.extend_from_slice(&buf[..n]);
        let (records, consumed) = decode_chunk(&chunk);

        for record in &records {
            let key = record
                .key
                .as_ref()
                .ok_or_else(|| CleanerError::CorruptLog(format!("null key at offset {}", record.offset)))?;
            offset_map.put(key, record.offset)?;
            *max_offset_seen = Some(max_offset_seen.map_or(record.offset, |m| m.max(record.offset)));
        }

        carry = chunk[consumed..].to_vec();
        if n == 0 {
            break;
        }
    }

    Ok(())
}

/// Splits `[0, end_offset)` into contiguous groups such that neither the
/// cumulative message-file size nor the cumulative index size exceeds the
/// configured budget. Every group holds at least one segment, even an
/// over-sized one.
pub fn group_segments(
    segments: &[Arc<dyn Segment>],
    max_segment_size: u64,
    max_index_size: u64,
) -> Vec<Vec<Arc<dyn Segment>>> {
    let mut groups = Vec::new();
    let mut current: Vec<Arc<dyn Segment>> = Vec::new();
    let mut current_size = 0u64;
    let mut current_index_size = 0u64;

    for seg in segments {
        let would_size = current_size + seg.size();
        let would_index = current_index_size + seg.index_size_in_bytes();
        if !current.is_empty() && (would_size > max_segment_size || would_index > max_index_size) {
            groups.push(std::mem::take(&mut current));
            current_size = 0;
            current_index_size = 0;
        }
        current_size += seg.size();
        current_index_size += seg.index_size_in_bytes();
        current.push(seg.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Runs one full clean of `to_clean` against `log`. Returns the new
/// first-dirty-offset and accumulated stats. On
/// `OptimisticLockFailure`/`Cancelled`, the returned offset is simply
/// `to_clean.first_dirty_offset` (no progress); the caller decides whether
/// to write that unchanged value back to the checkpoint (it's a no-op
/// either way).
pub fn clean_log(
    log: &dyn Log,
    to_clean: &LogToClean,
    cfg: &CleanerConfig,
    dedupe_buffer_bytes: u64,
    throttler: &Arc<Throttler>,
    cancelled: &AtomicBool,
) -> (u64, CleanerStats, Result<()>) {
    let start = Instant::now();
    let truncate_count = log.number_of_truncates();
    let mut stats = CleanerStats::default();

    let result = (|| -> Result<u64> {
        let mut offset_map = OffsetMap::new(dedupe_buffer_bytes, cfg.hash_algorithm);
        let map_build_start = Instant::now();
        let end_offset = build_offset_map(
            log,
            to_clean.first_dirty_offset,
            &mut offset_map,
            cfg.dedupe_buffer_load_factor,
            throttler,
            cancelled,
        )?;
        stats.index_build_time_ms = map_build_start.elapsed().as_millis() as u64;

        let log_config = log.config();
        let lower_segments = log.log_segments(0, to_clean.first_dirty_offset);
        let delete_horizon_ms = lower_segments
            .last()
            .map(|s| s.last_modified_ms() - log_config.delete_retention_ms)
            .unwrap_or(0);

        let segments_to_clean = log.log_segments(0, end_offset);
        let groups = group_segments(&segments_to_clean, log_config.segment_size, log_config.max_index_size);

        let rewriter = SegmentRewriter::new(throttler.clone(), cfg.io_buffer_size, cfg.max_message_size);

        for group in groups {
            if cancelled.load(Ordering::SeqCst) {
                return Err(CleanerError::Cancelled);
            }
            let group_stats = rewriter.rewrite(
                log,
                &group,
                &offset_map,
                truncate_count,
                delete_horizon_ms,
                4096,
            )?;
            accumulate(&mut stats, &group_stats);
        }

        Ok(end_offset)
    })();

    stats.elapsed_ms = start.elapsed().as_millis() as u64;

    match &result {
        Ok(end_offset) => (*end_offset, stats, Ok(())),
        Err(_) => (to_clean.first_dirty_offset, stats, result.map(|_| ())),
    }
}

fn accumulate(total: &mut CleanerStats, part: &CleanerStats) {
    total.bytes_read += part.bytes_read;
    total.messages_read += part.messages_read;
    total.bytes_written += part.bytes_written;
    total.messages_written += part.messages_written;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::mock::MemLog;
    use crate::record::{HashAlgorithm, Record};

    fn cfg() -> CleanerConfig {
        CleanerConfig {
            num_threads: 1,
            ..CleanerConfig::default()
        }
    }

    #[test]
    fn basic_dedup_scenario() {
        let log = MemLog::new("orders", 0, Default::default());
        log.append_segment(vec![
            Record::new(0, Some(b"a".to_vec()), Some(b"1".to_vec())),
            Record::new(1, Some(b"b".to_vec()), Some(b"1".to_vec())),
            Record::new(2, Some(b"a".to_vec()), Some(b"2".to_vec())),
            Record::new(3, Some(b"c".to_vec()), Some(b"1".to_vec())),
            Record::new(4, Some(b"b".to_vec()), Some(b"2".to_vec())),
        ]);
        log.start_active_segment(5);

        let to_clean = LogToClean {
            partition: crate::log::PartitionId::new("orders", 0),
            first_dirty_offset: 0,
            clean_bytes: 0,
            dirty_bytes: 100,
        };

        let throttler = Arc::new(Throttler::new(f64::INFINITY, 300));
        let cancelled = AtomicBool::new(false);
        let (end_offset, _stats, result) =
            clean_log(&log, &to_clean, &cfg(), 1024 * 32, &throttler, &cancelled);
        result.unwrap();
        assert_eq!(end_offset, 5);

        let mut kept = log.records_in_range(0, 5);
        kept.sort_by_key(|r| r.offset);
        let offsets: Vec<u64> = kept.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2, 3, 4]);
    }

    #[test]
    fn tombstone_retained_within_horizon() {
        let log = MemLog::new("t", 0, crate::config::LogCleaningConfig {
            delete_retention_ms: 60_000,
            ..Default::default()
        });
        log.set_clock_ms(1_000_000);
        log.append_segment(vec![
            Record::new(0, Some(b"a".to_vec()), Some(b"1".to_vec())),
            Record::new(1, Some(b"a".to_vec()), None),
            Record::new(2, Some(b"b".to_vec()), Some(b"1".to_vec())),
        ]);
        log.start_active_segment(3);

        let to_clean = LogToClean {
            partition: crate::log::PartitionId::new("t", 0),
            first_dirty_offset: 0,
            clean_bytes: 0,
            dirty_bytes: 100,
        };
        let throttler = Arc::new(Throttler::new(f64::INFINITY, 300));
        let cancelled = AtomicBool::new(false);
        let (_end_offset, _stats, result) =
            clean_log(&log, &to_clean, &cfg(), 1024 * 32, &throttler, &cancelled);
        result.unwrap();

        let mut kept = log.records_in_range(0, 3);
        kept.sort_by_key(|r| r.offset);
        let offsets: Vec<u64> = kept.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![1, 2]);
    }

    #[test]
    fn tombstone_dropped_past_horizon() {
        let log = MemLog::new("t", 0, crate::config::LogCleaningConfig {
            delete_retention_ms: 1,
            ..Default::default()
        });
        log.set_clock_ms(1_000_000);
        log.append_segment(vec![
            Record::new(0, Some(b"a".to_vec()), Some(b"1".to_vec())),
            Record::new(1, Some(b"a".to_vec()), None),
            Record::new(2, Some(b"b".to_vec()), Some(b"1".to_vec())),
        ]);
        log.set_clock_ms(1_000_000 + 10_000); // active segment far past the horizon
        log.start_active_segment(3);

        let to_clean = LogToClean {
            partition: crate::log::PartitionId::new("t", 0),
            first_dirty_offset: 0,
            clean_bytes: 0,
            dirty_bytes: 100,
        };
        let throttler = Arc::new(Throttler::new(f64::INFINITY, 300));
        let cancelled = AtomicBool::new(false);
        let (_end_offset, _stats, result) =
            clean_log(&log, &to_clean, &cfg(), 1024 * 32, &throttler, &cancelled);
        result.unwrap();

        let kept = log.records_in_range(0, 3);
        let offsets: Vec<u64> = kept.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2]);
    }

    #[test]
    fn grouping_boundary_splits_on_segment_size() {
        let log = MemLog::new("t", 0, Default::default());
        // Each record ~ a few bytes; pad payloads so each segment is
        // unambiguously > 1/3 of the budget.
        let pad = vec![0u8; 256];
        log.append_segment(vec![Record::new(0, Some(b"a".to_vec()), Some(pad.clone()))]);
        log.append_segment(vec![Record::new(1, Some(b"b".to_vec()), Some(pad.clone()))]);
        log.append_segment(vec![Record::new(2, Some(b"c".to_vec()), Some(pad))]);
        log.start_active_segment(3);

        let segments = log.log_segments(0, 3);
        let one_segment_size = segments[0].size();
        let groups = group_segments(&segments, one_segment_size * 2, u64::MAX);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
    }

    #[test]
    fn null_key_aborts_with_corrupt_log() {
        let log = MemLog::new("t", 0, Default::default());
        log.append_segment(vec![Record::new(0, None, Some(b"x".to_vec()))]);
        log.start_active_segment(1);

        let to_clean = LogToClean {
            partition: crate::log::PartitionId::new("t", 0),
            first_dirty_offset: 0,
            clean_bytes: 0,
            dirty_bytes: 100,
        };
        let throttler = Arc::new(Throttler::new(f64::INFINITY, 300));
        let cancelled = AtomicBool::new(false);
        let (end_offset, _stats, result) =
            clean_log(&log, &to_clean, &cfg(), 1024 * 32, &throttler, &cancelled);
        assert!(matches!(result, Err(CleanerError::CorruptLog(_))));
        assert_eq!(end_offset, 0); // no progress recorded
    }

    #[test]
    fn offset_map_hash_algorithm_is_configurable() {
        let cfg = CleanerConfig {
            hash_algorithm: HashAlgorithm::Md5,
            ..CleanerConfig::default()
        };
        assert_eq!(cfg.hash_algorithm, HashAlgorithm::Md5);
    }
}
