//! `CleanerConfig`, the configuration surface for this crate. No file or env
//! loading lives here (explicit non-goal) — the embedding broker builds this
//! struct directly, overriding only what it needs to.

use crate::record::HashAlgorithm;

#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Number of cleaner worker threads. Defaults to the machine's core
    /// count.
    pub num_threads: usize,
    /// Total bytes of OffsetMap memory, divided evenly among workers and
    /// capped per worker at 2 GiB.
    pub dedupe_buffer_size: u64,
    /// Utilization ceiling for the OffsetMap; also controls early-stop
    /// during map build.
    pub dedupe_buffer_load_factor: f64,
    /// Initial read/write buffer size per worker, halved between read and
    /// write buffers.
    pub io_buffer_size: usize,
    /// Upper bound for buffer growth; exceeding it is `MessageTooLarge`.
    pub max_message_size: usize,
    /// Global throttle ceiling, in bytes/sec.
    pub max_io_bytes_per_second: f64,
    /// Idle sleep when nothing is cleanable.
    pub back_off_ms: u64,
    /// Digest used by the OffsetMap.
    pub hash_algorithm: HashAlgorithm,
    /// How often the throttler re-checks the rolling window.
    pub check_interval_ms: u64,
}

/// Per-worker cap on OffsetMap memory.
pub const MAX_BUFFER_MEMORY_PER_THREAD: u64 = 2 * 1024 * 1024 * 1024;

impl CleanerConfig {
    /// Bytes of OffsetMap memory handed to each of `num_threads` workers.
    pub fn dedupe_buffer_size_per_thread(&self) -> u64 {
        if self.num_threads == 0 {
            return 0;
        }
        (self.dedupe_buffer_size / self.num_threads as u64).min(MAX_BUFFER_MEMORY_PER_THREAD)
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        CleanerConfig {
            num_threads: num_cpus::get(),
            dedupe_buffer_size: 128 * 1024 * 1024,
            dedupe_buffer_load_factor: 0.75,
            io_buffer_size: 512 * 1024,
            max_message_size: 32 * 1024 * 1024,
            max_io_bytes_per_second: f64::INFINITY,
            back_off_ms: 15_000,
            hash_algorithm: HashAlgorithm::default(),
            check_interval_ms: 300,
        }
    }
}

/// Per-log configuration surface the engine reads off the `Log` collaborator.
#[derive(Debug, Clone, Copy)]
pub struct LogCleaningConfig {
    pub compact: bool,
    pub min_cleanable_ratio: f64,
    pub segment_size: u64,
    pub max_index_size: u64,
    pub delete_retention_ms: i64,
    pub max_message_size: usize,
}

impl Default for LogCleaningConfig {
    fn default() -> Self {
        LogCleaningConfig {
            compact: true,
            min_cleanable_ratio: 0.5,
            segment_size: 1024 * 1024 * 1024,
            max_index_size: 10 * 1024 * 1024,
            delete_retention_ms: 24 * 60 * 60 * 1000,
            max_message_size: 32 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_thread_budget_is_capped() {
        let cfg = CleanerConfig {
            num_threads: 1,
            dedupe_buffer_size: 4 * MAX_BUFFER_MEMORY_PER_THREAD,
            ..CleanerConfig::default()
        };
        assert_eq!(cfg.dedupe_buffer_size_per_thread(), MAX_BUFFER_MEMORY_PER_THREAD);
    }

    #[test]
    fn per_thread_budget_divides_evenly() {
        let cfg = CleanerConfig {
            num_threads: 4,
            dedupe_buffer_size: 400,
            ..CleanerConfig::default()
        };
        assert_eq!(cfg.dedupe_buffer_size_per_thread(), 100);
    }
}
