//! Owns the pool of cleaner workers, tracks which partitions are
//! currently being cleaned, and decides which log each idle worker should
//! pick up next.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use slog::{info, o, warn, Logger};

use crate::checkpoint::CheckpointStore;
use crate::cleaner::{clean_log, CleanerState};
use crate::config::CleanerConfig;
use crate::error::Result;
use crate::log::{Log, LogToClean, PartitionId};
use crate::thread_pool::ThreadPool;
use crate::throttler::Throttler;

struct RegisteredLog {
    log: Weak<dyn Log>,
    data_dir: PathBuf,
}

struct State {
    registered: HashMap<PartitionId, RegisteredLog>,
    in_progress: HashSet<PartitionId>,
    checkpoints: HashMap<PathBuf, Arc<CheckpointStore>>,
    last_cleaned: HashMap<PartitionId, u64>,
}

struct Shared {
    state: Mutex<State>,
    cleaned_cv: Condvar,
    shutdown: AtomicBool,
    throttler: Arc<Throttler>,
    config: CleanerConfig,
    logger: Logger,
}

/// Coordinates cleaning across every registered log, using `P` to run
/// worker loops. Construction does not start any threads -- call
/// [`CleanerManager::startup`] once the manager has been handed to its
/// final owner.
pub struct CleanerManager<P: ThreadPool> {
    shared: Arc<Shared>,
    pool: P,
}

impl<P: ThreadPool> CleanerManager<P> {
    pub fn new(config: CleanerConfig, logger: Logger) -> Result<Self> {
        let throttler = Arc::new(Throttler::new(config.max_io_bytes_per_second, config.check_interval_ms));
        let pool = P::new(config.num_threads as u32)?;
        Ok(CleanerManager {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    registered: HashMap::new(),
                    in_progress: HashSet::new(),
                    checkpoints: HashMap::new(),
                    last_cleaned: HashMap::new(),
                }),
                cleaned_cv: Condvar::new(),
                shutdown: AtomicBool::new(false),
                throttler,
                config,
                logger,
            }),
            pool,
        })
    }

    /// Registers a log as a candidate for cleaning. `data_dir` identifies
    /// which `cleaner-offset-checkpoint` file its progress is recorded in;
    /// several partitions commonly share one directory.
    pub fn register_log(&self, partition: PartitionId, log: Weak<dyn Log>, data_dir: PathBuf) -> Result<()> {
        let already_open = self.shared.state.lock().unwrap().checkpoints.contains_key(&data_dir);
        if !already_open {
            // Opens (and potentially reads) the checkpoint file without
            // holding `state`, so a slow disk doesn't stall every other
            // worker's `select_dirtiest`. If another registration for the
            // same directory raced us, `or_insert` keeps whichever store
            // got there first and this one is simply dropped.
            let store = Arc::new(CheckpointStore::open(&data_dir)?);
            self.shared.state.lock().unwrap().checkpoints.entry(data_dir.clone()).or_insert(store);
        }
        self.shared.state.lock().unwrap().registered.insert(partition, RegisteredLog { log, data_dir });
        Ok(())
    }

    pub fn deregister_log(&self, partition: &PartitionId) {
        let mut state = self.shared.state.lock().unwrap();
        state.registered.remove(partition);
        state.in_progress.remove(partition);
    }

    /// Spawns `num_threads` long-lived worker loops, each repeatedly
    /// selecting the dirtiest eligible log, cleaning it, checkpointing the
    /// result, and backing off when nothing is cleanable.
    pub fn startup(manager: Arc<Self>) {
        for worker_id in 0..manager.shared.config.num_threads {
            let shared = manager.shared.clone();
            manager.pool.spawn(move || worker_loop(shared, worker_id));
        }
    }

    /// Requests that all worker loops stop. Does not block. The same flag
    /// is threaded into `clean_log` as its cancellation token, so a worker
    /// mid-run observes it between records -- in map-building and in
    /// rewriting -- and aborts with `Cancelled` rather than finishing the
    /// whole log; a worker that is idle or between logs observes it at the
    /// top of the next loop iteration.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }

    /// Test hook: blocks until `partition` has been checkpointed at or past
    /// `target_offset`, or `timeout` elapses. Returns whether it was
    /// reached.
    pub fn await_cleaned(&self, partition: &PartitionId, target_offset: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let state = self.shared.state.lock().unwrap();
        let mut state = state;
        loop {
            if state.last_cleaned.get(partition).copied().unwrap_or(0) >= target_offset {
                return true;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return false,
            };
            let (guard, timeout_result) = self.shared.cleaned_cv.wait_timeout(state, remaining).unwrap();
            state = guard;
            if timeout_result.timed_out() {
                return state.last_cleaned.get(partition).copied().unwrap_or(0) >= target_offset;
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    let log = shared.logger.new(o!("worker" => worker_id));
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        trace_state(&log, CleanerState::Picking);
        let picked = select_dirtiest(&shared);
        let (partition, target, to_clean, data_dir) = match picked {
            Some(v) => v,
            None => {
                trace_state(&log, CleanerState::Idle);
                thread::sleep(Duration::from_millis(shared.config.back_off_ms));
                continue;
            }
        };

        info!(log, "worker picked log for cleaning"; "topic" => &partition.topic, "partition" => partition.partition);

        // `clean_log` builds the offset map and rewrites segments in one
        // call, so `BuildingMap`/`Rewriting` are logged back-to-back here
        // rather than interleaved with cancellation checks a worker loop
        // could act on between them.
        trace_state(&log, CleanerState::BuildingMap);
        trace_state(&log, CleanerState::Rewriting);
        let dedupe_bytes = shared.config.dedupe_buffer_size_per_thread();
        let (end_offset, stats, result) = clean_log(
            target.as_ref(),
            &to_clean,
            &shared.config,
            dedupe_bytes,
            &shared.throttler,
            &shared.shutdown,
        );

        trace_state(&log, CleanerState::Checkpointing);
        let mut retry_after_io_fault = false;
        match &result {
            Ok(()) => {
                info!(log, "clean finished";
                    "topic" => &partition.topic, "partition" => partition.partition,
                    "new_first_dirty_offset" => end_offset,
                    "messages_written" => stats.messages_written);
            }
            Err(e @ crate::error::CleanerError::Io(_)) => {
                slog::error!(log, "clean aborted on I/O fault"; "topic" => &partition.topic,
                    "partition" => partition.partition, "error" => format!("{}", e));
                retry_after_io_fault = true;
            }
            Err(e @ crate::error::CleanerError::CorruptLog(_))
            | Err(e @ crate::error::CleanerError::MessageTooLarge { .. })
            | Err(e @ crate::error::CleanerError::MapFull) => {
                slog::error!(log, "clean aborted"; "topic" => &partition.topic,
                    "partition" => partition.partition, "error" => format!("{}", e));
            }
            Err(e) => {
                warn!(log, "clean aborted"; "topic" => &partition.topic,
                    "partition" => partition.partition, "error" => format!("{}", e));
            }
        }

        finish_cleaning(&shared, &partition, &data_dir, end_offset);
        trace_state(&log, CleanerState::Idle);

        if retry_after_io_fault {
            thread::sleep(Duration::from_millis(shared.config.back_off_ms));
        }
    }
}

fn trace_state(log: &Logger, state: CleanerState) {
    slog::debug!(log, "worker state"; "state" => format!("{:?}", state));
}

/// Picks the eligible, not-in-progress log with the highest cleanable
/// ratio at or above `min_cleanable_ratio`, marking it in-progress before
/// returning it. Mirrors the selection contract: ties are
/// broken by registration order (the `HashMap` iteration order is
/// otherwise arbitrary, so this is best-effort fairness, not a guarantee).
fn select_dirtiest(shared: &Shared) -> Option<(PartitionId, Arc<dyn Log>, LogToClean, PathBuf)> {
    let mut state = shared.state.lock().unwrap();
    let mut best: Option<(PartitionId, Arc<dyn Log>, LogToClean, PathBuf)> = None;
    let mut dead: Vec<PartitionId> = Vec::new();

    for (partition, registered) in state.registered.iter() {
        if state.in_progress.contains(partition) {
            continue;
        }
        let log = match registered.log.upgrade() {
            Some(l) => l,
            None => {
                dead.push(partition.clone());
                continue;
            }
        };
        let log_config = log.config();
        if !log_config.compact {
            continue;
        }

        let checkpoint = state.checkpoints.get(&registered.data_dir).cloned();
        let first_dirty_offset = checkpoint.as_ref().and_then(|c| c.get(partition)).unwrap_or(0);
        let to_clean = dirtiness(log.as_ref(), partition, first_dirty_offset);
        let total_bytes = to_clean.clean_bytes + to_clean.dirty_bytes;
        if total_bytes == 0 || to_clean.cleanable_ratio() <= log_config.min_cleanable_ratio {
            continue;
        }

        let is_better = match &best {
            None => true,
            Some((_, _, current, _)) => to_clean.cleanable_ratio() > current.cleanable_ratio(),
        };
        if is_better {
            best = Some((partition.clone(), log, to_clean, registered.data_dir.clone()));
        }
    }

    for partition in dead {
        state.registered.remove(&partition);
    }

    if let Some((partition, _, _, _)) = &best {
        state.in_progress.insert(partition.clone());
    }
    best
}

fn dirtiness(log: &dyn Log, partition: &PartitionId, first_dirty_offset: u64) -> LogToClean {
    let active_base = log.active_segment().base_offset();
    let clean_bound = first_dirty_offset.min(active_base);
    let clean_bytes = log.log_segments(0, clean_bound).iter().map(|s| s.size()).sum();
    let dirty_bytes = log
        .log_segments(first_dirty_offset, active_base)
        .iter()
        .map(|s| s.size())
        .sum();
    LogToClean {
        partition: partition.clone(),
        first_dirty_offset,
        clean_bytes,
        dirty_bytes,
    }
}

fn finish_cleaning(shared: &Shared, partition: &PartitionId, data_dir: &std::path::Path, end_offset: u64) {
    let store = {
        let mut state = shared.state.lock().unwrap();
        state.in_progress.remove(partition);
        state.checkpoints.get(data_dir).cloned()
    };

    // The checkpoint write (fsync + rename) happens with `state` unlocked;
    // `CheckpointStore`'s own mutex still serializes concurrent writers to
    // the same directory.
    if let Some(store) = store {
        if let Err(e) = store.update(partition.clone(), end_offset) {
            warn!(shared.logger, "checkpoint write failed"; "error" => format!("{}", e));
        }
    }

    let mut state = shared.state.lock().unwrap();
    state.last_cleaned.insert(partition.clone(), end_offset);
    shared.cleaned_cv.notify_all();
}

/// Builds the default `slog` root logger, in the style of this crate's
/// embedding binaries (plain term decorator over stderr, synchronous).
pub fn default_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    Logger::root(slog_term::FullFormat::new(plain).build().fuse(), o!())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::mock::MemLog;
    use crate::record::Record;
    use crate::thread_pool::SharedQueueThreadPool;

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn selects_the_dirtiest_eligible_log() {
        let log_clean = Arc::new(MemLog::new("clean", 0, Default::default()));
        log_clean.append_segment(vec![Record::new(0, Some(b"a".to_vec()), Some(b"1".to_vec()))]);
        log_clean.start_active_segment(1);

        let log_dirty = Arc::new(MemLog::new("dirty", 0, Default::default()));
        log_dirty.append_segment(vec![
            Record::new(0, Some(b"a".to_vec()), Some(vec![0u8; 1000])),
            Record::new(1, Some(b"a".to_vec()), Some(vec![0u8; 1000])),
            Record::new(2, Some(b"a".to_vec()), Some(vec![0u8; 1000])),
        ]);
        log_dirty.start_active_segment(3);

        let shared = Shared {
            state: Mutex::new(State {
                registered: HashMap::new(),
                in_progress: HashSet::new(),
                checkpoints: HashMap::new(),
                last_cleaned: HashMap::new(),
            }),
            cleaned_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            throttler: Arc::new(Throttler::new(f64::INFINITY, 300)),
            config: CleanerConfig::default(),
            logger: logger(),
        };

        {
            let mut state = shared.state.lock().unwrap();
            state.registered.insert(
                PartitionId::new("clean", 0),
                RegisteredLog {
                    log: Arc::downgrade(&(log_clean.clone() as Arc<dyn Log>)),
                    data_dir: log_clean.dir().to_path_buf(),
                },
            );
            state.registered.insert(
                PartitionId::new("dirty", 0),
                RegisteredLog {
                    log: Arc::downgrade(&(log_dirty.clone() as Arc<dyn Log>)),
                    data_dir: log_dirty.dir().to_path_buf(),
                },
            );
        }

        let picked = select_dirtiest(&shared).expect("one log should be eligible");
        assert_eq!(picked.0.topic, "dirty");
    }

    #[test]
    fn reranks_after_checkpoint_advances() {
        // "a" starts fully dirty (ratio 1.0); "b" starts already partly
        // cleaned (a small clean segment ahead of a much bigger dirty one).
        let log_a = Arc::new(MemLog::new("a", 0, Default::default()));
        log_a.append_segment(vec![
            Record::new(0, Some(b"k".to_vec()), Some(vec![0u8; 4000])),
            Record::new(1, Some(b"k".to_vec()), Some(vec![0u8; 4000])),
        ]);
        log_a.start_active_segment(2);

        let log_b = Arc::new(MemLog::new("b", 0, Default::default()));
        log_b.append_segment(vec![Record::new(0, Some(b"k".to_vec()), Some(vec![0u8; 100]))]);
        log_b.append_segment(vec![Record::new(1, Some(b"k".to_vec()), Some(vec![0u8; 4000]))]);
        log_b.start_active_segment(2);

        let shared = Shared {
            state: Mutex::new(State {
                registered: HashMap::new(),
                in_progress: HashSet::new(),
                checkpoints: HashMap::new(),
                last_cleaned: HashMap::new(),
            }),
            cleaned_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            throttler: Arc::new(Throttler::new(f64::INFINITY, 300)),
            config: CleanerConfig::default(),
            logger: logger(),
        };

        let part_a = PartitionId::new("a", 0);
        let part_b = PartitionId::new("b", 0);
        let store_a = Arc::new(CheckpointStore::open(log_a.dir()).unwrap());
        let store_b = Arc::new(CheckpointStore::open(log_b.dir()).unwrap());
        store_b.update(part_b.clone(), 1).unwrap();

        {
            let mut state = shared.state.lock().unwrap();
            state.registered.insert(
                part_a.clone(),
                RegisteredLog {
                    log: Arc::downgrade(&(log_a.clone() as Arc<dyn Log>)),
                    data_dir: log_a.dir().to_path_buf(),
                },
            );
            state.registered.insert(
                part_b.clone(),
                RegisteredLog {
                    log: Arc::downgrade(&(log_b.clone() as Arc<dyn Log>)),
                    data_dir: log_b.dir().to_path_buf(),
                },
            );
            state.checkpoints.insert(log_a.dir().to_path_buf(), store_a.clone());
            state.checkpoints.insert(log_b.dir().to_path_buf(), store_b.clone());
        }

        // Five consecutive picks all favor "a", the dirtier log. Release it
        // between calls the way `finish_cleaning` would, without advancing
        // its checkpoint, so it stays the dirtiest eligible log throughout.
        for _ in 0..5 {
            let picked = select_dirtiest(&shared).expect("a log should be eligible");
            assert_eq!(picked.0.topic, "a");
            shared.state.lock().unwrap().in_progress.remove(&picked.0);
        }

        // Advance "a"'s checkpoint to its active segment's base offset, so
        // its dirty tail disappears entirely.
        store_a.update(part_a.clone(), 2).unwrap();

        let picked = select_dirtiest(&shared).expect("b should now be the dirtiest eligible log");
        assert_eq!(picked.0.topic, "b");
    }

    #[test]
    fn in_progress_logs_are_skipped() {
        let log = Arc::new(MemLog::new("t", 0, Default::default()));
        log.append_segment(vec![
            Record::new(0, Some(b"a".to_vec()), Some(vec![0u8; 1000])),
            Record::new(1, Some(b"a".to_vec()), Some(vec![0u8; 1000])),
        ]);
        log.start_active_segment(2);

        let shared = Shared {
            state: Mutex::new(State {
                registered: HashMap::new(),
                in_progress: HashSet::new(),
                checkpoints: HashMap::new(),
                last_cleaned: HashMap::new(),
            }),
            cleaned_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            throttler: Arc::new(Throttler::new(f64::INFINITY, 300)),
            config: CleanerConfig::default(),
            logger: logger(),
        };
        let partition = PartitionId::new("t", 0);
        {
            let mut state = shared.state.lock().unwrap();
            state.registered.insert(
                partition.clone(),
                RegisteredLog {
                    log: Arc::downgrade(&(log.clone() as Arc<dyn Log>)),
                    data_dir: log.dir().to_path_buf(),
                },
            );
            state.in_progress.insert(partition);
        }

        assert!(select_dirtiest(&shared).is_none());
    }

    #[test]
    fn end_to_end_clean_via_worker_loop_updates_checkpoint() {
        let log = Arc::new(MemLog::new("orders", 0, Default::default()));
        log.append_segment(vec![
            Record::new(0, Some(b"a".to_vec()), Some(b"1".to_vec())),
            Record::new(1, Some(b"a".to_vec()), Some(b"2".to_vec())),
            Record::new(2, Some(b"b".to_vec()), Some(vec![0u8; 2000])),
        ]);
        log.start_active_segment(3);

        let manager = Arc::new(
            CleanerManager::<SharedQueueThreadPool>::new(
                CleanerConfig {
                    num_threads: 1,
                    back_off_ms: 5,
                    ..CleanerConfig::default()
                },
                logger(),
            )
            .unwrap(),
        );
        manager
            .register_log(
                PartitionId::new("orders", 0),
                Arc::downgrade(&(log.clone() as Arc<dyn Log>)),
                log.dir().to_path_buf(),
            )
            .unwrap();

        CleanerManager::startup(manager.clone());
        let reached = manager.await_cleaned(&PartitionId::new("orders", 0), 3, Duration::from_secs(5));
        manager.shutdown();
        assert!(reached);
    }
}
