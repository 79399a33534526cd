//! A token-bucket-style rate limiter shared across all cleaner workers.
//!
//! The fast path (`maybe_throttle` while under budget) only takes an
//! uncontended mutex and does arithmetic -- no syscalls. Only once the
//! rolling window's observed rate exceeds the ceiling do we sleep.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

struct Window {
    start: Instant,
    bytes_since_start: u64,
}

pub struct Throttler {
    desired_bytes_per_sec: f64,
    check_interval: Duration,
    window: Mutex<Window>,
}

impl Throttler {
    pub fn new(desired_bytes_per_sec: f64, check_interval_ms: u64) -> Self {
        Throttler {
            desired_bytes_per_sec,
            check_interval: Duration::from_millis(check_interval_ms),
            window: Mutex::new(Window {
                start: Instant::now(),
                bytes_since_start: 0,
            }),
        }
    }

    /// Accounts `bytes` against the budget. Blocks the caller just long
    /// enough to bring the windowed rate back down to
    /// `desired_bytes_per_sec`, if it was exceeded.
    pub fn maybe_throttle(&self, bytes: u64) {
        if !self.desired_bytes_per_sec.is_finite() {
            return;
        }

        let sleep_for = {
            let mut w = self.window.lock().unwrap();
            w.bytes_since_start += bytes;

            let elapsed = w.start.elapsed();
            if elapsed < self.check_interval {
                return;
            }

            let observed_rate = w.bytes_since_start as f64 / elapsed.as_secs_f64().max(1e-9);
            let sleep = if observed_rate > self.desired_bytes_per_sec {
                let desired_elapsed = w.bytes_since_start as f64 / self.desired_bytes_per_sec;
                Duration::from_secs_f64((desired_elapsed - elapsed.as_secs_f64()).max(0.0))
            } else {
                Duration::ZERO
            };

            // Start a new window regardless, so a single big burst doesn't
            // keep inflating `elapsed` (and thus the sleep estimate) forever.
            w.start = Instant::now();
            w.bytes_since_start = 0;

            sleep
        };

        if sleep_for > Duration::ZERO {
            thread::sleep(sleep_for);
        }
    }
}
