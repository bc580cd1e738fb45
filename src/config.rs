//! Configuration for the tally pipeline
//!
//! All windows are durations so tests can shrink them to milliseconds.
//! The lock lease is derived as task timeout + margin: a worker that dies
//! mid-recompute holds the lock no longer than one timed-out task plus the
//! safety margin.

use std::time::Duration;

use crate::lock::LockConfig;

#[derive(Debug, Clone)]
pub struct TallyConfig {
    /// Delay between entry persistence and the recompute task running,
    /// coalescing bursts of entries into fewer recompute cycles.
    pub debounce_window: Duration,
    /// How long a recompute waits for the station lock before re-enqueueing.
    pub lock_wait_budget: Duration,
    /// Delay before a contended recompute is re-enqueued.
    pub contention_requeue_delay: Duration,
    /// Hard timeout for one recompute task execution.
    pub task_timeout: Duration,
    /// Added to the task timeout to form the lock lease duration.
    pub lease_margin: Duration,
    /// Poll interval while waiting on a held lock.
    pub lock_poll_interval: Duration,
    /// Backoff delays between recompute retries; length bounds the attempts.
    pub retry_backoff: Vec<Duration>,
    /// Cached snapshot time-to-live.
    pub cache_ttl: Duration,
    /// Number of queue workers.
    pub workers: usize,
    /// Broadcast channel capacity per channel.
    pub channel_capacity: usize,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(5),
            lock_wait_budget: Duration::from_secs(5),
            contention_requeue_delay: Duration::from_secs(3),
            task_timeout: Duration::from_secs(30),
            lease_margin: Duration::from_secs(5),
            lock_poll_interval: Duration::from_millis(50),
            retry_backoff: vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(60),
            ],
            cache_ttl: Duration::from_secs(300),
            workers: 4,
            channel_capacity: 1024,
        }
    }
}

impl TallyConfig {
    /// Lease outlives the task timeout so a dead holder expires on its own
    /// without ever blocking the station forever.
    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            wait_budget: self.lock_wait_budget,
            lease: self.task_timeout + self.lease_margin,
            poll_interval: self.lock_poll_interval,
        }
    }

    /// Maximum execution attempts for a recompute task (first run + retries).
    pub fn max_attempts(&self) -> usize {
        1 + self.retry_backoff.len()
    }

    /// Shrunk windows for tests.
    #[doc(hidden)]
    pub fn fast() -> Self {
        Self {
            debounce_window: Duration::from_millis(10),
            lock_wait_budget: Duration::from_millis(100),
            contention_requeue_delay: Duration::from_millis(10),
            task_timeout: Duration::from_millis(500),
            lease_margin: Duration::from_millis(100),
            lock_poll_interval: Duration::from_millis(2),
            retry_backoff: vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(30),
            ],
            cache_ttl: Duration::from_secs(60),
            workers: 4,
            channel_capacity: 1024,
        }
    }
}
