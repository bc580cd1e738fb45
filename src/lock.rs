//! Named, leased per-station mutual exclusion
//!
//! The aggregation coordinator serializes recomputation per station through
//! this service: acquire with a wait budget, hold under a lease, release on
//! every exit path. The lease bounds how long a crashed holder can block
//! others; an expired lease is taken over by the next acquirer.
//!
//! Workers run in multiple processes in production, so the lock is modeled
//! as a token-checked lease table rather than a plain mutex: release only
//! succeeds for the token that acquired it, and expiry is wall-clock based.
//! A distributed backend (TTL key in a shared store) implements the same
//! acquire/release/expire semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::ballot::StationId;

/// Lock acquisition parameters.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long an acquirer waits for a held lock before giving up.
    pub wait_budget: Duration,
    /// How long a granted lease stays valid without release.
    pub lease: Duration,
    /// Poll interval while waiting on a held lock.
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_budget: Duration::from_secs(5),
            lease: Duration::from_secs(35),
            poll_interval: Duration::from_millis(50),
        }
    }
}

struct Lease {
    token: u64,
    expires_at: Instant,
}

struct LockTable {
    leases: Mutex<HashMap<StationId, Lease>>,
    next_token: AtomicU64,
}

impl LockTable {
    /// Try to take the lease now. Returns the granted token, or None if a
    /// live lease is held by someone else.
    fn try_take(&self, station: StationId, lease: Duration) -> Option<u64> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if let Some(existing) = leases.get(&station) {
            if existing.expires_at > now {
                return None;
            }
            warn!(
                station = %station,
                stale_token = existing.token,
                "taking over expired lock lease"
            );
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        leases.insert(
            station,
            Lease {
                token,
                expires_at: now + lease,
            },
        );
        Some(token)
    }

    /// Release the lease if the token still owns it.
    fn release(&self, station: StationId, token: u64) -> bool {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get(&station) {
            Some(lease) if lease.token == token => {
                leases.remove(&station);
                true
            }
            _ => false,
        }
    }

    /// Whether a live lease currently exists for the station.
    fn is_held(&self, station: StationId) -> bool {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases
            .get(&station)
            .map(|l| l.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

/// Outcome of an acquisition attempt.
pub enum AcquireOutcome {
    /// Lease granted; the guard releases it on drop.
    Acquired(LockGuard),
    /// Wait budget exhausted while another holder kept the lease. This is
    /// normal contention, not an error.
    Contended,
}

/// Per-station lease lock service.
#[derive(Clone)]
pub struct StationLockService {
    table: Arc<LockTable>,
    config: LockConfig,
}

impl StationLockService {
    pub fn new(config: LockConfig) -> Self {
        Self {
            table: Arc::new(LockTable {
                leases: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LockConfig::default())
    }

    /// Acquire the station's lock, polling until the wait budget runs out.
    pub async fn acquire(&self, station: StationId) -> AcquireOutcome {
        let deadline = Instant::now() + self.config.wait_budget;
        loop {
            if let Some(token) = self.table.try_take(station, self.config.lease) {
                debug!(station = %station, token, "lock acquired");
                return AcquireOutcome::Acquired(LockGuard {
                    table: Arc::clone(&self.table),
                    station,
                    token,
                    released: false,
                });
            }
            if Instant::now() >= deadline {
                debug!(station = %station, "lock wait budget exhausted");
                return AcquireOutcome::Contended;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Whether the station's lock is currently held (live lease).
    pub fn is_held(&self, station: StationId) -> bool {
        self.table.is_held(station)
    }
}

/// Scoped holder of a station lease.
///
/// Releases on drop, covering every exit path including panics and early
/// returns. A failed release (lease already expired and taken over) is
/// logged, never escalated.
pub struct LockGuard {
    table: Arc<LockTable>,
    station: StationId,
    token: u64,
    released: bool,
}

impl LockGuard {
    pub fn station(&self) -> StationId {
        self.station
    }

    /// Explicit release, for callers that want the log line at a precise
    /// point. Drop covers the rest.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.table.release(self.station, self.token) {
            debug!(station = %self.station, token = self.token, "lock released");
        } else {
            warn!(
                station = %self.station,
                token = self.token,
                "lock release skipped: lease expired or taken over"
            );
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    fn fast_config() -> LockConfig {
        LockConfig {
            wait_budget: Duration::from_millis(50),
            lease: Duration::from_millis(500),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = StationLockService::new(fast_config());
        let station = StationId(1);

        let guard = match locks.acquire(station).await {
            AcquireOutcome::Acquired(g) => g,
            AcquireOutcome::Contended => panic!("uncontended acquire failed"),
        };
        assert!(locks.is_held(station));

        guard.release();
        assert!(!locks.is_held(station));
    }

    #[tokio::test]
    async fn test_contention_reports_contended() {
        let locks = StationLockService::new(fast_config());
        let station = StationId(2);

        let _held = match locks.acquire(station).await {
            AcquireOutcome::Acquired(g) => g,
            AcquireOutcome::Contended => panic!(),
        };

        match locks.acquire(station).await {
            AcquireOutcome::Contended => {}
            AcquireOutcome::Acquired(_) => panic!("second acquire should contend"),
        }
    }

    #[tokio::test]
    async fn test_guard_drop_releases() {
        let locks = StationLockService::new(fast_config());
        let station = StationId(3);

        {
            let _guard = match locks.acquire(station).await {
                AcquireOutcome::Acquired(g) => g,
                AcquireOutcome::Contended => panic!(),
            };
            assert!(locks.is_held(station));
        }
        assert!(!locks.is_held(station));
    }

    #[tokio::test]
    async fn test_expired_lease_taken_over() {
        let config = LockConfig {
            wait_budget: Duration::from_millis(200),
            lease: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
        };
        let locks = StationLockService::new(config);
        let station = StationId(4);

        let stale = match locks.acquire(station).await {
            AcquireOutcome::Acquired(g) => g,
            AcquireOutcome::Contended => panic!(),
        };

        // Holder "crashes": keep the guard alive past its lease
        tokio::time::sleep(Duration::from_millis(40)).await;

        let fresh = match locks.acquire(station).await {
            AcquireOutcome::Acquired(g) => g,
            AcquireOutcome::Contended => panic!("expired lease should be taken over"),
        };

        // The stale guard's release must not evict the new holder
        stale.release();
        assert!(locks.is_held(station));
        drop(fresh);
        assert!(!locks.is_held(station));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_holder() {
        let locks = StationLockService::new(LockConfig {
            wait_budget: Duration::from_secs(5),
            lease: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
        });
        let station = StationId(5);
        let holders = Arc::new(AtomicI64::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let locks = locks.clone();
            let holders = Arc::clone(&holders);
            handles.push(tokio::spawn(async move {
                let guard = match locks.acquire(station).await {
                    AcquireOutcome::Acquired(g) => g,
                    AcquireOutcome::Contended => return false,
                };
                let inside = holders.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(inside, 1, "two holders inside the critical section");
                tokio::time::sleep(Duration::from_millis(2)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
                drop(guard);
                true
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap() {
                acquired += 1;
            }
        }
        assert!(acquired > 0);
    }

    #[tokio::test]
    async fn test_different_stations_independent() {
        let locks = StationLockService::new(fast_config());
        let _a = match locks.acquire(StationId(10)).await {
            AcquireOutcome::Acquired(g) => g,
            AcquireOutcome::Contended => panic!(),
        };
        match locks.acquire(StationId(11)).await {
            AcquireOutcome::Acquired(_) => {}
            AcquireOutcome::Contended => panic!("different station must not contend"),
        }
    }
}
