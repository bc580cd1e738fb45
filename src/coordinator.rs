//! Aggregation coordinator
//!
//! Recomputes one station's aggregates and summary from the full entry set
//! under the station's lease lock:
//!
//! 1. acquire the per-station lock (wait budget, lease = timeout + margin);
//!    contention re-enqueues instead of failing;
//! 2. run the three read-only aggregation passes over the Entry Store,
//!    outside any write guard;
//! 3. commit all aggregate rows and the summary row in one atomic write;
//! 4. refresh the cached snapshot, then publish `StationUpdated` — both
//!    after the commit, so neither can roll it back;
//! 5. release the lock on every exit path (guard drop covers errors).
//!
//! Recompute is idempotent: it always reads current entry state, so any
//! number of runs in any order converge to the state of a single run after
//! the last entry. The work queue leans on this for its retry policy.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::ballot::{now_nanos, StationId};
use crate::cache::{SnapshotAggregate, SnapshotCache, SnapshotSummary, StationSnapshot};
use crate::lock::{AcquireOutcome, StationLockService};
use crate::metrics::TallyMetrics;
use crate::notify::{Broadcaster, TallyEvent};
use crate::roster::Roster;
use crate::store::{BucketKey, StationAggregate, StationSummary, StoreError, TallyStore};

/// Errors that abort a recompute run and reach the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecomputeError {
    #[error("storage failure during recompute: {0}")]
    Store(#[from] StoreError),
}

/// Result of one recompute invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeOutcome {
    /// Aggregates and summary committed; cache and subscribers refreshed.
    Completed,
    /// Lock wait budget exhausted; caller should re-enqueue with a short
    /// delay. Normal contention, not an error.
    Contended,
}

/// Decrements the in-flight gauge when the protected section exits,
/// whatever the path.
struct SectionGuard<'a>(&'a TallyMetrics);

impl Drop for SectionGuard<'_> {
    fn drop(&mut self) {
        self.0.recompute_exited();
    }
}

pub struct Coordinator {
    store: Arc<dyn TallyStore>,
    locks: StationLockService,
    cache: Arc<SnapshotCache>,
    broadcaster: Arc<Broadcaster>,
    roster: Arc<Roster>,
    metrics: Arc<TallyMetrics>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn TallyStore>,
        locks: StationLockService,
        cache: Arc<SnapshotCache>,
        broadcaster: Arc<Broadcaster>,
        roster: Arc<Roster>,
        metrics: Arc<TallyMetrics>,
    ) -> Self {
        Self {
            store,
            locks,
            cache,
            broadcaster,
            roster,
            metrics,
        }
    }

    /// Recompute the station's aggregates and summary.
    pub async fn recompute(&self, station: StationId) -> Result<RecomputeOutcome, RecomputeError> {
        let guard = match self.locks.acquire(station).await {
            AcquireOutcome::Acquired(guard) => guard,
            AcquireOutcome::Contended => {
                TallyMetrics::incr(&self.metrics.recompute_contentions);
                warn!(station = %station, "station lock contended, recompute deferred");
                return Ok(RecomputeOutcome::Contended);
            }
        };

        self.metrics.recompute_entered();
        let section = SectionGuard(&self.metrics);

        let result = self.recompute_locked(station).await;

        // Leave the instrumented section while still holding the lock, then
        // release; the peak-holders gauge must never see a successor enter
        // before this run is counted out
        drop(section);
        guard.release();

        match &result {
            Ok(_) => {
                TallyMetrics::incr(&self.metrics.recompute_runs);
            }
            Err(err) => {
                TallyMetrics::incr(&self.metrics.recompute_failures);
                error!(station = %station, error = %err, "recompute failed");
            }
        }
        result
    }

    async fn recompute_locked(
        &self,
        station: StationId,
    ) -> Result<RecomputeOutcome, RecomputeError> {
        // Read passes run outside the write guard to keep the write window
        // short. Entries are append-only, so an entry landing between the
        // reads and the commit is picked up by its own debounced trigger.
        let list_tallies = self.store.list_tallies(station)?;
        let candidate_tallies = self.store.candidate_tallies(station)?;
        let summary = self.store.summarize_entries(station)?;

        let updated_at = now_nanos();
        let mut rows = Vec::with_capacity(list_tallies.len() + candidate_tallies.len());
        for (list, count) in &list_tallies {
            rows.push(StationAggregate::new(
                station,
                BucketKey::List(*list),
                *count,
                updated_at,
            ));
        }
        for (candidate, count) in &candidate_tallies {
            rows.push(StationAggregate::new(
                station,
                BucketKey::Candidate(*candidate),
                *count,
                updated_at,
            ));
        }

        self.store
            .commit_station_write(station, rows.clone(), summary.clone())?;

        debug!(
            station = %station,
            total_ballots = summary.total_ballots,
            buckets = rows.len(),
            "aggregates committed"
        );

        // The durable write above is authoritative; snapshot refresh and
        // notification lag behind momentarily if anything below misbehaves.
        let snapshot = self.build_snapshot(station, rows, &summary, updated_at);
        self.cache.put(snapshot);
        TallyMetrics::incr(&self.metrics.snapshots_refreshed);

        self.broadcaster.publish(TallyEvent::StationUpdated {
            station_id: station,
            updated_at,
            payload: Some(json!({ "total_ballots": summary.total_ballots })),
        });
        TallyMetrics::incr(&self.metrics.events_published);

        info!(
            station = %station,
            total_ballots = summary.total_ballots,
            "station tally recomputed"
        );
        Ok(RecomputeOutcome::Completed)
    }

    fn build_snapshot(
        &self,
        station: StationId,
        mut rows: Vec<StationAggregate>,
        summary: &StationSummary,
        refreshed_at: i64,
    ) -> StationSnapshot {
        // Descending by vote count; bucket key breaks ties so two builds of
        // the same state render identically
        rows.sort_by(|a, b| {
            b.vote_count
                .cmp(&a.vote_count)
                .then_with(|| a.key().cmp(&b.key()))
        });

        let scope = self.roster.scope(station);
        let aggregates = rows
            .into_iter()
            .map(|row| {
                let list_name = row
                    .list_id
                    .and_then(|id| scope.as_ref().and_then(|s| s.list_name(id)));
                let candidate_name = row
                    .candidate_id
                    .and_then(|id| scope.as_ref().and_then(|s| s.candidate_name(id)));
                SnapshotAggregate {
                    list_id: row.list_id,
                    candidate_id: row.candidate_id,
                    vote_count: row.vote_count,
                    list_name,
                    candidate_name,
                }
            })
            .collect();

        StationSnapshot {
            station_id: station,
            aggregates,
            summary: SnapshotSummary {
                total_ballots_entered: summary.total_ballots,
                valid_list_votes: summary.valid_list_votes,
                valid_preferential_votes: summary.valid_preferential_votes,
                white_papers: summary.white_papers,
                cancelled_papers: summary.cancelled_papers,
            },
            refreshed_at,
        }
    }
}
