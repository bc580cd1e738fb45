//! Ballot entry ingestion
//!
//! Validates one submitted ballot, persists the entry and its audit row in
//! a single atomic unit, echoes an `EntryCreated` event to live UI
//! subscribers, and schedules a debounced recompute for the station.
//!
//! Aggregation never runs inline here: the fixed debounce delay coalesces
//! bursts of entries from the same station into fewer recompute cycles.
//! A failed submission persists nothing; the caller may retry, supplying an
//! idempotency token when the failure was ambiguous so the retry replays
//! the original entry instead of creating a duplicate.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::ballot::{
    now_nanos, BallotData, BallotEntry, BallotError, EntryId, OperatorId, StationId,
};
use crate::config::TallyConfig;
use crate::metrics::TallyMetrics;
use crate::notify::{Broadcaster, TallyEvent};
use crate::queue::{QueueError, QueueHandle};
use crate::roster::Roster;
use crate::store::{creation_audit, InsertOutcome, StoreError, TallyStore};

/// Submission failures. Nothing is persisted when one is returned, except
/// `Scheduling`, which reports an already-persisted entry whose aggregation
/// trigger could not be queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Ballot shape violates the per-category invariant. Never retried.
    #[error("invalid ballot: {0}")]
    InvalidBallot(#[from] BallotError),

    /// No electoral scope registered for the station.
    #[error("unknown station: {0}")]
    UnknownStation(StationId),

    /// Referenced list/candidate outside the station's electoral scope.
    /// Never retried.
    #[error("reference out of station scope: {0}")]
    OutOfScope(String),

    /// Storage failed; retryable, ideally with an idempotency token.
    #[error("entry persistence failed: {0}")]
    Storage(#[from] StoreError),

    /// Recompute scheduling failed because the pipeline is shutting down.
    /// The entry is persisted; the next submission re-triggers aggregation.
    #[error("recompute scheduling failed: {0}")]
    Scheduling(#[from] QueueError),
}

pub struct IngestionHandler {
    store: Arc<dyn TallyStore>,
    roster: Arc<Roster>,
    broadcaster: Arc<Broadcaster>,
    queue: QueueHandle,
    metrics: Arc<TallyMetrics>,
    config: TallyConfig,
}

impl IngestionHandler {
    pub fn new(
        store: Arc<dyn TallyStore>,
        roster: Arc<Roster>,
        broadcaster: Arc<Broadcaster>,
        queue: QueueHandle,
        metrics: Arc<TallyMetrics>,
        config: TallyConfig,
    ) -> Self {
        Self {
            store,
            roster,
            broadcaster,
            queue,
            metrics,
            config,
        }
    }

    /// Validate and persist one ballot entry, then schedule aggregation.
    pub fn submit(
        &self,
        station: StationId,
        entered_by: OperatorId,
        data: BallotData,
        source_ip: Option<String>,
    ) -> Result<EntryId, SubmitError> {
        if let Err(err) = data.validate_shape() {
            TallyMetrics::incr(&self.metrics.entries_rejected);
            warn!(station = %station, error = %err, "ballot rejected: bad shape");
            return Err(err.into());
        }
        self.check_scope(station, &data)?;

        let entry = BallotEntry {
            id: EntryId::new(),
            station_id: station,
            ballot_type: data.ballot_type,
            list_id: data.list_id,
            candidate_id: data.candidate_id,
            cancellation_reason: data.cancellation_reason,
            entered_by,
            entered_at: now_nanos(),
            source_ip,
            metadata: data.metadata,
            idempotency_token: data.idempotency_token,
        };
        let audit = creation_audit(&entry);

        let outcome = self.store.insert_entry(entry.clone(), audit)?;
        let entry_id = match outcome {
            InsertOutcome::Created(id) => {
                TallyMetrics::incr(&self.metrics.entries_accepted);
                id
            }
            InsertOutcome::Replayed(id) => {
                TallyMetrics::incr(&self.metrics.entries_replayed);
                debug!(
                    station = %station,
                    entry_id = %id,
                    "idempotent retry replayed existing entry"
                );
                // Entry already counted; still re-trigger aggregation below
                // in case the original trigger was lost
                id
            }
        };

        if matches!(outcome, InsertOutcome::Created(_)) {
            self.broadcaster.publish(TallyEvent::EntryCreated {
                station_id: station,
                entry_id,
                ballot_type: entry.ballot_type,
                list_id: entry.list_id,
                candidate_id: entry.candidate_id,
                entered_at: entry.entered_at,
            });
            TallyMetrics::incr(&self.metrics.events_published);
        }

        self.queue
            .submit_after(station, self.config.debounce_window)?;

        info!(
            station = %station,
            entry_id = %entry_id,
            ballot_type = %entry.ballot_type,
            "ballot entry accepted"
        );
        Ok(entry_id)
    }

    /// Reject references that fall outside the station's electoral scope.
    fn check_scope(&self, station: StationId, data: &BallotData) -> Result<(), SubmitError> {
        let scope = self
            .roster
            .scope(station)
            .ok_or(SubmitError::UnknownStation(station))?;

        if let Some(list) = data.list_id {
            if !scope.has_list(list) {
                TallyMetrics::incr(&self.metrics.entries_rejected);
                return Err(SubmitError::OutOfScope(format!(
                    "{} not in {} scope",
                    list, station
                )));
            }
        }
        if let Some(candidate) = data.candidate_id {
            if !scope.has_candidate(candidate) {
                TallyMetrics::incr(&self.metrics.entries_rejected);
                return Err(SubmitError::OutOfScope(format!(
                    "{} not in {} scope",
                    candidate, station
                )));
            }
        }
        Ok(())
    }
}
