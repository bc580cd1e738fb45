//! Durable state for the tally pipeline
//!
//! Three logical tables behind one seam:
//! - Entry Store: append-only ballot entries plus their audit rows,
//!   inserted together in one atomic unit and never mutated afterwards.
//! - Aggregate Store: vote-count buckets keyed by (station, list-or-candidate).
//! - Summary Store: one derived rollup row per station.
//!
//! The aggregate/summary write path is a single `commit_station_write` call
//! holding one write guard over both tables, so readers observe either the
//! previous complete state or the new complete state, never a partial write.
//! A SQL backend implements the same method as one transaction.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ballot::{
    AuditRecord, BallotEntry, BallotType, CandidateId, EntryId, ListId, StationId,
};

/// Storage-layer failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or internally corrupted; retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Uniqueness constraint rejected a write.
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// Key of one vote-count bucket within a station.
///
/// Encodes the "never both null" invariant in the type: every bucket is a
/// list tally or a candidate tally.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum BucketKey {
    List(ListId),
    Candidate(CandidateId),
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketKey::List(id) => write!(f, "{}", id),
            BucketKey::Candidate(id) => write!(f, "{}", id),
        }
    }
}

/// A running vote count for one list or one candidate within one station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationAggregate {
    pub station_id: StationId,
    pub list_id: Option<ListId>,
    pub candidate_id: Option<CandidateId>,
    pub vote_count: u64,
    /// Unix nanoseconds of the recomputation that produced this row.
    pub last_updated_at: i64,
}

impl StationAggregate {
    pub fn new(station_id: StationId, key: BucketKey, vote_count: u64, updated_at: i64) -> Self {
        let (list_id, candidate_id) = match key {
            BucketKey::List(id) => (Some(id), None),
            BucketKey::Candidate(id) => (None, Some(id)),
        };
        Self {
            station_id,
            list_id,
            candidate_id,
            vote_count,
            last_updated_at: updated_at,
        }
    }

    /// The unique key of this row.
    ///
    /// Rows are only ever constructed through [`StationAggregate::new`], so
    /// exactly one of the two references is set.
    pub fn key(&self) -> BucketKey {
        match (self.list_id, self.candidate_id) {
            (Some(list), None) => BucketKey::List(list),
            (None, Some(candidate)) => BucketKey::Candidate(candidate),
            _ => unreachable!("aggregate row must be a list or candidate bucket"),
        }
    }
}

/// Station-level rollup of ballot categories.
///
/// Always recomputed from the full entry set, never incremented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationSummary {
    pub station_id: StationId,
    pub total_ballots: u64,
    pub valid_list_votes: u64,
    pub valid_preferential_votes: u64,
    pub white_papers: u64,
    pub cancelled_papers: u64,
    /// Unix nanoseconds of the earliest entry, if any.
    pub first_entry_at: Option<i64>,
    /// Unix nanoseconds of the latest entry, if any.
    pub last_entry_at: Option<i64>,
}

impl StationSummary {
    /// Empty summary for a station with no entries yet.
    pub fn empty(station_id: StationId) -> Self {
        Self {
            station_id,
            total_ballots: 0,
            valid_list_votes: 0,
            valid_preferential_votes: 0,
            white_papers: 0,
            cancelled_papers: 0,
            first_entry_at: None,
            last_entry_at: None,
        }
    }

    /// Category counters sum to the total by construction; exposed for
    /// assertions in tests and consistency checks downstream.
    pub fn categories_sum(&self) -> u64 {
        self.valid_list_votes
            + self.valid_preferential_votes
            + self.white_papers
            + self.cancelled_papers
    }
}

/// Outcome of an entry insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new entry row was persisted.
    Created(EntryId),
    /// An idempotency token matched an existing entry; nothing was written.
    Replayed(EntryId),
}

impl InsertOutcome {
    pub fn entry_id(&self) -> EntryId {
        match self {
            InsertOutcome::Created(id) | InsertOutcome::Replayed(id) => *id,
        }
    }
}

/// Unified seam over the three durable tables.
///
/// The aggregation queries are read-only and run outside any write guard;
/// `commit_station_write` is the only mutation path for aggregates and
/// summaries and is atomic per station.
pub trait TallyStore: Send + Sync {
    /// Persist one entry and its audit row in a single atomic unit.
    ///
    /// If the entry carries an idempotency token already recorded for the
    /// same station, nothing is written and the original id is replayed.
    fn insert_entry(&self, entry: BallotEntry, audit: AuditRecord)
        -> Result<InsertOutcome, StoreError>;

    /// All entries for a station, in insertion order.
    fn entries_for_station(&self, station: StationId) -> Result<Vec<BallotEntry>, StoreError>;

    /// Vote counts grouped by list for valid_list + valid_preferential ballots.
    fn list_tallies(&self, station: StationId) -> Result<BTreeMap<ListId, u64>, StoreError>;

    /// Vote counts grouped by candidate for valid_preferential ballots only.
    fn candidate_tallies(
        &self,
        station: StationId,
    ) -> Result<BTreeMap<CandidateId, u64>, StoreError>;

    /// Category counters and first/last entry timestamps for a station.
    fn summarize_entries(&self, station: StationId) -> Result<StationSummary, StoreError>;

    /// Atomically replace all aggregate rows and the summary row for a
    /// station. All-or-nothing: a failure leaves the previous committed
    /// state fully intact.
    fn commit_station_write(
        &self,
        station: StationId,
        aggregates: Vec<StationAggregate>,
        summary: StationSummary,
    ) -> Result<(), StoreError>;

    /// Currently committed aggregate rows for a station.
    fn aggregates(&self, station: StationId) -> Result<Vec<StationAggregate>, StoreError>;

    /// Currently committed summary row for a station, if any.
    fn summary(&self, station: StationId) -> Result<Option<StationSummary>, StoreError>;

    /// Audit rows for a station, in insertion order.
    fn audit_trail(&self, station: StationId) -> Result<Vec<AuditRecord>, StoreError>;
}

#[derive(Default)]
struct Tables {
    entries: Vec<BallotEntry>,
    audits: Vec<AuditRecord>,
    /// (station, token) → entry id, for idempotent retry replay.
    token_index: HashMap<(StationId, String), EntryId>,
    /// BTreeMap per station for deterministic iteration order.
    aggregates: HashMap<StationId, BTreeMap<BucketKey, StationAggregate>>,
    summaries: HashMap<StationId, StationSummary>,
}

/// In-memory store implementation.
///
/// One `RwLock` over all tables gives the same atomicity the durable
/// backend provides with transactions: entry+audit appear together, and a
/// station's aggregates+summary switch over in one step.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("storage lock poisoned".into())
}

impl TallyStore for MemoryStore {
    fn insert_entry(
        &self,
        entry: BallotEntry,
        audit: AuditRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let mut tables = self.tables.write().map_err(poisoned)?;

        if let Some(token) = &entry.idempotency_token {
            let key = (entry.station_id, token.clone());
            if let Some(existing) = tables.token_index.get(&key) {
                return Ok(InsertOutcome::Replayed(*existing));
            }
        }

        if tables.entries.iter().any(|e| e.id == entry.id) {
            return Err(StoreError::Constraint(format!(
                "duplicate entry id {}",
                entry.id
            )));
        }

        // The token is claimed only once the write is certain to land, so a
        // failed insert never turns a retry into a false replay
        let id = entry.id;
        if let Some(token) = &entry.idempotency_token {
            tables
                .token_index
                .insert((entry.station_id, token.clone()), id);
        }
        tables.entries.push(entry);
        tables.audits.push(audit);
        Ok(InsertOutcome::Created(id))
    }

    fn entries_for_station(&self, station: StationId) -> Result<Vec<BallotEntry>, StoreError> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables
            .entries
            .iter()
            .filter(|e| e.station_id == station)
            .cloned()
            .collect())
    }

    fn list_tallies(&self, station: StationId) -> Result<BTreeMap<ListId, u64>, StoreError> {
        let tables = self.tables.read().map_err(poisoned)?;
        let mut counts = BTreeMap::new();
        for entry in tables.entries.iter().filter(|e| e.station_id == station) {
            let counts_for_list = matches!(
                entry.ballot_type,
                BallotType::ValidList | BallotType::ValidPreferential
            );
            if counts_for_list {
                if let Some(list) = entry.list_id {
                    *counts.entry(list).or_insert(0) += 1;
                }
            }
        }
        Ok(counts)
    }

    fn candidate_tallies(
        &self,
        station: StationId,
    ) -> Result<BTreeMap<CandidateId, u64>, StoreError> {
        let tables = self.tables.read().map_err(poisoned)?;
        let mut counts = BTreeMap::new();
        for entry in tables.entries.iter().filter(|e| e.station_id == station) {
            if entry.ballot_type == BallotType::ValidPreferential {
                if let Some(candidate) = entry.candidate_id {
                    *counts.entry(candidate).or_insert(0) += 1;
                }
            }
        }
        Ok(counts)
    }

    fn summarize_entries(&self, station: StationId) -> Result<StationSummary, StoreError> {
        let tables = self.tables.read().map_err(poisoned)?;
        let mut summary = StationSummary::empty(station);
        for entry in tables.entries.iter().filter(|e| e.station_id == station) {
            summary.total_ballots += 1;
            match entry.ballot_type {
                BallotType::ValidList => summary.valid_list_votes += 1,
                BallotType::ValidPreferential => summary.valid_preferential_votes += 1,
                BallotType::White => summary.white_papers += 1,
                BallotType::Cancelled => summary.cancelled_papers += 1,
            }
            summary.first_entry_at = Some(match summary.first_entry_at {
                Some(t) => t.min(entry.entered_at),
                None => entry.entered_at,
            });
            summary.last_entry_at = Some(match summary.last_entry_at {
                Some(t) => t.max(entry.entered_at),
                None => entry.entered_at,
            });
        }
        Ok(summary)
    }

    fn commit_station_write(
        &self,
        station: StationId,
        aggregates: Vec<StationAggregate>,
        summary: StationSummary,
    ) -> Result<(), StoreError> {
        if summary.station_id != station {
            return Err(StoreError::Constraint(format!(
                "summary station mismatch: {} != {}",
                summary.station_id, station
            )));
        }

        let mut rows = BTreeMap::new();
        for row in aggregates {
            if row.station_id != station {
                return Err(StoreError::Constraint(format!(
                    "aggregate station mismatch: {} != {}",
                    row.station_id, station
                )));
            }
            if rows.insert(row.key(), row).is_some() {
                return Err(StoreError::Constraint(
                    "duplicate aggregate bucket in station write".into(),
                ));
            }
        }

        let mut tables = self.tables.write().map_err(poisoned)?;
        tables.aggregates.insert(station, rows);
        tables.summaries.insert(station, summary);
        Ok(())
    }

    fn aggregates(&self, station: StationId) -> Result<Vec<StationAggregate>, StoreError> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables
            .aggregates
            .get(&station)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn summary(&self, station: StationId) -> Result<Option<StationSummary>, StoreError> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables.summaries.get(&station).cloned())
    }

    fn audit_trail(&self, station: StationId) -> Result<Vec<AuditRecord>, StoreError> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables
            .audits
            .iter()
            .filter(|a| a.station_id == station)
            .cloned()
            .collect())
    }
}

/// Build the audit row for a freshly created entry.
pub fn creation_audit(entry: &BallotEntry) -> AuditRecord {
    AuditRecord {
        id: Uuid::now_v7(),
        entry_id: entry.id,
        station_id: entry.station_id,
        actor: entry.entered_by,
        action: format!("ballot_entry.created:{}", entry.ballot_type),
        source_ip: entry.source_ip.clone(),
        recorded_at: entry.entered_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballot::{now_nanos, BallotData, OperatorId};

    fn entry(station: StationId, data: BallotData) -> BallotEntry {
        BallotEntry {
            id: EntryId::new(),
            station_id: station,
            ballot_type: data.ballot_type,
            list_id: data.list_id,
            candidate_id: data.candidate_id,
            cancellation_reason: data.cancellation_reason,
            entered_by: OperatorId::new(),
            entered_at: now_nanos(),
            source_ip: None,
            metadata: data.metadata,
            idempotency_token: data.idempotency_token,
        }
    }

    fn insert(store: &MemoryStore, e: BallotEntry) -> InsertOutcome {
        let audit = creation_audit(&e);
        store.insert_entry(e, audit).unwrap()
    }

    #[test]
    fn test_entry_and_audit_inserted_together() {
        let store = MemoryStore::new();
        let station = StationId(1);
        insert(&store, entry(station, BallotData::valid_list(ListId(7))));

        assert_eq!(store.entries_for_station(station).unwrap().len(), 1);
        let trail = store.audit_trail(station).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, "ballot_entry.created:valid_list");
    }

    #[test]
    fn test_idempotency_token_replays_original() {
        let store = MemoryStore::new();
        let station = StationId(1);
        let first = entry(station, BallotData::valid_list(ListId(7)).with_token("tok-1"));
        let first_id = first.id;
        assert_eq!(insert(&store, first), InsertOutcome::Created(first_id));

        let retry = entry(station, BallotData::valid_list(ListId(7)).with_token("tok-1"));
        assert_eq!(insert(&store, retry), InsertOutcome::Replayed(first_id));
        assert_eq!(store.entries_for_station(station).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_insert_does_not_claim_token() {
        let store = MemoryStore::new();
        let station = StationId(7);
        let first = entry(station, BallotData::valid_list(ListId(1)));
        let colliding_id = first.id;
        insert(&store, first);

        // Forced id collision: the write must fail without claiming the token
        let mut colliding = entry(station, BallotData::valid_list(ListId(2)).with_token("tok-7"));
        colliding.id = colliding_id;
        let audit = creation_audit(&colliding);
        assert!(matches!(
            store.insert_entry(colliding, audit),
            Err(StoreError::Constraint(_))
        ));

        // A clean retry with the same token is a new entry, not a replay
        let retry = entry(station, BallotData::valid_list(ListId(2)).with_token("tok-7"));
        let retry_id = retry.id;
        assert_eq!(insert(&store, retry), InsertOutcome::Created(retry_id));
        assert_eq!(store.entries_for_station(station).unwrap().len(), 2);
    }

    #[test]
    fn test_same_token_different_station_is_distinct() {
        let store = MemoryStore::new();
        let a = entry(StationId(1), BallotData::white().with_token("tok"));
        let b = entry(StationId(2), BallotData::white().with_token("tok"));
        assert!(matches!(insert(&store, a), InsertOutcome::Created(_)));
        assert!(matches!(insert(&store, b), InsertOutcome::Created(_)));
    }

    #[test]
    fn test_list_tallies_count_both_valid_types() {
        let store = MemoryStore::new();
        let station = StationId(3);
        insert(&store, entry(station, BallotData::valid_list(ListId(7))));
        insert(
            &store,
            entry(
                station,
                BallotData::valid_preferential(Some(ListId(7)), Some(CandidateId(42))),
            ),
        );
        insert(&store, entry(station, BallotData::white()));

        let lists = store.list_tallies(station).unwrap();
        assert_eq!(lists.get(&ListId(7)), Some(&2));

        // Candidate buckets count preferential ballots only
        let candidates = store.candidate_tallies(station).unwrap();
        assert_eq!(candidates.get(&CandidateId(42)), Some(&1));
    }

    #[test]
    fn test_summarize_counts_and_timestamps() {
        let store = MemoryStore::new();
        let station = StationId(4);
        let mut first = entry(station, BallotData::valid_list(ListId(1)));
        first.entered_at = 100;
        let mut second = entry(station, BallotData::cancelled("torn"));
        second.entered_at = 50;
        insert(&store, first);
        insert(&store, second);

        let summary = store.summarize_entries(station).unwrap();
        assert_eq!(summary.total_ballots, 2);
        assert_eq!(summary.valid_list_votes, 1);
        assert_eq!(summary.cancelled_papers, 1);
        assert_eq!(summary.categories_sum(), summary.total_ballots);
        assert_eq!(summary.first_entry_at, Some(50));
        assert_eq!(summary.last_entry_at, Some(100));
    }

    #[test]
    fn test_commit_replaces_station_state_atomically() {
        let store = MemoryStore::new();
        let station = StationId(5);
        let now = now_nanos();

        let rows = vec![
            StationAggregate::new(station, BucketKey::List(ListId(1)), 3, now),
            StationAggregate::new(station, BucketKey::Candidate(CandidateId(9)), 2, now),
        ];
        let mut summary = StationSummary::empty(station);
        summary.total_ballots = 5;
        summary.valid_list_votes = 3;
        summary.valid_preferential_votes = 2;
        store
            .commit_station_write(station, rows, summary.clone())
            .unwrap();

        // Second commit fully replaces the first
        let rows = vec![StationAggregate::new(
            station,
            BucketKey::List(ListId(1)),
            4,
            now,
        )];
        summary.total_ballots = 4;
        summary.valid_preferential_votes = 0;
        summary.valid_list_votes = 4;
        store.commit_station_write(station, rows, summary).unwrap();

        let committed = store.aggregates(station).unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].vote_count, 4);
        assert_eq!(store.summary(station).unwrap().unwrap().total_ballots, 4);
    }

    #[test]
    fn test_commit_rejects_mismatched_station() {
        let store = MemoryStore::new();
        let rows = vec![StationAggregate::new(
            StationId(9),
            BucketKey::List(ListId(1)),
            1,
            0,
        )];
        let result =
            store.commit_station_write(StationId(8), rows, StationSummary::empty(StationId(8)));
        assert!(matches!(result, Err(StoreError::Constraint(_))));
    }

    #[test]
    fn test_commit_rejects_duplicate_bucket() {
        let store = MemoryStore::new();
        let station = StationId(6);
        let rows = vec![
            StationAggregate::new(station, BucketKey::List(ListId(1)), 1, 0),
            StationAggregate::new(station, BucketKey::List(ListId(1)), 2, 0),
        ];
        let result = store.commit_station_write(station, rows, StationSummary::empty(station));
        assert!(matches!(result, Err(StoreError::Constraint(_))));
    }
}
