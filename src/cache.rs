//! Read cache of display-ready station snapshots
//!
//! Holds one denormalized snapshot per station with a bounded TTL.
//! Never authoritative: the aggregation coordinator is the only writer and
//! refreshes a station's snapshot after each successful durable commit, so
//! readers either see a complete committed view or a miss (and fall back to
//! the aggregate/summary stores).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ballot::{CandidateId, ListId, StationId};

/// One aggregate row of a snapshot, enriched with display names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotAggregate {
    pub list_id: Option<ListId>,
    pub candidate_id: Option<CandidateId>,
    pub vote_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_name: Option<String>,
}

/// Summary counters of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub total_ballots_entered: u64,
    pub valid_list_votes: u64,
    pub valid_preferential_votes: u64,
    pub white_papers: u64,
    pub cancelled_papers: u64,
}

/// Display-ready copy of one station's aggregates + summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationSnapshot {
    pub station_id: StationId,
    /// Sorted by vote_count descending.
    pub aggregates: Vec<SnapshotAggregate>,
    pub summary: SnapshotSummary,
    /// Unix nanoseconds when the snapshot was built.
    pub refreshed_at: i64,
}

struct CachedEntry {
    snapshot: StationSnapshot,
    expires_at: Instant,
}

/// TTL key-value cache of station snapshots.
pub struct SnapshotCache {
    entries: Mutex<HashMap<StationId, CachedEntry>>,
    ttl: Duration,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Store/overwrite a station's snapshot with a fresh TTL.
    pub fn put(&self, snapshot: StationSnapshot) {
        let station = snapshot.station_id;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            station,
            CachedEntry {
                snapshot,
                expires_at: Instant::now() + self.ttl,
            },
        );
        debug!(station = %station, ttl_ms = self.ttl.as_millis() as u64, "snapshot cached");
    }

    /// Fetch a station's snapshot if present and not expired.
    ///
    /// Expired entries are evicted on access.
    pub fn get(&self, station: StationId) -> Option<StationSnapshot> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&station) {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.snapshot.clone()),
            Some(_) => {
                entries.remove(&station);
                debug!(station = %station, "expired snapshot evicted");
                None
            }
            None => None,
        }
    }

    /// Drop a station's snapshot outright.
    pub fn invalidate(&self, station: StationId) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&station);
    }

    /// Number of cached stations, counting expired-but-unevicted entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(station: StationId, total: u64) -> StationSnapshot {
        StationSnapshot {
            station_id: station,
            aggregates: vec![SnapshotAggregate {
                list_id: Some(ListId(7)),
                candidate_id: None,
                vote_count: total,
                list_name: Some("List Seven".into()),
                candidate_name: None,
            }],
            summary: SnapshotSummary {
                total_ballots_entered: total,
                valid_list_votes: total,
                valid_preferential_votes: 0,
                white_papers: 0,
                cancelled_papers: 0,
            },
            refreshed_at: 0,
        }
    }

    #[test]
    fn test_put_get() {
        let cache = SnapshotCache::new(Duration::from_secs(60));
        let station = StationId(1);
        cache.put(snapshot(station, 3));

        let got = cache.get(station).unwrap();
        assert_eq!(got.summary.total_ballots_entered, 3);
        assert!(cache.get(StationId(2)).is_none());
    }

    #[test]
    fn test_overwrite_replaces() {
        let cache = SnapshotCache::new(Duration::from_secs(60));
        let station = StationId(1);
        cache.put(snapshot(station, 3));
        cache.put(snapshot(station, 4));

        assert_eq!(cache.get(station).unwrap().summary.total_ballots_entered, 4);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expiry_evicts() {
        let cache = SnapshotCache::new(Duration::from_millis(10));
        let station = StationId(1);
        cache.put(snapshot(station, 3));

        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get(station).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = SnapshotCache::new(Duration::from_secs(60));
        let station = StationId(1);
        cache.put(snapshot(station, 3));
        cache.invalidate(station);
        assert!(cache.get(station).is_none());
    }

    #[test]
    fn test_snapshot_serializes_without_null_names() {
        let snap = snapshot(StationId(1), 1);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("list_name"));
        assert!(!json.contains("candidate_name"));
    }
}
