//! Electoral scope reference data
//!
//! The lists and candidates a station may receive votes for, with display
//! names for snapshot enrichment. Populated from the reference-data
//! subsystem at startup; the core only reads it.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::ballot::{CandidateId, ListId, StationId};

/// Lists and candidates in scope for one station.
#[derive(Debug, Clone, Default)]
pub struct StationScope {
    lists: BTreeMap<ListId, String>,
    candidates: BTreeMap<CandidateId, String>,
}

impl StationScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_list(mut self, id: ListId, name: impl Into<String>) -> Self {
        self.lists.insert(id, name.into());
        self
    }

    pub fn with_candidate(mut self, id: CandidateId, name: impl Into<String>) -> Self {
        self.candidates.insert(id, name.into());
        self
    }

    pub fn has_list(&self, id: ListId) -> bool {
        self.lists.contains_key(&id)
    }

    pub fn has_candidate(&self, id: CandidateId) -> bool {
        self.candidates.contains_key(&id)
    }

    pub fn list_name(&self, id: ListId) -> Option<String> {
        self.lists.get(&id).cloned()
    }

    pub fn candidate_name(&self, id: CandidateId) -> Option<String> {
        self.candidates.get(&id).cloned()
    }
}

/// Read-mostly registry of station scopes.
#[derive(Debug, Default)]
pub struct Roster {
    stations: RwLock<HashMap<StationId, StationScope>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a station's scope.
    pub fn register(&self, station: StationId, scope: StationScope) {
        let mut stations = self.stations.write().unwrap_or_else(|e| e.into_inner());
        stations.insert(station, scope);
    }

    pub fn scope(&self, station: StationId) -> Option<StationScope> {
        let stations = self.stations.read().unwrap_or_else(|e| e.into_inner());
        stations.get(&station).cloned()
    }

    pub fn knows(&self, station: StationId) -> bool {
        let stations = self.stations.read().unwrap_or_else(|e| e.into_inner());
        stations.contains_key(&station)
    }
}
