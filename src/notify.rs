//! Notification fan-out for tally events
//!
//! Publishes minimal events on a per-station channel and a global
//! "all stations" channel over `tokio::sync::broadcast`. Payloads carry
//! identifiers and timestamps only; subscribers pull full aggregate state
//! from the read cache or the stores, keeping fan-out cheap.
//!
//! Publish failures never affect already-committed tally state: a channel
//! with no subscribers or a lagging receiver is logged and skipped, and a
//! missed notification heals on the next recompute cycle.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::ballot::{BallotType, CandidateId, EntryId, ListId, StationId};

/// Events emitted by the tally pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TallyEvent {
    /// A ballot entry was persisted. Emitted synchronously after the
    /// entry+audit commit, for live UI echo.
    EntryCreated {
        station_id: StationId,
        entry_id: EntryId,
        ballot_type: BallotType,
        list_id: Option<ListId>,
        candidate_id: Option<CandidateId>,
        entered_at: i64,
    },
    /// A station's aggregates and summary were recomputed and committed.
    StationUpdated {
        station_id: StationId,
        updated_at: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
}

impl TallyEvent {
    pub fn station_id(&self) -> StationId {
        match self {
            TallyEvent::EntryCreated { station_id, .. } => *station_id,
            TallyEvent::StationUpdated { station_id, .. } => *station_id,
        }
    }

    /// Event type label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            TallyEvent::EntryCreated { .. } => "EntryCreated",
            TallyEvent::StationUpdated { .. } => "StationUpdated",
        }
    }
}

/// Fan-out hub with one global channel plus lazily created per-station
/// channels.
pub struct Broadcaster {
    global: broadcast::Sender<TallyEvent>,
    stations: Mutex<HashMap<StationId, broadcast::Sender<TallyEvent>>>,
    channel_capacity: usize,
}

impl Broadcaster {
    pub fn new(channel_capacity: usize) -> Self {
        let (global, _) = broadcast::channel(channel_capacity);
        Self {
            global,
            stations: Mutex::new(HashMap::new()),
            channel_capacity,
        }
    }

    /// Subscribe to every station's events.
    pub fn subscribe_all(&self) -> broadcast::Receiver<TallyEvent> {
        self.global.subscribe()
    }

    /// Subscribe to one station's events, creating its channel on first use.
    pub fn subscribe_station(&self, station: StationId) -> broadcast::Receiver<TallyEvent> {
        let mut stations = self.stations.lock().unwrap_or_else(|e| e.into_inner());
        stations
            .entry(station)
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }

    /// Publish to the station channel and the global channel.
    ///
    /// Returns the number of receivers reached. Zero receivers is not a
    /// failure; broadcast delivery is best-effort by design.
    pub fn publish(&self, event: TallyEvent) -> usize {
        let station = event.station_id();
        let mut reached = 0;

        {
            let stations = self.stations.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(sender) = stations.get(&station) {
                reached += sender.send(event.clone()).unwrap_or(0);
            }
        }
        reached += self.global.send(event.clone()).unwrap_or(0);

        debug!(
            station = %station,
            event = event.label(),
            receivers = reached,
            "event published"
        );
        reached
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}
