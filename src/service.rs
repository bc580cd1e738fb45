//! Composition root for the tally pipeline
//!
//! Wires stores, lock service, cache, broadcaster, coordinator, work queue,
//! and ingestion handler into one handle. Must be started inside a tokio
//! runtime; the work queue spawns its workers on construction.

use std::sync::Arc;

use tracing::info;

use crate::ballot::{BallotData, EntryId, OperatorId, StationId};
use crate::cache::{SnapshotCache, StationSnapshot};
use crate::config::TallyConfig;
use crate::coordinator::Coordinator;
use crate::ingest::{IngestionHandler, SubmitError};
use crate::lock::StationLockService;
use crate::metrics::TallyMetrics;
use crate::notify::{Broadcaster, TallyEvent};
use crate::queue::{QueueError, WorkQueue};
use crate::roster::{Roster, StationScope};
use crate::store::{MemoryStore, StationAggregate, StationSummary, StoreError, TallyStore};

pub struct TallyService {
    handler: IngestionHandler,
    store: Arc<dyn TallyStore>,
    cache: Arc<SnapshotCache>,
    broadcaster: Arc<Broadcaster>,
    roster: Arc<Roster>,
    metrics: Arc<TallyMetrics>,
    queue: WorkQueue,
}

impl TallyService {
    /// Start the pipeline over an in-memory store.
    pub fn start(config: TallyConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), config)
    }

    /// Start the pipeline over a caller-provided store backend.
    pub fn with_store(store: Arc<dyn TallyStore>, config: TallyConfig) -> Self {
        let metrics = Arc::new(TallyMetrics::new());
        let broadcaster = Arc::new(Broadcaster::new(config.channel_capacity));
        let roster = Arc::new(Roster::new());
        let cache = Arc::new(SnapshotCache::new(config.cache_ttl));
        let locks = StationLockService::new(config.lock_config());

        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&store),
            locks,
            Arc::clone(&cache),
            Arc::clone(&broadcaster),
            Arc::clone(&roster),
            Arc::clone(&metrics),
        ));
        let queue = WorkQueue::start(coordinator, config.clone(), Arc::clone(&metrics));
        let handler = IngestionHandler::new(
            Arc::clone(&store),
            Arc::clone(&roster),
            Arc::clone(&broadcaster),
            queue.handle(),
            Arc::clone(&metrics),
            config,
        );

        info!("tally service started");
        Self {
            handler,
            store,
            cache,
            broadcaster,
            roster,
            metrics,
            queue,
        }
    }

    /// Register a station's electoral scope.
    pub fn register_station(&self, station: StationId, scope: StationScope) {
        self.roster.register(station, scope);
    }

    /// Submit one ballot entry for a station.
    pub fn submit(
        &self,
        station: StationId,
        entered_by: OperatorId,
        data: BallotData,
        source_ip: Option<String>,
    ) -> Result<EntryId, SubmitError> {
        self.handler.submit(station, entered_by, data, source_ip)
    }

    /// Manually trigger an immediate recompute for a station.
    pub fn trigger_recompute(&self, station: StationId) -> Result<(), QueueError> {
        self.queue.handle().submit(station)
    }

    /// Cached display-ready snapshot, if fresh. A miss means the caller
    /// should read the authoritative stores instead.
    pub fn snapshot(&self, station: StationId) -> Option<StationSnapshot> {
        self.cache.get(station)
    }

    /// Committed aggregate rows for a station.
    pub fn aggregates(&self, station: StationId) -> Result<Vec<StationAggregate>, StoreError> {
        self.store.aggregates(station)
    }

    /// Committed summary row for a station.
    pub fn summary(&self, station: StationId) -> Result<Option<StationSummary>, StoreError> {
        self.store.summary(station)
    }

    /// Subscribe to one station's events.
    pub fn subscribe_station(
        &self,
        station: StationId,
    ) -> tokio::sync::broadcast::Receiver<TallyEvent> {
        self.broadcaster.subscribe_station(station)
    }

    /// Subscribe to all stations' events.
    pub fn subscribe_all(&self) -> tokio::sync::broadcast::Receiver<TallyEvent> {
        self.broadcaster.subscribe_all()
    }

    pub fn metrics(&self) -> &TallyMetrics {
        &self.metrics
    }

    /// Drain pending recompute tasks and stop the workers.
    pub async fn shutdown(self) {
        self.queue.shutdown().await;
        info!("tally service stopped");
    }
}
