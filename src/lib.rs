//! Station Tally Service
//!
//! Tallies paper ballots entered by on-site operators into per-station,
//! per-list, and per-candidate vote totals and propagates them to
//! observers in near real time:
//! - Atomic ballot entry + audit persistence
//! - Lock-coordinated, debounced recomputation of station aggregates
//! - Display-ready snapshot caching with bounded TTL
//! - Per-station and global notification fan-out
//! - Worker pool with hard timeouts and bounded retry/backoff
//!
//! # Architecture
//!
//! ```text
//!      submit(entry)
//!           │
//!      ┌────▼─────┐   EntryCreated
//!      │ Ingest   ├────────────────► Broadcaster
//!      └────┬─────┘
//!           │ debounced trigger
//!      ┌────▼─────┐
//!      │WorkQueue │  ← timeout, retry/backoff, contention re-enqueue
//!      └────┬─────┘
//!      ┌────▼─────────┐
//!      │ Coordinator  │  ← per-station lease lock
//!      └┬────┬───────┬┘
//!       │    │       │ StationUpdated
//!  ┌────▼┐ ┌─▼────┐ ┌▼──────────┐
//!  │Store│ │Cache │ │Broadcaster│
//!  └─────┘ └──────┘ └───────────┘
//! ```
//!
//! Recomputation always reads the full current entry set, so concurrent or
//! reordered recompute runs for a station converge to the same totals; the
//! per-station lease lock keeps their write transactions from interleaving.

pub mod ballot;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod ingest;
pub mod lock;
pub mod metrics;
pub mod notify;
pub mod queue;
pub mod roster;
pub mod service;
pub mod store;

pub use ballot::{BallotData, BallotEntry, BallotType, CandidateId, EntryId, ListId, OperatorId, StationId};
pub use cache::StationSnapshot;
pub use config::TallyConfig;
pub use ingest::SubmitError;
pub use notify::TallyEvent;
pub use roster::StationScope;
pub use service::TallyService;
pub use store::{StationAggregate, StationSummary};

/// Library version.
pub const SERVICE_VERSION: &str = "0.1.0";
