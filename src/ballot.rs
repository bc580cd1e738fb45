//! Ballot domain types for the tally pipeline
//!
//! Defines the ballot entry record (one row per physical ballot decision),
//! the ballot category enum, and the typed identifiers used across the
//! crate. Entry and operator IDs use UUID v7 for time-sortable ordering;
//! station, list, and candidate IDs are small integers assigned by the
//! reference-data subsystem.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a ballot entry.
///
/// Uses UUID v7 so entries sort chronologically by ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a data-entry operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorId(Uuid);

impl OperatorId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperatorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a polling station.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StationId(pub u64);

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "station-{}", self.0)
    }
}

/// Identifier for an electoral list.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ListId(pub u64);

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "list-{}", self.0)
    }
}

/// Identifier for a candidate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CandidateId(pub u64);

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "candidate-{}", self.0)
    }
}

/// Category of a recorded ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BallotType {
    /// A vote for a list as a whole.
    ValidList,
    /// A preferential vote: counts for the list and, when present, the
    /// chosen candidate within it.
    ValidPreferential,
    /// A blank (white) paper.
    White,
    /// A spoiled/cancelled paper.
    Cancelled,
}

impl BallotType {
    /// String label used in logs and audit actions.
    pub fn label(&self) -> &'static str {
        match self {
            BallotType::ValidList => "valid_list",
            BallotType::ValidPreferential => "valid_preferential",
            BallotType::White => "white",
            BallotType::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BallotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Shape violations rejected before anything is persisted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BallotError {
    #[error("valid_list ballot requires a list reference")]
    MissingList,

    #[error("valid_preferential ballot requires a list and/or candidate reference")]
    MissingPreference,

    #[error("{ballot_type} ballot must not carry list/candidate references")]
    UnexpectedReference { ballot_type: BallotType },

    #[error("cancellation reason only allowed on cancelled ballots")]
    UnexpectedCancellationReason,
}

/// The decision content of one ballot, as submitted by an operator.
///
/// This is the inbound payload; the handler stamps identity, actor, and
/// timestamps to produce a [`BallotEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotData {
    pub ballot_type: BallotType,
    pub list_id: Option<ListId>,
    pub candidate_id: Option<CandidateId>,
    pub cancellation_reason: Option<String>,
    /// Opaque key/value map carried through to the stored entry.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Client-supplied dedup token for ambiguous-failure retries.
    #[serde(default)]
    pub idempotency_token: Option<String>,
}

impl BallotData {
    /// Convenience constructor for a list vote.
    pub fn valid_list(list_id: ListId) -> Self {
        Self {
            ballot_type: BallotType::ValidList,
            list_id: Some(list_id),
            candidate_id: None,
            cancellation_reason: None,
            metadata: BTreeMap::new(),
            idempotency_token: None,
        }
    }

    /// Convenience constructor for a preferential vote.
    pub fn valid_preferential(list_id: Option<ListId>, candidate_id: Option<CandidateId>) -> Self {
        Self {
            ballot_type: BallotType::ValidPreferential,
            list_id,
            candidate_id,
            cancellation_reason: None,
            metadata: BTreeMap::new(),
            idempotency_token: None,
        }
    }

    /// Convenience constructor for a white paper.
    pub fn white() -> Self {
        Self {
            ballot_type: BallotType::White,
            list_id: None,
            candidate_id: None,
            cancellation_reason: None,
            metadata: BTreeMap::new(),
            idempotency_token: None,
        }
    }

    /// Convenience constructor for a cancelled paper.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            ballot_type: BallotType::Cancelled,
            list_id: None,
            candidate_id: None,
            cancellation_reason: Some(reason.into()),
            metadata: BTreeMap::new(),
            idempotency_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.idempotency_token = Some(token.into());
        self
    }

    /// Enforce the per-category shape invariant.
    ///
    /// Exactly one reference shape is meaningful per ballot type:
    /// valid_list ⇒ list set; valid_preferential ⇒ list and/or candidate;
    /// white/cancelled ⇒ neither.
    pub fn validate_shape(&self) -> Result<(), BallotError> {
        match self.ballot_type {
            BallotType::ValidList => {
                if self.list_id.is_none() {
                    return Err(BallotError::MissingList);
                }
            }
            BallotType::ValidPreferential => {
                if self.list_id.is_none() && self.candidate_id.is_none() {
                    return Err(BallotError::MissingPreference);
                }
            }
            BallotType::White | BallotType::Cancelled => {
                if self.list_id.is_some() || self.candidate_id.is_some() {
                    return Err(BallotError::UnexpectedReference {
                        ballot_type: self.ballot_type,
                    });
                }
            }
        }
        if self.cancellation_reason.is_some() && self.ballot_type != BallotType::Cancelled {
            return Err(BallotError::UnexpectedCancellationReason);
        }
        Ok(())
    }
}

/// One physical ballot's recorded decision.
///
/// Immutable once created; corrections are modeled as new entries plus the
/// audit trail, never in-place edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotEntry {
    pub id: EntryId,
    pub station_id: StationId,
    pub ballot_type: BallotType,
    pub list_id: Option<ListId>,
    pub candidate_id: Option<CandidateId>,
    pub cancellation_reason: Option<String>,
    pub entered_by: OperatorId,
    /// Unix nanoseconds.
    pub entered_at: i64,
    pub source_ip: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_token: Option<String>,
}

/// Audit trail row persisted in the same atomic unit as its entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub entry_id: EntryId,
    pub station_id: StationId,
    pub actor: OperatorId,
    /// Action label, e.g. `ballot_entry.created:valid_list`.
    pub action: String,
    pub source_ip: Option<String>,
    /// Unix nanoseconds.
    pub recorded_at: i64,
}

/// Current unix-nanosecond timestamp.
pub fn now_nanos() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
