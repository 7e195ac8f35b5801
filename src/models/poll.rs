// src/models/poll.rs
use serde::Serialize;
use std::fmt;

use crate::models::server::{PlayersSnapshot, ServerId, ServerSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timed out, refused or unresolvable. Routine.
    Unreachable,
    /// The server answered with something we could not parse.
    Protocol,
    /// Anything else. Reported to the operator channel.
    Unexpected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable"),
            Self::Protocol => write!(f, "protocol error"),
            Self::Unexpected => write!(f, "unexpected error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub server: ServerSnapshot,
    pub players: PlayersSnapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl PollFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Result of polling a single server once.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub server_id: ServerId,
    pub result: Result<Observation, PollFailure>,
}

impl PollOutcome {
    pub fn success(server_id: ServerId, observation: Observation) -> Self {
        Self {
            server_id,
            result: Ok(observation),
        }
    }

    pub fn failure(server_id: ServerId, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            server_id,
            result: Err(PollFailure::new(kind, detail)),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.result.as_ref().err().map(|f| f.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    WentOnline,
    WentOffline,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEvent {
    pub server_id: ServerId,
    pub kind: TransitionKind,
    /// New snapshot after a success, last known one after a failure.
    pub snapshot: Option<ServerSnapshot>,
    pub offline_streak: u32,
}

/// Fields written back to the record store after a poll.
///
/// Snapshots are `Some` only after a successful poll; `None` leaves the
/// stored ones untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub server_id: ServerId,
    pub last_known_online: bool,
    pub offline_streak: u32,
    pub server_snapshot: Option<ServerSnapshot>,
    pub players_snapshot: Option<PlayersSnapshot>,
}
