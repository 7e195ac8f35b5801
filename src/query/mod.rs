// src/query/mod.rs

pub mod a2s;

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::models::poll::{FailureKind, Observation, PollOutcome};
use crate::models::server::{PlayerEntry, PlayersSnapshot, ServerId, ServerSnapshot};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed reply: {0}")]
    Protocol(String),

    #[error("{0}")]
    Unexpected(String),
}

impl QueryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) => FailureKind::Unreachable,
            Self::Io(e) => match e.kind() {
                io::ErrorKind::PermissionDenied | io::ErrorKind::OutOfMemory => {
                    FailureKind::Unexpected
                }
                _ => FailureKind::Unreachable,
            },
            Self::Protocol(_) => FailureKind::Protocol,
            Self::Unexpected(_) => FailureKind::Unexpected,
        }
    }
}

#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn query_state(&self, address: &str, timeout: Duration) -> Result<ServerSnapshot, QueryError>;

    async fn query_roster(&self, address: &str, timeout: Duration) -> Result<Vec<PlayerEntry>, QueryError>;
}

async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, QueryError>
where
    F: Future<Output = Result<T, QueryError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Timeout(timeout)),
    }
}

/// Poll one server: state and roster concurrently, both must succeed.
///
/// A partial answer is a failed poll. When both queries fail the most
/// severe failure kind wins.
pub async fn execute(
    client: &dyn QueryClient,
    server_id: ServerId,
    address: &str,
    timeout: Duration,
) -> PollOutcome {
    let (state, roster) = tokio::join!(
        bounded(timeout, client.query_state(address, timeout)),
        bounded(timeout, client.query_roster(address, timeout)),
    );

    match (state, roster) {
        (Ok(server), Ok(players)) => PollOutcome::success(
            server_id,
            Observation {
                server,
                players: PlayersSnapshot::new(players),
            },
        ),
        (state, roster) => {
            let errors: Vec<(&str, QueryError)> = [("state", state.err()), ("roster", roster.err())]
                .into_iter()
                .filter_map(|(which, e)| e.map(|e| (which, e)))
                .collect();
            let kind = errors
                .iter()
                .map(|(_, e)| e.kind())
                .max()
                .unwrap_or(FailureKind::Unexpected);
            let detail = errors
                .iter()
                .map(|(which, e)| format!("{} query: {}", which, e))
                .collect::<Vec<_>>()
                .join("; ");
            PollOutcome::failure(server_id, kind, detail)
        }
    }
}
