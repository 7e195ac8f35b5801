// src/transition.rs

use crate::models::poll::{PollOutcome, RecordUpdate, TransitionEvent, TransitionKind};
use crate::models::server::ServerRecord;

/// Compare a poll against the server's prior record.
///
/// A server missing from the cache counts as offline with an empty streak,
/// so its first successful poll reports `WentOnline`.
pub fn detect(prior: Option<&ServerRecord>, outcome: &PollOutcome) -> (RecordUpdate, TransitionEvent) {
    let was_online = prior.map_or(false, |r| r.last_known_online);
    let prior_streak = prior.map_or(0, |r| r.offline_streak);

    match &outcome.result {
        Ok(observation) => {
            let kind = if was_online {
                TransitionKind::Unchanged
            } else {
                TransitionKind::WentOnline
            };
            let update = RecordUpdate {
                server_id: outcome.server_id,
                last_known_online: true,
                offline_streak: 0,
                server_snapshot: Some(observation.server.clone()),
                players_snapshot: Some(observation.players.clone()),
            };
            let event = TransitionEvent {
                server_id: outcome.server_id,
                kind,
                snapshot: Some(observation.server.clone()),
                offline_streak: 0,
            };
            (update, event)
        }
        Err(_) => {
            let streak = prior_streak.saturating_add(1);
            let kind = if was_online {
                TransitionKind::WentOffline
            } else {
                TransitionKind::Unchanged
            };
            let update = RecordUpdate {
                server_id: outcome.server_id,
                last_known_online: false,
                offline_streak: streak,
                server_snapshot: None,
                players_snapshot: None,
            };
            let event = TransitionEvent {
                server_id: outcome.server_id,
                kind,
                snapshot: prior.and_then(|r| r.server_snapshot.clone()),
                offline_streak: streak,
            };
            (update, event)
        }
    }
}
