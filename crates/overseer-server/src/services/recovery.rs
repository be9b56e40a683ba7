//! Recovery Manager - reconciling the registry with reality at startup
//!
//! Waiting and watching sessions owned by this node are resumed with a fresh
//! capture process. Concluded and failed sessions that were never deleted
//! are discarded, unless redelivery is enabled, in which case their stored
//! verdict is reported again. Forwarding pointers are left alone; the child
//! recovers its own sessions.

use overseer_core::types::{LifecycleState, Verdict};
use overseer_core::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::services::{reporter, watcher};
use crate::state::AppState;

/// What recovery did with the persisted sessions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoverySummary {
    pub resumed: usize,
    pub discarded: usize,
    pub redelivered: usize,
    pub failed: usize,
}

/// Resume or discard every locally owned session.
///
/// Must run inside the runtime, before the node starts serving requests.
pub fn recover(state: &Arc<AppState>) -> Result<RecoverySummary> {
    let mut summary = RecoverySummary::default();

    for session in state.db.list_local_sessions()? {
        let key = session.key();

        if session.state.is_active() {
            let Some(kind) = state.registry.get(&session.game_kind) else {
                warn!(key = %key, "Game kind is no longer configured, failing stream");
                let verdict = Verdict::failure(format!(
                    "Game kind {} is no longer supported",
                    session.game_kind
                ));
                state.db.record_verdict(&key, LifecycleState::Failed, &verdict)?;
                let state = Arc::clone(state);
                tokio::spawn(async move {
                    reporter::deliver_result(&state, &key, verdict).await;
                });
                summary.failed += 1;
                continue;
            };

            match state.pool.reserve_unbounded(key.clone()) {
                Ok(slot) => {
                    info!(key = %key, state = session.state.as_str(), "Resuming stream");
                    watcher::spawn_watch(Arc::clone(state), session, kind, slot);
                    summary.resumed += 1;
                }
                Err(e) => warn!(key = %key, error = %e, "Stream not resumed"),
            }
            continue;
        }

        match session.verdict {
            Some(verdict) if state.config.recovery.redeliver_results => {
                info!(key = %key, "Redelivering stored result");
                let state = Arc::clone(state);
                tokio::spawn(async move {
                    reporter::deliver_result(&state, &key, verdict).await;
                });
                summary.redelivered += 1;
            }
            _ => {
                info!(key = %key, state = session.state.as_str(), "Discarding resolved stream");
                state.db.delete_session(&key)?;
                summary.discarded += 1;
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{insert_session, test_state, RecordingSink};
    use overseer_core::types::Winner;
    use std::time::Duration;

    fn concluded(state: &Arc<AppState>, handle: &str, match_ref: &str) {
        let session = insert_session(state, handle, match_ref, "Alice", "Bob");
        let verdict = Verdict {
            winner: Winner::ParticipantA,
            strong: true,
            details: "2 - 0".to_string(),
            observed_at: chrono::Utc::now(),
        };
        state
            .db
            .record_verdict(&session.key(), LifecycleState::Concluded, &verdict)
            .unwrap();
    }

    #[tokio::test]
    async fn test_watching_session_is_resumed_once() {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(Arc::clone(&sink), |c| {
            c.game_kinds.get_mut("test").unwrap().command = "printf 'Done b\\n'".to_string();
        });
        let session = insert_session(&state, "streamer", "10", "Alice", "Bob");
        state
            .db
            .update_state(&session.key(), LifecycleState::Watching)
            .unwrap();

        let summary = recover(&state).unwrap();
        assert_eq!(summary.resumed, 1);
        // a second pass while the task runs spawns nothing new
        let again = recover(&state).unwrap();
        assert_eq!(again.resumed, 0);

        assert!(state.pool.wait_idle(Duration::from_secs(5)).await);
        for _ in 0..100 {
            if !sink.results().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let results = sink.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.winner, Winner::ParticipantB);
    }

    #[tokio::test]
    async fn test_resolved_sessions_are_discarded() {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(Arc::clone(&sink), |_| {});
        concluded(&state, "done", "10");

        let summary = recover(&state).unwrap();
        assert_eq!(summary.discarded, 1);
        assert!(state.db.get_session("done", "test").unwrap().is_none());
        assert!(sink.results().is_empty());
    }

    #[tokio::test]
    async fn test_resolved_sessions_are_redelivered_when_enabled() {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(Arc::clone(&sink), |c| c.recovery.redeliver_results = true);
        concluded(&state, "done", "10");

        let summary = recover(&state).unwrap();
        assert_eq!(summary.redelivered, 1);

        for _ in 0..100 {
            if !sink.results().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let results = sink.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "10");
        assert_eq!(results[0].1.winner, Winner::ParticipantA);
    }

    #[tokio::test]
    async fn test_forwarding_pointers_are_kept() {
        let state = test_state(Arc::new(RecordingSink::default()), |_| {});
        let mut session = insert_session(&state, "remote", "10", "Alice", "Bob");
        state.db.delete_session(&session.key()).unwrap();
        session.owner = Some("slave1".to_string());
        state.db.insert_session(&session).unwrap();

        let summary = recover(&state).unwrap();
        assert_eq!(summary, RecoverySummary::default());
        assert!(state.db.get_session("remote", "test").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unconfigured_kind_fails_stream() {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(Arc::clone(&sink), |_| {});
        let mut session = insert_session(&state, "old", "10", "Alice", "Bob");
        state.db.delete_session(&session.key()).unwrap();
        session.game_kind = "retired".to_string();
        state.db.insert_session(&session).unwrap();

        let summary = recover(&state).unwrap();
        assert_eq!(summary.failed, 1);
        let record = state.db.get_session("old", "retired").unwrap();
        // either still failed or already settled and deleted
        assert!(record.map_or(true, |r| r.state == LifecycleState::Failed));
    }
}
