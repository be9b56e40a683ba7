//! Watch task - one supervised capture process per locally owned stream
//!
//! An attempt spawns the capture command, classifies every output line and
//! feeds the consensus engine until it concludes. An offline stream ends the
//! attempt; the task waits and retries until the cumulative offline wait
//! runs out. Every state change is committed to the registry before the
//! parent hears about it.

use overseer_core::capture::CaptureProcess;
use overseer_core::consensus::{ConsensusEngine, Step};
use overseer_core::extractor::GameKind;
use overseer_core::types::{LifecycleState, Observation, SessionKey, Verdict, WatchSession, Winner};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::services::pool::Slot;
use crate::services::reporter;
use crate::state::AppState;

const OFFLINE_TIMEOUT_DETAILS: &str = "Stream was offline for too long";

/// How one attempt ended
#[derive(Debug)]
enum Attempt {
    Concluded(Verdict),
    Offline,
}

/// Start watching `session` in the background.
///
/// The slot is held until the task ends, however it ends.
pub fn spawn_watch(
    state: Arc<AppState>,
    session: WatchSession,
    kind: Arc<GameKind>,
    slot: Slot,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = slot.token();
        let key = slot.key().clone();
        let mut task = WatchTask::new(state, session, kind);

        tokio::select! {
            _ = cancel.cancelled() => info!(key = %key, "Watch cancelled"),
            _ = task.run() => {}
        }
        drop(slot);
    })
}

struct WatchTask {
    state: Arc<AppState>,
    session: WatchSession,
    key: SessionKey,
    kind: Arc<GameKind>,
    /// Event keys already forwarded for this session
    sent_events: HashSet<String>,
}

impl WatchTask {
    fn new(state: Arc<AppState>, session: WatchSession, kind: Arc<GameKind>) -> Self {
        Self {
            state,
            key: session.key(),
            session,
            kind,
            sent_events: HashSet::new(),
        }
    }

    async fn run(&mut self) {
        let mut offline_waited = Duration::ZERO;

        loop {
            self.set_state(LifecycleState::Watching);

            match self.attempt().await {
                Attempt::Concluded(verdict) => {
                    self.conclude(verdict).await;
                    return;
                }
                Attempt::Offline if offline_waited >= self.state.watch.offline_max_wait => {
                    warn!(key = %self.key, waited = ?offline_waited, "Stream was offline for too long, aborting");
                    self.event(None, "Stream was offline for too long, aborting")
                        .await;
                    self.conclude(Verdict::failure(OFFLINE_TIMEOUT_DETAILS)).await;
                    return;
                }
                Attempt::Offline => {
                    let delay = self.state.watch.offline_retry_delay;
                    info!(key = %self.key, retry_in = ?delay, "Stream is offline, waiting");
                    self.set_state(LifecycleState::Waiting);
                    self.event(Some("offline_wait"), "Stream is offline, waiting")
                        .await;
                    tokio::time::sleep(delay).await;
                    offline_waited += delay;
                }
            }
        }
    }

    async fn attempt(&mut self) -> Attempt {
        let command = self.kind.command_for(&self.session.handle);
        let grace = self.state.watch.kill_grace;
        let mut process = match CaptureProcess::spawn(&command, self.kind.workdir.as_deref(), grace) {
            Ok(process) => process,
            Err(e) => {
                error!(key = %self.key, error = %e, "Failed to start capture process");
                return Attempt::Concluded(Verdict::no_result());
            }
        };
        self.event(None, "Stream running").await;

        let mut extractor = self.kind.extractor_for(&self.session);
        let mut engine = ConsensusEngine::new(self.kind.consensus.clone());

        let outcome = loop {
            let deadline = engine.deadline();
            let line = tokio::select! {
                line = process.next_line() => line,
                _ = sleep_until(deadline) => match engine.poll_deadline(Instant::now()) {
                    Some(verdict) => break Attempt::Concluded(verdict),
                    None => continue,
                },
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!(key = %self.key, buffered = engine.buffered(), "Capture output closed");
                    break Attempt::Concluded(engine.finish());
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Failed to read capture output");
                    break Attempt::Concluded(engine.finish());
                }
            };

            let observation = match extractor.observe(&line) {
                Ok(observation) => observation,
                Err(e) => {
                    warn!(key = %self.key, error = %e, line = %line, "Error while classifying line");
                    Observation::none()
                }
            };
            debug!(key = %self.key, tag = ?observation.tag, strong = observation.strong, "Line classified");

            for event in extractor.drain_events() {
                self.event(Some(&event.key), &event.text).await;
            }

            match engine.observe(observation, Instant::now()) {
                Step::Continue => {}
                Step::Offline => break Attempt::Offline,
                Step::Concluded(verdict) => break Attempt::Concluded(verdict),
            }
        };

        process.terminate();
        outcome
    }

    async fn conclude(&mut self, verdict: Verdict) {
        let state = if verdict.winner == Winner::Failed || verdict.is_no_result() {
            LifecycleState::Failed
        } else {
            LifecycleState::Concluded
        };
        if let Err(e) = self.state.db.record_verdict(&self.key, state, &verdict) {
            error!(key = %self.key, error = %e, "Failed to record verdict");
        }
        if verdict.is_no_result() {
            self.event(None, "Stream finished but no results were retrieved")
                .await;
        }
        info!(
            key = %self.key,
            winner = verdict.winner.as_str(),
            strong = verdict.strong,
            details = %verdict.details,
            "Watch concluded"
        );

        reporter::deliver_result(&self.state, &self.key, verdict).await;
    }

    fn set_state(&self, state: LifecycleState) {
        match self.state.db.update_state(&self.key, state) {
            Ok(true) => {}
            Ok(false) => warn!(key = %self.key, state = state.as_str(), "Record vanished during watch"),
            Err(e) => error!(key = %self.key, error = %e, "Failed to update watch state"),
        }
    }

    /// Forward an event; keyed events go out at most once per session.
    async fn event(&mut self, key: Option<&str>, text: &str) {
        if let Some(key) = key {
            if !self.sent_events.insert(key.to_string()) {
                return;
            }
        }
        reporter::deliver_event(&self.state, &self.key, text).await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::reporter::ResultSink;
    use crate::testing::{insert_session, test_state, RecordingSink};
    use overseer_core::types::{LinkedMatch, MatchResult};

    async fn run_to_end(state: &Arc<AppState>, session: WatchSession) {
        let kind = state.registry.get(&session.game_kind).unwrap();
        let slot = state.pool.try_reserve(session.key()).unwrap();
        spawn_watch(Arc::clone(state), session, kind, slot)
            .await
            .unwrap();
    }

    async fn wait_for_delete(state: &Arc<AppState>, handle: &str) {
        for _ in 0..100 {
            if state.db.get_session(handle, "test").unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("record for {} was not deleted", handle);
    }

    #[tokio::test]
    async fn test_result_reaches_every_match() {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(Arc::clone(&sink), |c| {
            c.game_kinds.get_mut("test").unwrap().command = "printf 'noise\\nDone a\\n'".to_string();
        });
        let session = insert_session(&state, "streamer", "10", "Alice", "Bob");
        state
            .db
            .attach_linked_match(
                &session.key(),
                LinkedMatch {
                    match_ref: "20".to_string(),
                    inverted: true,
                },
            )
            .unwrap();
        let session = state.db.get_session("streamer", "test").unwrap().unwrap();

        run_to_end(&state, session).await;

        let results = sink.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "10");
        assert_eq!(results[0].1.winner, Winner::ParticipantA);
        assert!(results[0].1.strong);
        assert_eq!(results[1].0, "20");
        assert_eq!(results[1].1.winner, Winner::ParticipantB);

        assert!(sink.events().iter().any(|(_, text)| text == "Stream running"));
        assert!(state.pool.is_empty());
        wait_for_delete(&state, "streamer").await;
    }

    #[tokio::test]
    async fn test_silent_stream_is_a_weak_draw() {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(Arc::clone(&sink), |c| {
            c.game_kinds.get_mut("test").unwrap().command = "true".to_string();
        });
        let session = insert_session(&state, "quiet", "10", "Alice", "Bob");

        run_to_end(&state, session).await;

        let results = sink.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.winner, Winner::Draw);
        assert!(!results[0].1.strong);
        assert!(sink
            .events()
            .iter()
            .any(|(_, text)| text == "Stream finished but no results were retrieved"));
    }

    /// Remembers the stored lifecycle state each time an event arrives
    #[derive(Default)]
    struct SnapshotSink {
        state: std::sync::OnceLock<std::sync::Weak<AppState>>,
        seen: std::sync::Mutex<Vec<(String, Option<LifecycleState>)>>,
    }

    #[async_trait::async_trait]
    impl ResultSink for SnapshotSink {
        async fn match_result(&self, _: &str, _: &MatchResult) -> overseer_core::Result<()> {
            Ok(())
        }

        async fn match_event(&self, _: &str, text: &str) -> overseer_core::Result<()> {
            let stored = self
                .state
                .get()
                .and_then(|weak| weak.upgrade())
                .and_then(|state| state.db.get_session("quiet", "test").unwrap())
                .map(|session| session.state);
            self.seen.lock().unwrap().push((text.to_string(), stored));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_no_result_event_follows_stored_verdict() {
        let sink = Arc::new(SnapshotSink::default());
        let state = test_state(Arc::clone(&sink), |c| {
            c.game_kinds.get_mut("test").unwrap().command = "true".to_string();
        });
        sink.state.set(Arc::downgrade(&state)).unwrap();
        let session = insert_session(&state, "quiet", "10", "Alice", "Bob");

        run_to_end(&state, session).await;

        let seen = sink.seen.lock().unwrap().clone();
        let (_, stored) = seen
            .iter()
            .find(|(text, _)| text == "Stream finished but no results were retrieved")
            .unwrap();
        assert_eq!(*stored, Some(LifecycleState::Failed));
    }

    #[tokio::test]
    async fn test_quorum_concludes_before_output_ends() {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(Arc::clone(&sink), |c| {
            let kind = c.game_kinds.get_mut("test").unwrap();
            kind.command = "printf 'Weak a\\nWeak a\\nDone b\\nWeak a\\nWeak a\\n'; sleep 30".to_string();
            kind.quorum = 5;
        });
        let session = insert_session(&state, "noisy", "10", "Alice", "Bob");

        tokio::time::timeout(Duration::from_secs(10), run_to_end(&state, session))
            .await
            .unwrap();

        let results = sink.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.winner, Winner::ParticipantB);
        assert!(results[0].1.strong);
    }

    #[tokio::test]
    async fn test_time_window_closes_without_new_lines() {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(Arc::clone(&sink), |c| {
            let kind = c.game_kinds.get_mut("test").unwrap();
            kind.command = "printf 'Done d\\n'; sleep 30".to_string();
            kind.quorum = 0;
            kind.max_delta_secs = 1;
        });
        let session = insert_session(&state, "slow", "10", "Alice", "Bob");

        tokio::time::timeout(Duration::from_secs(10), run_to_end(&state, session))
            .await
            .unwrap();

        let results = sink.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.winner, Winner::Draw);
    }

    #[tokio::test]
    async fn test_offline_stream_fails_after_max_wait() {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(Arc::clone(&sink), |c| {
            c.game_kinds.get_mut("test").unwrap().command = "echo Offline".to_string();
        });
        let session = insert_session(&state, "gone", "10", "Alice", "Bob");

        tokio::time::timeout(Duration::from_secs(10), run_to_end(&state, session))
            .await
            .unwrap();

        // failed streams settle as draws under the default policy
        let results = sink.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.winner, Winner::Draw);
        assert_eq!(results[0].1.details, OFFLINE_TIMEOUT_DETAILS);

        let events = sink.events();
        let waits = events
            .iter()
            .filter(|(_, text)| text == "Stream is offline, waiting")
            .count();
        assert_eq!(waits, 1);
        let runs = events.iter().filter(|(_, text)| text == "Stream running").count();
        assert!(runs >= 2, "offline stream should be retried, ran {} times", runs);
        assert!(events
            .iter()
            .any(|(_, text)| text == "Stream was offline for too long, aborting"));
    }

    #[tokio::test]
    async fn test_classification_errors_do_not_abort() {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(Arc::clone(&sink), |c| {
            c.game_kinds.get_mut("test").unwrap().command = "printf 'Done x\\nDone b\\n'".to_string();
        });
        let session = insert_session(&state, "garbled", "10", "Alice", "Bob");

        run_to_end(&state, session).await;

        let results = sink.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.winner, Winner::ParticipantB);
    }

    #[tokio::test]
    async fn test_cancel_stops_watch_and_keeps_record() {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(Arc::clone(&sink), |_| {});
        let session = insert_session(&state, "forever", "10", "Alice", "Bob");
        let key = session.key();
        let kind = state.registry.get("test").unwrap();
        let slot = state.pool.try_reserve(key.clone()).unwrap();

        let handle = spawn_watch(Arc::clone(&state), session, kind, slot);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(state.pool.cancel(&key));
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(state.pool.is_empty());
        assert!(sink.results().is_empty());
        let record = state.db.get_session("forever", "test").unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Watching);
    }
}
