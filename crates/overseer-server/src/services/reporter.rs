//! Reporter - moving results and events up the delegation tree
//!
//! A node with a parent relays every report unchanged. The root settles it:
//! results are applied to every match the stream settles (inverting the
//! winner for swapped links) and the record is then deleted; events are
//! fanned out to every match with the participant names filled in from that
//! match's perspective.

use async_trait::async_trait;
use overseer_core::client::AppClient;
use overseer_core::extractor::FailurePolicy;
use overseer_core::types::{
    LinkedMatch, MatchResult, ReportRequest, SessionKey, StreamReport, Verdict, Winner,
};
use overseer_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::services::delegation;
use crate::state::AppState;

/// Destination of settled match results (the external application)
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn match_result(&self, match_ref: &str, result: &MatchResult) -> Result<()>;

    async fn match_event(&self, match_ref: &str, text: &str) -> Result<()>;
}

/// Delivers results to the application over HTTP
pub struct HttpSink {
    client: AppClient,
}

impl HttpSink {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: AppClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl ResultSink for HttpSink {
    async fn match_result(&self, match_ref: &str, result: &MatchResult) -> Result<()> {
        self.client.post_result(match_ref, result).await
    }

    async fn match_event(&self, match_ref: &str, text: &str) -> Result<()> {
        self.client.post_event(match_ref, text).await
    }
}

/// Used when no application is configured: results only end up in the log
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn match_result(&self, match_ref: &str, result: &MatchResult) -> Result<()> {
        info!(
            match_ref,
            winner = result.winner.as_str(),
            strong = result.strong,
            details = %result.details,
            "Match result"
        );
        Ok(())
    }

    async fn match_event(&self, match_ref: &str, text: &str) -> Result<()> {
        info!(match_ref, text, "Match event");
        Ok(())
    }
}

/// Send a report one step up, or settle it when this node is the root.
pub async fn report(state: &Arc<AppState>, key: &SessionKey, report: StreamReport) -> Result<()> {
    match &state.parent {
        Some(parent) => {
            debug!(key = %key, parent = parent.name(), "Relaying report to parent");
            parent
                .report(&key.handle, &key.game_kind, &ReportRequest::from(&report))
                .await
        }
        None => settle(state, key, report).await,
    }
}

/// Apply a report to the matches of a root-level record.
pub async fn settle(state: &Arc<AppState>, key: &SessionKey, report: StreamReport) -> Result<()> {
    let session = state
        .db
        .get_session(&key.handle, &key.game_kind)?
        .ok_or_else(|| Error::not_found(&key.handle, &key.game_kind))?;

    match report {
        StreamReport::Event(text) => {
            for link in session.matches() {
                let (a, b) = session.participants_for(&link);
                let text = text
                    .replace("{participant_a}", a)
                    .replace("{participant_b}", b);
                state.sink.match_event(&link.match_ref, &text).await?;
            }
        }
        StreamReport::Result(verdict) => {
            let policy = state
                .registry
                .get(&key.game_kind)
                .map(|kind| kind.on_failure)
                .unwrap_or_default();

            for link in session.matches() {
                let Some(result) = match_result(&verdict, &link, policy) else {
                    info!(key = %key, match_ref = %link.match_ref, "Failed stream left for the application to settle");
                    continue;
                };
                state.sink.match_result(&link.match_ref, &result).await?;
                info!(
                    key = %key,
                    match_ref = %link.match_ref,
                    winner = result.winner.as_str(),
                    "Match settled"
                );
            }

            // the record has served its purpose once every match is settled
            let state = Arc::clone(state);
            let key = key.clone();
            tokio::spawn(async move {
                if let Err(e) = delegation::delete_watch(&state, &key).await {
                    warn!(key = %key, error = %e, "Failed to delete settled stream");
                }
            });
        }
    }
    Ok(())
}

/// Result to record on one match, or `None` when the match is left alone.
fn match_result(verdict: &Verdict, link: &LinkedMatch, policy: FailurePolicy) -> Option<MatchResult> {
    let winner = match verdict.winner {
        Winner::Failed => match policy {
            FailurePolicy::Draw => Winner::Draw,
            FailurePolicy::Skip => return None,
        },
        winner if link.inverted => winner.inverted(),
        winner => winner,
    };
    Some(MatchResult {
        winner,
        strong: verdict.strong,
        details: verdict.details.clone(),
        timestamp: verdict.observed_at.timestamp(),
    })
}

/// Report a concluded verdict; on failure keep retrying in the background.
pub async fn deliver_result(state: &Arc<AppState>, key: &SessionKey, verdict: Verdict) {
    match report(state, key, StreamReport::Result(verdict.clone())).await {
        Ok(()) => debug!(key = %key, "Result delivered"),
        Err(e) => {
            warn!(key = %key, error = %e, "Result undelivered, keeping record for retry");
            spawn_redelivery(Arc::clone(state), key.clone(), verdict);
        }
    }
}

/// Retry an undelivered result while its record still exists.
pub fn spawn_redelivery(state: Arc<AppState>, key: SessionKey, verdict: Verdict) -> JoinHandle<()> {
    tokio::spawn(async move {
        for attempt in 1..=state.reporting.max_attempts {
            tokio::time::sleep(state.reporting.retry_delay).await;

            match state.db.get_session(&key.handle, &key.game_kind) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(key = %key, "Record gone, result no longer needs delivery");
                    return;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read record before redelivery");
                    continue;
                }
            }

            match report(&state, &key, StreamReport::Result(verdict.clone())).await {
                Ok(()) => {
                    info!(key = %key, attempt, "Result delivered after retry");
                    return;
                }
                Err(e) => warn!(key = %key, attempt, error = %e, "Result still undelivered"),
            }
        }
        error!(key = %key, "Giving up on result delivery, record kept");
    })
}

/// Forward an event, logging instead of failing.
pub async fn deliver_event(state: &Arc<AppState>, key: &SessionKey, text: &str) {
    if let Err(e) = report(state, key, StreamReport::Event(text.to_string())).await {
        warn!(key = %key, error = %e, event = text, "Event undelivered");
    }
}
