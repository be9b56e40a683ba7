//! Shared types for overseer-core.
//!
//! These types are used by the consensus engine, the registry and the
//! peer client alike.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Tag carried by a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeTag {
    ParticipantA,
    ParticipantB,
    Draw,
    Offline,
    Abandon,
    Conclude,
    None,
}

impl OutcomeTag {
    /// Result-bearing tags, the only ones that enter the consensus buffer.
    pub fn winner(&self) -> Option<Winner> {
        match self {
            OutcomeTag::ParticipantA => Some(Winner::ParticipantA),
            OutcomeTag::ParticipantB => Some(Winner::ParticipantB),
            OutcomeTag::Draw => Some(Winner::Draw),
            _ => None,
        }
    }
}

/// Final outcome of a watch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    ParticipantA,
    ParticipantB,
    Draw,
    Failed,
}

impl Winner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Winner::ParticipantA => "participant_a",
            Winner::ParticipantB => "participant_b",
            Winner::Draw => "draw",
            Winner::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "participant_a" => Some(Winner::ParticipantA),
            "participant_b" => Some(Winner::ParticipantB),
            "draw" => Some(Winner::Draw),
            "failed" => Some(Winner::Failed),
            _ => None,
        }
    }

    /// Swap the two participants; draws and failures are symmetric.
    pub fn inverted(self) -> Self {
        match self {
            Winner::ParticipantA => Winner::ParticipantB,
            Winner::ParticipantB => Winner::ParticipantA,
            other => other,
        }
    }
}

/// One classified line of capture output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Observation {
    pub tag: OutcomeTag,
    pub strong: bool,
    pub details: String,
}

impl Observation {
    /// A line that carries no signal.
    pub fn none() -> Self {
        Self::signal(OutcomeTag::None)
    }

    /// A control tag without details (offline, abandon, conclude).
    pub fn signal(tag: OutcomeTag) -> Self {
        Self {
            tag,
            strong: false,
            details: String::new(),
        }
    }

    pub fn strong(tag: OutcomeTag, details: impl Into<String>) -> Self {
        Self {
            tag,
            strong: true,
            details: details.into(),
        }
    }

    pub fn weak(tag: OutcomeTag, details: impl Into<String>) -> Self {
        Self {
            tag,
            strong: false,
            details: details.into(),
        }
    }
}

/// Concluded result of one watch session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub winner: Winner,
    pub strong: bool,
    pub details: String,
    pub observed_at: DateTime<Utc>,
}

pub const NO_RESULT_DETAILS: &str =
    "Observer terminated without returning any result, no result retrieved";

impl Verdict {
    /// Verdict used when a stream produced no usable observation at all.
    pub fn no_result() -> Self {
        Self {
            winner: Winner::Draw,
            strong: false,
            details: NO_RESULT_DETAILS.to_string(),
            observed_at: Utc::now(),
        }
    }

    /// Permanent failure (offline for too long, internal error).
    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            winner: Winner::Failed,
            strong: true,
            details: details.into(),
            observed_at: Utc::now(),
        }
    }

    pub fn is_no_result(&self) -> bool {
        self.winner == Winner::Draw && !self.strong && self.details == NO_RESULT_DETAILS
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Watch Sessions
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a locally owned session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Waiting,
    Watching,
    Concluded,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Waiting => "waiting",
            LifecycleState::Watching => "watching",
            LifecycleState::Concluded => "concluded",
            LifecycleState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(LifecycleState::Waiting),
            "watching" => Some(LifecycleState::Watching),
            "concluded" => Some(LifecycleState::Concluded),
            "failed" => Some(LifecycleState::Failed),
            _ => None,
        }
    }

    /// Waiting and watching sessions still need a running task.
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Waiting | LifecycleState::Watching)
    }
}

/// Registry key: `(handle, game_kind)` is unique per node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub handle: String,
    pub game_kind: String,
}

impl SessionKey {
    pub fn new(handle: impl Into<String>, game_kind: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            game_kind: game_kind.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.handle, self.game_kind)
    }
}

/// Additional match settled by the same stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedMatch {
    pub match_ref: String,
    /// Winner must be inverted for this match.
    pub inverted: bool,
}

/// Durable record of one stream being watched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSession {
    pub handle: String,
    pub game_kind: String,
    /// Child node watching this stream; `None` means this node.
    pub owner: Option<String>,
    pub primary_match_ref: String,
    pub linked_matches: Vec<LinkedMatch>,
    pub participant_a: String,
    pub participant_b: String,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl WatchSession {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.handle, &self.game_kind)
    }

    /// Every match settled by this stream with its polarity, primary first.
    pub fn matches(&self) -> impl Iterator<Item = LinkedMatch> + '_ {
        std::iter::once(LinkedMatch {
            match_ref: self.primary_match_ref.clone(),
            inverted: false,
        })
        .chain(self.linked_matches.iter().cloned())
    }

    pub fn settles_match(&self, match_ref: &str) -> bool {
        self.matches().any(|m| m.match_ref == match_ref)
    }

    /// Decide the polarity of a new match requested with participants `a`/`b`.
    ///
    /// Returns `true` when the roles are swapped relative to this session.
    pub fn polarity_for(&self, a: &str, b: &str) -> Result<bool> {
        let (own_a, own_b) = (fold(&self.participant_a), fold(&self.participant_b));
        let (a, b) = (fold(a), fold(b));

        if a == own_a {
            if b != own_b {
                return Err(Error::Conflict(
                    "Duplicate stream with wrong opponent".to_string(),
                ));
            }
            Ok(false)
        } else if a == own_b {
            if b != own_a {
                return Err(Error::Conflict(
                    "Duplicate stream with wrong reversed opponent".to_string(),
                ));
            }
            Ok(true)
        } else {
            Err(Error::Conflict(
                "Duplicate stream with different participants".to_string(),
            ))
        }
    }

    /// Attach a linked match; returns `false` if the match is already settled
    /// by this session. Existing polarity is never changed.
    pub fn attach(&mut self, link: LinkedMatch) -> bool {
        if self.settles_match(&link.match_ref) {
            return false;
        }
        self.linked_matches.push(link);
        true
    }

    /// Participants as seen from one match's perspective.
    pub fn participants_for(&self, link: &LinkedMatch) -> (&str, &str) {
        if link.inverted {
            (&self.participant_b, &self.participant_a)
        } else {
            (&self.participant_a, &self.participant_b)
        }
    }
}

/// Case-insensitive participant identity.
pub fn fold(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Handles end up in a shell command line, so keep them to a safe alphabet.
pub fn validate_handle(handle: &str) -> Result<()> {
    let valid = !handle.is_empty()
        && handle.len() <= 64
        && handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidHandle(handle.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Input Types
// ─────────────────────────────────────────────────────────────────────────────

/// Input for creating (or attaching to) a watch session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWatch {
    pub handle: String,
    pub game_kind: String,
    pub match_ref: String,
    pub participant_a: String,
    pub participant_b: String,
}

impl NewWatch {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.handle, &self.game_kind)
    }

    pub fn request(&self) -> CreateWatchRequest {
        CreateWatchRequest {
            match_ref: self.match_ref.clone(),
            participant_a: self.participant_a.clone(),
            participant_b: self.participant_b.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Body of `PUT /streams/{handle}/{game_kind}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWatchRequest {
    pub match_ref: String,
    pub participant_a: String,
    pub participant_b: String,
}

/// Body of `PATCH /streams/{handle}/{game_kind}`: either a result or an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<Winner>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strong: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Unix timestamp (seconds) of the deciding observation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

/// Report travelling up the delegation tree.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamReport {
    Result(Verdict),
    Event(String),
}

impl From<&StreamReport> for ReportRequest {
    fn from(report: &StreamReport) -> Self {
        match report {
            StreamReport::Result(verdict) => ReportRequest {
                winner: Some(verdict.winner),
                strong: Some(verdict.strong),
                details: Some(verdict.details.clone()),
                timestamp: Some(verdict.observed_at.timestamp_millis() as f64 / 1000.0),
                event: None,
            },
            StreamReport::Event(text) => ReportRequest {
                event: Some(text.clone()),
                ..Default::default()
            },
        }
    }
}

impl ReportRequest {
    /// Decode into a report; an event takes precedence over result fields.
    pub fn into_report(self) -> Option<StreamReport> {
        if let Some(text) = self.event {
            return Some(StreamReport::Event(text));
        }
        let winner = self.winner?;
        let observed_at = self
            .timestamp
            .and_then(|ts| DateTime::from_timestamp_millis((ts * 1000.0) as i64))
            .unwrap_or_else(Utc::now);
        Some(StreamReport::Result(Verdict {
            winner,
            // older peers omit strength; treat it as decisive
            strong: self.strong.unwrap_or(true),
            details: self.details.unwrap_or_default(),
            observed_at,
        }))
    }
}

/// Aggregated capacity of a subtree (`GET /load`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub current_sessions: usize,
    pub max_sessions: usize,
    /// Mean utilisation over the reporting nodes
    pub load: f64,
}

/// Result notification sent to the external application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub winner: Winner,
    pub strong: bool,
    pub details: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> WatchSession {
        WatchSession {
            handle: "somestreamer".to_string(),
            game_kind: "fifa15-xboxone".to_string(),
            owner: None,
            primary_match_ref: "10".to_string(),
            linked_matches: Vec::new(),
            participant_a: "Alice".to_string(),
            participant_b: "Bob".to_string(),
            state: LifecycleState::Waiting,
            verdict: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_polarity_same_roles() {
        let s = session();
        assert!(!s.polarity_for("alice", "BOB").unwrap());
    }

    #[test]
    fn test_polarity_swapped_roles() {
        let s = session();
        assert!(s.polarity_for("Bob", "Alice").unwrap());
    }

    #[test]
    fn test_polarity_mismatch_is_conflict() {
        let s = session();
        assert!(matches!(s.polarity_for("Alice", "Carol"), Err(Error::Conflict(_))));
        assert!(matches!(s.polarity_for("Bob", "Carol"), Err(Error::Conflict(_))));
        assert!(matches!(s.polarity_for("Dave", "Carol"), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_swapped_link_inverts_winner() {
        let mut s = session();
        let inverted = s.polarity_for("Bob", "Alice").unwrap();
        s.attach(LinkedMatch {
            match_ref: "20".to_string(),
            inverted,
        });

        let link = s.matches().find(|m| m.match_ref == "20").unwrap();
        let winner = if link.inverted {
            Winner::ParticipantA.inverted()
        } else {
            Winner::ParticipantA
        };
        assert_eq!(winner, Winner::ParticipantB);
        assert_eq!(s.participants_for(&link), ("Bob", "Alice"));
    }

    #[test]
    fn test_attach_never_duplicates() {
        let mut s = session();
        assert!(s.attach(LinkedMatch {
            match_ref: "20".to_string(),
            inverted: true,
        }));
        assert!(!s.attach(LinkedMatch {
            match_ref: "20".to_string(),
            inverted: false,
        }));
        assert!(!s.attach(LinkedMatch {
            match_ref: "10".to_string(),
            inverted: true,
        }));
        assert_eq!(s.linked_matches.len(), 1);
        assert!(s.linked_matches[0].inverted);
    }

    #[test]
    fn test_validate_handle() {
        assert!(validate_handle("some_streamer-01.tv").is_ok());
        assert!(validate_handle("").is_err());
        assert!(validate_handle("a; rm -rf /").is_err());
        assert!(validate_handle("$(id)").is_err());
    }

    #[test]
    fn test_report_request_event_wins() {
        let req = ReportRequest {
            winner: Some(Winner::Draw),
            event: Some("Stream running".to_string()),
            ..Default::default()
        };
        assert_eq!(
            req.into_report(),
            Some(StreamReport::Event("Stream running".to_string()))
        );
    }

    #[test]
    fn test_report_request_result() {
        let verdict = Verdict {
            winner: Winner::ParticipantB,
            strong: true,
            details: "2 - 3".to_string(),
            observed_at: DateTime::from_timestamp(1_400_000_000, 0).unwrap(),
        };
        let req = ReportRequest::from(&StreamReport::Result(verdict.clone()));
        assert_eq!(req.into_report(), Some(StreamReport::Result(verdict)));
    }

    #[test]
    fn test_report_request_empty() {
        assert_eq!(ReportRequest::default().into_report(), None);
    }

    #[test]
    fn test_lifecycle_state_conversion() {
        for state in [
            LifecycleState::Waiting,
            LifecycleState::Watching,
            LifecycleState::Concluded,
            LifecycleState::Failed,
        ] {
            assert_eq!(LifecycleState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(LifecycleState::from_str("found"), None);
        assert!(LifecycleState::Watching.is_active());
        assert!(!LifecycleState::Failed.is_active());
    }

    #[test]
    fn test_winner_serde_names() {
        let json = serde_json::to_string(&Winner::ParticipantA).unwrap();
        assert_eq!(json, "\"participant_a\"");
        assert_eq!(Winner::from_str("failed"), Some(Winner::Failed));
        assert_eq!(Winner::Draw.inverted(), Winner::Draw);
    }
}
