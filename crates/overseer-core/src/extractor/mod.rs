//! Outcome extraction: turning capture output lines into observations.
//!
//! Each game kind is registered at startup with an extractor, a capture
//! command and its consensus parameters. Extractors are pure: they never
//! block or perform I/O, and only keep short-lived state for the attempt
//! they were created for.

pub mod scoreboard;
pub mod scripted;

pub use scoreboard::ScoreboardExtractor;
pub use scripted::ScriptedExtractor;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::consensus::ConsensusParams;
use crate::error::Result;
use crate::types::{Observation, WatchSession};

/// Human-readable event queued by an extractor.
///
/// The watch task forwards each `key` at most once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorEvent {
    pub key: String,
    pub text: String,
}

impl ExtractorEvent {
    pub fn new(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            text: text.into(),
        }
    }
}

/// Per game kind line classifier.
pub trait OutcomeExtractor: Send {
    /// Classify one line of capture output.
    ///
    /// An error only affects this line; the caller treats it as no signal.
    fn observe(&mut self, line: &str) -> Result<Observation>;

    /// Take the events queued since the last call.
    fn drain_events(&mut self) -> Vec<ExtractorEvent> {
        Vec::new()
    }
}

/// Expected participants, as the extractor reconciles them against the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participants {
    pub a: String,
    pub b: String,
}

impl From<&WatchSession> for Participants {
    fn from(session: &WatchSession) -> Self {
        Self {
            a: session.participant_a.clone(),
            b: session.participant_b.clone(),
        }
    }
}

/// Built-in extractor implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    Scoreboard,
    Scripted,
}

impl ExtractorKind {
    pub fn build(&self, participants: Participants) -> Box<dyn OutcomeExtractor> {
        match self {
            ExtractorKind::Scoreboard => Box::new(ScoreboardExtractor::new(participants)),
            ExtractorKind::Scripted => Box::new(ScriptedExtractor::new()),
        }
    }
}

/// What the root records on every match when a session fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Settle every match as a draw.
    #[default]
    Draw,
    /// Leave the matches for the application to settle.
    Skip,
}

/// Everything a node needs to watch streams of one game kind.
#[derive(Debug, Clone)]
pub struct GameKind {
    pub name: String,
    pub extractor: ExtractorKind,
    /// Shell command template; `{handle}` is replaced with the stream handle.
    pub command: String,
    pub workdir: Option<PathBuf>,
    pub consensus: ConsensusParams,
    pub on_failure: FailurePolicy,
}

impl GameKind {
    pub fn command_for(&self, handle: &str) -> String {
        self.command.replace("{handle}", handle)
    }

    /// Fresh extractor for one watch attempt.
    pub fn extractor_for(&self, session: &WatchSession) -> Box<dyn OutcomeExtractor> {
        self.extractor.build(Participants::from(session))
    }
}

/// Registration table `game_kind -> capability`, populated at startup.
#[derive(Debug, Clone, Default)]
pub struct ExtractorRegistry {
    kinds: HashMap<String, Arc<GameKind>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: GameKind) {
        self.kinds.insert(kind.name.clone(), Arc::new(kind));
    }

    pub fn get(&self, name: &str) -> Option<Arc<GameKind>> {
        self.kinds.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kinds.keys().cloned().collect();
        names.sort();
        names
    }
}
