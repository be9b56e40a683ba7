//! Noise-tolerant consensus over the observations of one watch attempt.
//!
//! Observations arrive in the order the capture process emits them.
//! Result-bearing observations are buffered; the attempt concludes once the
//! buffer reaches the quorum or the time window since the first buffered
//! observation has elapsed. At conclusion, weak votes are dropped whenever
//! a strong one exists and the most frequent remaining vote wins, ties going
//! to the vote seen first.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Observation, OutcomeTag, Verdict, Winner};

/// Per game kind consensus knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusParams {
    /// Minimum votes before concluding; `None` or `Some(0)` disables.
    pub quorum: Option<usize>,
    /// Window after the first vote; `None` disables.
    pub max_delta: Option<Duration>,
    /// Keep only the latest vote.
    pub only_last_result: bool,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            quorum: Some(5),
            max_delta: Some(Duration::from_secs(10)),
            only_last_result: false,
        }
    }
}

/// What the caller should do after feeding one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Continue,
    /// Stop the process and retry the whole watch later.
    Offline,
    Concluded(Verdict),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Vote {
    winner: Winner,
    strong: bool,
    details: String,
}

/// Consensus state for one running attempt.
#[derive(Debug)]
pub struct ConsensusEngine {
    params: ConsensusParams,
    votes: Vec<Vote>,
    first_at: Option<Instant>,
    last_vote_at: Option<DateTime<Utc>>,
}

impl ConsensusEngine {
    pub fn new(params: ConsensusParams) -> Self {
        Self {
            params,
            votes: Vec::new(),
            first_at: None,
            last_vote_at: None,
        }
    }

    /// Number of votes currently buffered
    pub fn buffered(&self) -> usize {
        self.votes.len()
    }

    /// Feed one observation taken at `now`.
    pub fn observe(&mut self, observation: Observation, now: Instant) -> Step {
        match observation.tag {
            OutcomeTag::Offline => Step::Offline,
            OutcomeTag::Abandon => {
                self.reset();
                Step::Continue
            }
            OutcomeTag::Conclude => Step::Concluded(self.finish()),
            OutcomeTag::None => match self.poll_deadline(now) {
                Some(verdict) => Step::Concluded(verdict),
                None => Step::Continue,
            },
            OutcomeTag::ParticipantA | OutcomeTag::ParticipantB | OutcomeTag::Draw => {
                let Some(winner) = observation.tag.winner() else {
                    return Step::Continue;
                };
                if self.params.only_last_result {
                    self.votes.clear();
                }
                self.votes.push(Vote {
                    winner,
                    strong: observation.strong,
                    details: observation.details,
                });
                self.first_at.get_or_insert(now);
                self.last_vote_at = Some(Utc::now());

                if self.quorum_reached() || self.window_elapsed(now) {
                    Step::Concluded(self.decide())
                } else {
                    Step::Continue
                }
            }
        }
    }

    /// Instant at which the time window closes, if a window is running.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.first_at, self.params.max_delta) {
            (Some(first), Some(delta)) if !self.votes.is_empty() => Some(first + delta),
            _ => None,
        }
    }

    /// Conclude if the time window has closed by `now`.
    pub fn poll_deadline(&mut self, now: Instant) -> Option<Verdict> {
        if !self.votes.is_empty() && self.window_elapsed(now) {
            Some(self.decide())
        } else {
            None
        }
    }

    /// Conclude with whatever has been buffered; nothing buffered means no result.
    pub fn finish(&mut self) -> Verdict {
        if self.votes.is_empty() {
            Verdict::no_result()
        } else {
            self.decide()
        }
    }

    fn reset(&mut self) {
        self.votes.clear();
        self.first_at = None;
        self.last_vote_at = None;
    }

    fn quorum_reached(&self) -> bool {
        matches!(self.params.quorum, Some(q) if q > 0 && self.votes.len() >= q)
    }

    fn window_elapsed(&self, now: Instant) -> bool {
        match (self.first_at, self.params.max_delta) {
            (Some(first), Some(delta)) => now.saturating_duration_since(first) >= delta,
            _ => false,
        }
    }

    fn decide(&self) -> Verdict {
        let any_strong = self.votes.iter().any(|v| v.strong);

        // (vote, count) in first-seen order
        let mut tally: Vec<(&Vote, usize)> = Vec::new();
        for vote in self.votes.iter().filter(|v| v.strong || !any_strong) {
            match tally.iter_mut().find(|(seen, _)| *seen == vote) {
                Some((_, count)) => *count += 1,
                None => tally.push((vote, 1)),
            }
        }
        // stable: equal counts keep first-seen order
        tally.sort_by(|a, b| b.1.cmp(&a.1));

        match tally.first() {
            Some((vote, _)) => Verdict {
                winner: vote.winner,
                strong: vote.strong,
                details: vote.details.clone(),
                observed_at: self.last_vote_at.unwrap_or_else(Utc::now),
            },
            None => Verdict::no_result(),
        }
    }
}
