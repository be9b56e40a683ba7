//! Clock-and-score extractor for football style streams.
//!
//! The capture tool prints one line per analysed frame:
//!
//! ```text
//! 1432 89:12 ARS 2 - CHE 1 in-game
//! ```
//!
//! (frame tag, match clock, left team, left score, `-`, right team, right
//! score, trailing tokens). Only lines ending in `in-game` carry a score.
//! A result is trusted once the clock has passed full time after being seen
//! approaching it; a clock that falls back after an approach means extra
//! time started and the buffered votes are abandoned.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::extractor::{ExtractorEvent, OutcomeExtractor, Participants};
use crate::types::{Observation, OutcomeTag};

/// Recognised frames kept for the team sanity check.
const TEAM_CHECK_WINDOW: usize = 10;

/// Team names are compared case-insensitively with digits blurred, since
/// the OCR confuses them with letters.
fn normalize_team(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_digit() { '@' } else { c })
        .collect()
}

/// Most frequent pair; ties go to the pair seen first.
fn most_common(pairs: &[Vec<String>], counts: &HashMap<&Vec<String>, usize>) -> Option<Vec<String>> {
    let mut best: Option<(&Vec<String>, usize)> = None;
    for pair in pairs {
        let count = counts.get(pair).copied().unwrap_or(0);
        if best.is_none_or(|(_, top)| count > top) {
            best = Some((pair, count));
        }
    }
    best.map(|(pair, _)| pair.clone())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    minute: u32,
    left: String,
    left_score: u32,
    right: String,
    right_score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

pub struct ScoreboardExtractor {
    participants: Participants,
    approaching: bool,
    team_check: Vec<Vec<String>>,
    events: Vec<ExtractorEvent>,
}

impl ScoreboardExtractor {
    pub fn new(participants: Participants) -> Self {
        Self {
            participants,
            approaching: false,
            team_check: Vec::with_capacity(TEAM_CHECK_WINDOW),
            events: Vec::new(),
        }
    }

    fn push_event(&mut self, key: impl Into<String>, text: impl Into<String>) {
        self.events.push(ExtractorEvent::new(key, text));
    }

    /// Parse a score line; `Ok(None)` for lines that are well-formed but unusable.
    fn parse(line: &str) -> Result<Option<Frame>> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [_, clock, left, left_score, dash, right, right_score, ..] = parts.as_slice() else {
            return Ok(None);
        };
        if *dash != "-" {
            debug!("Line not recognized: {}", line);
            return Ok(None);
        }
        if *left == "@@@" || *right == "@@@" {
            debug!("Teams not recognized: {}", line);
            return Ok(None);
        }
        let Some((minute, _seconds)) = clock.split_once(':') else {
            debug!("Clock not recognized: {}", line);
            return Ok(None);
        };
        if !(2..=3).contains(&left.len()) || !(2..=3).contains(&right.len()) {
            debug!("Bad team names, expected 2-3 chars: {}", line);
            return Ok(None);
        }

        let number = |s: &str| -> Result<u32> {
            s.parse::<u32>()
                .map_err(|e| Error::Classification(format!("{:?} in {:?}: {}", s, line, e)))
        };

        Ok(Some(Frame {
            minute: number(minute)?,
            left: left.to_string(),
            left_score: number(*left_score)?,
            right: right.to_string(),
            right_score: number(*right_score)?,
        }))
    }

    /// Collect the first frames' team pairs and compare the most common one
    /// against the expected participants.
    fn check_teams(&mut self, frame: &Frame) {
        if self.team_check.len() >= TEAM_CHECK_WINDOW {
            return;
        }
        let mut pair = vec![normalize_team(&frame.left), normalize_team(&frame.right)];
        pair.sort();
        self.team_check.push(pair);
        if self.team_check.len() < TEAM_CHECK_WINDOW {
            return;
        }

        let mut counts: HashMap<&Vec<String>, usize> = HashMap::new();
        for seen in &self.team_check {
            *counts.entry(seen).or_default() += 1;
        }
        let Some(have) = most_common(&self.team_check, &counts) else {
            return;
        };

        let need_a = normalize_team(&self.participants.a);
        let need_b = normalize_team(&self.participants.b);
        let need: HashSet<&String> = [&need_a, &need_b].into_iter().collect();
        let have_set: HashSet<&String> = have.iter().collect();
        if need == have_set {
            return;
        }

        warn!(expected = ?need, found = ?have, "Unexpected teams on stream");
        self.push_event(
            "team_check",
            format!(
                "Unexpected teams! Requested {}/{}, found {}",
                self.participants.a,
                self.participants.b,
                have.join("/")
            ),
        );

        let missing: Vec<&&String> = need.difference(&have_set).collect();
        if let [team] = missing.as_slice() {
            let who = if **team == &need_a {
                "{participant_a}"
            } else {
                "{participant_b}"
            };
            self.push_event(
                "team_check_hint",
                format!("{}, did you choose another team?", who),
            );
        }
    }

    fn side_of(&self, participant: &str, frame: &Frame) -> Option<Side> {
        let p = normalize_team(participant);
        if p == normalize_team(&frame.left) {
            Some(Side::Left)
        } else if p == normalize_team(&frame.right) {
            Some(Side::Right)
        } else {
            None
        }
    }
}

impl OutcomeExtractor for ScoreboardExtractor {
    fn observe(&mut self, line: &str) -> Result<Observation> {
        let line = line.trim();

        if line.contains("error: No streams found on this URL") {
            return Ok(Observation::signal(OutcomeTag::Offline));
        }
        if line.contains("Failed to read the frame from the stream")
            || line.contains("HTTP connection closed")
            || line.contains("Stream ended")
        {
            return Ok(Observation::signal(OutcomeTag::Conclude));
        }
        if !line.ends_with("in-game") || line.contains("non in-game") {
            if self.approaching && line.contains("non in-game") {
                warn!("Scoreboard lost while approaching full time");
            }
            return Ok(Observation::none());
        }

        let Some(frame) = Self::parse(line)? else {
            return Ok(Observation::none());
        };

        let details = format!(
            "{} vs {}: {} - {}",
            frame.left, frame.right, frame.left_score, frame.right_score
        );
        debug!(
            left = %frame.left,
            right = %frame.right,
            left_score = frame.left_score,
            right_score = frame.right_score,
            "Got score data"
        );
        self.push_event("score_got", "Stream: got score info");
        self.push_event(
            format!("score_{}_{}", frame.left_score, frame.right_score),
            format!(
                "Stream: score changed: {} ({}) / {} ({})",
                frame.left_score, frame.left, frame.right_score, frame.right
            ),
        );
        self.check_teams(&frame);

        match frame.minute {
            m if m < 88 => return Ok(Observation::none()),
            88 | 89 => {
                debug!("Approaching full time: minute {}", frame.minute);
                self.approaching = true;
                return Ok(Observation::none());
            }
            m if m > 90 && m < 100 && self.approaching => {
                // clock fell back under extra time: the earlier votes were premature
                self.approaching = false;
                return Ok(Observation::signal(OutcomeTag::Abandon));
            }
            m if m > 90 && m < 118 => return Ok(Observation::none()),
            118 | 119 => {
                debug!("Approaching end of extra time: minute {}", frame.minute);
                self.approaching = true;
                return Ok(Observation::none());
            }
            _ => {}
        }
        if !self.approaching {
            info!("Result line without approach (minute {})", frame.minute);
        }

        if frame.left_score == frame.right_score {
            return Ok(Observation::strong(OutcomeTag::Draw, details));
        }

        let side_a = self.side_of(&self.participants.a, &frame);
        let side_b = self.side_of(&self.participants.b, &frame);
        let side_a = match (side_a, side_b) {
            (Some(side), _) => side,
            (None, Some(Side::Left)) => Side::Right,
            (None, Some(Side::Right)) => Side::Left,
            (None, None) => {
                warn!("Neither participant recognised on scoreboard, defaulting to draw");
                return Ok(Observation::weak(
                    OutcomeTag::Draw,
                    format!("Participants don't match -> draw... {}", details),
                ));
            }
        };

        let winning_side = if frame.left_score > frame.right_score {
            Side::Left
        } else {
            Side::Right
        };
        let tag = if winning_side == side_a {
            OutcomeTag::ParticipantA
        } else {
            OutcomeTag::ParticipantB
        };
        Ok(Observation::strong(tag, details))
    }

    fn drain_events(&mut self) -> Vec<ExtractorEvent> {
        std::mem::take(&mut self.events)
    }
}
