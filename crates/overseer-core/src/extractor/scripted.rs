//! Keyword extractor for the `test` game kind and smoke tests.
//!
//! Grammar (first word decides, case-insensitive):
//!
//! - `Done a|b|d`: strong result for participant A, participant B or a draw
//! - `Weak a|b|d`: the same, but weak
//! - `Offline`, `Abandon`, `Conclude`: control tags
//! - anything else: no signal

use crate::error::{Error, Result};
use crate::extractor::OutcomeExtractor;
use crate::types::{Observation, OutcomeTag};

#[derive(Debug, Default)]
pub struct ScriptedExtractor;

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self
    }
}

fn result_tag(arg: Option<&str>, line: &str) -> Result<OutcomeTag> {
    match arg.map(|a| a.to_ascii_lowercase()).as_deref() {
        Some("a") => Ok(OutcomeTag::ParticipantA),
        Some("b") => Ok(OutcomeTag::ParticipantB),
        Some("d") => Ok(OutcomeTag::Draw),
        _ => Err(Error::Classification(format!("unknown result in {:?}", line))),
    }
}

impl OutcomeExtractor for ScriptedExtractor {
    fn observe(&mut self, line: &str) -> Result<Observation> {
        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            return Ok(Observation::none());
        };

        let observation = match first.to_ascii_lowercase().as_str() {
            "done" => Observation::strong(result_tag(words.next(), line)?, line),
            "weak" => Observation::weak(result_tag(words.next(), line)?, line),
            "offline" => Observation::signal(OutcomeTag::Offline),
            "abandon" => Observation::signal(OutcomeTag::Abandon),
            "conclude" => Observation::signal(OutcomeTag::Conclude),
            _ => Observation::none(),
        };
        Ok(observation)
    }
}
