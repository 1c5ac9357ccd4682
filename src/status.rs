//! Caller‑visible speech status codes.
//!
//! Web content only ever sees the numeric tag of a [`SpeakStatus`]. The
//! positive values mirror engine lifecycle events while the negative ones
//! are produced by the session itself (`Playing`, `Muted`) or stand in for
//! anything that could not be resolved (`Error`).

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeakStatus {
    Start,
    Pause,
    Resume,
    Stop,
    Done,
    /// Another utterance is already speaking or paused.
    Playing,
    /// The mute gate reported silenced output.
    Muted,
    Error,
}

impl SpeakStatus {
    /// Numeric tag sent to web content.
    pub fn code(self) -> i32 {
        match self {
            SpeakStatus::Start => 1,
            SpeakStatus::Pause => 2,
            SpeakStatus::Resume => 3,
            SpeakStatus::Stop => 4,
            SpeakStatus::Done => 5,
            SpeakStatus::Playing => -100,
            SpeakStatus::Muted => -200,
            SpeakStatus::Error => -999,
        }
    }

    /// Resolve a status from its name, ignoring case. Names that do not
    /// match any status resolve to [`SpeakStatus::Error`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "start" => SpeakStatus::Start,
            "pause" => SpeakStatus::Pause,
            "resume" => SpeakStatus::Resume,
            "stop" => SpeakStatus::Stop,
            "done" => SpeakStatus::Done,
            "playing" => SpeakStatus::Playing,
            "muted" => SpeakStatus::Muted,
            _ => SpeakStatus::Error,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SpeakStatus::Start => "start",
            SpeakStatus::Pause => "pause",
            SpeakStatus::Resume => "resume",
            SpeakStatus::Stop => "stop",
            SpeakStatus::Done => "done",
            SpeakStatus::Playing => "playing",
            SpeakStatus::Muted => "muted",
            SpeakStatus::Error => "error",
        }
    }
}

impl FromStr for SpeakStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SpeakStatus::from_name(s))
    }
}

impl fmt::Display for SpeakStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

impl Serialize for SpeakStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SpeakStatus; 8] = [
        SpeakStatus::Start,
        SpeakStatus::Pause,
        SpeakStatus::Resume,
        SpeakStatus::Stop,
        SpeakStatus::Done,
        SpeakStatus::Playing,
        SpeakStatus::Muted,
        SpeakStatus::Error,
    ];

    #[test]
    fn numeric_tags_match_the_bridge_contract() {
        let codes: Vec<i32> = ALL.iter().map(|s| s.code()).collect();
        assert_eq!(codes, vec![1, 2, 3, 4, 5, -100, -200, -999]);
    }

    #[test]
    fn name_lookup_ignores_case() {
        assert_eq!(SpeakStatus::from_name("start"), SpeakStatus::Start);
        assert_eq!(SpeakStatus::from_name("MUTED"), SpeakStatus::Muted);
        assert_eq!(SpeakStatus::from_name("Playing"), SpeakStatus::Playing);
        assert_eq!("Done".parse::<SpeakStatus>().unwrap(), SpeakStatus::Done);
    }

    #[test]
    fn unknown_names_resolve_to_error() {
        assert_eq!(SpeakStatus::from_name("bogus"), SpeakStatus::Error);
        assert_eq!(SpeakStatus::from_name(""), SpeakStatus::Error);
    }

    #[test]
    fn names_and_codes_agree() {
        for status in ALL {
            assert_eq!(SpeakStatus::from_name(status.name()), status);
        }
    }

    #[test]
    fn serializes_as_numeric_tag() {
        let json = serde_json::to_string(&SpeakStatus::Muted).unwrap();
        assert_eq!(json, "-200");
    }
}
