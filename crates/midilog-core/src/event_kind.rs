//! Event kind enum as the single source of truth for event kind strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical MIDI event kinds recorded by the logger.
///
/// The strings match the `type` tag of the serialized payload and the
/// `event_kind` column of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    NoteOff,
    NoteOn,
    PolyTouch,
    ControlChange,
    ProgramChange,
    Aftertouch,
    PitchWheel,
}

impl EventKind {
    /// All kinds, in status-byte order.
    pub const ALL: [Self; 7] = [
        Self::NoteOff,
        Self::NoteOn,
        Self::PolyTouch,
        Self::ControlChange,
        Self::ProgramChange,
        Self::Aftertouch,
        Self::PitchWheel,
    ];

    /// Returns the string representation for SQL storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoteOff => "note_off",
            Self::NoteOn => "note_on",
            Self::PolyTouch => "polytouch",
            Self::ControlChange => "control_change",
            Self::ProgramChange => "program_change",
            Self::Aftertouch => "aftertouch",
            Self::PitchWheel => "pitchwheel",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note_off" => Ok(Self::NoteOff),
            "note_on" => Ok(Self::NoteOn),
            "polytouch" => Ok(Self::PolyTouch),
            "control_change" => Ok(Self::ControlChange),
            "program_change" => Ok(Self::ProgramChange),
            "aftertouch" => Ok(Self::Aftertouch),
            "pitchwheel" => Ok(Self::PitchWheel),
            _ => Err(UnknownEventKind(s.to_string())),
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error type for unknown event kind strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEventKind(String);

impl fmt::Display for UnknownEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event kind: {}", self.0)
    }
}

impl std::error::Error for UnknownEventKind {}
