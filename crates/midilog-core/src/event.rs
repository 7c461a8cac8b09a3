//! MIDI events as captured from hardware and as read back from the log.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event_kind::EventKind;
use crate::types::{SourceId, ValidationError};

/// Lowest pitch wheel value (14-bit, centered at zero).
pub const PITCH_MIN: i16 = -8192;
/// Highest pitch wheel value.
pub const PITCH_MAX: i16 = 8191;

/// A MIDI channel-voice message.
///
/// Serialized as a flat object tagged by `type`, e.g.
/// `{"type":"note_on","channel":0,"note":60,"velocity":64}`. Unknown fields
/// are ignored on input so older rows carrying a `time` field still decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MidiEvent {
    NoteOff {
        channel: u8,
        note: u8,
        velocity: u8,
    },
    NoteOn {
        channel: u8,
        note: u8,
        velocity: u8,
    },
    /// Polyphonic key pressure.
    #[serde(rename = "polytouch")]
    PolyTouch { channel: u8, note: u8, value: u8 },
    ControlChange { channel: u8, control: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    /// Channel pressure.
    Aftertouch { channel: u8, value: u8 },
    #[serde(rename = "pitchwheel")]
    PitchWheel { channel: u8, pitch: i16 },
}

impl MidiEvent {
    /// Returns the kind tag of this event.
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::NoteOff { .. } => EventKind::NoteOff,
            Self::NoteOn { .. } => EventKind::NoteOn,
            Self::PolyTouch { .. } => EventKind::PolyTouch,
            Self::ControlChange { .. } => EventKind::ControlChange,
            Self::ProgramChange { .. } => EventKind::ProgramChange,
            Self::Aftertouch { .. } => EventKind::Aftertouch,
            Self::PitchWheel { .. } => EventKind::PitchWheel,
        }
    }

    /// Returns the MIDI channel (0-15).
    pub const fn channel(&self) -> u8 {
        match *self {
            Self::NoteOff { channel, .. }
            | Self::NoteOn { channel, .. }
            | Self::PolyTouch { channel, .. }
            | Self::ControlChange { channel, .. }
            | Self::ProgramChange { channel, .. }
            | Self::Aftertouch { channel, .. }
            | Self::PitchWheel { channel, .. } => channel,
        }
    }

    /// Whether this event is an audible onset: a note-on with non-zero velocity.
    ///
    /// A note-on with velocity 0 is a note-off by MIDI convention.
    pub const fn is_sounding(&self) -> bool {
        matches!(self, Self::NoteOn { velocity, .. } if *velocity > 0)
    }

    /// Checks that every field fits its MIDI wire range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("channel", self.channel(), 0x0F)?;
        match *self {
            Self::NoteOff { note, velocity, .. } | Self::NoteOn { note, velocity, .. } => {
                check_range("note", note, 0x7F)?;
                check_range("velocity", velocity, 0x7F)
            }
            Self::PolyTouch { note, value, .. } => {
                check_range("note", note, 0x7F)?;
                check_range("value", value, 0x7F)
            }
            Self::ControlChange { control, value, .. } => {
                check_range("control", control, 0x7F)?;
                check_range("value", value, 0x7F)
            }
            Self::ProgramChange { program, .. } => check_range("program", program, 0x7F),
            Self::Aftertouch { value, .. } => check_range("value", value, 0x7F),
            Self::PitchWheel { pitch, .. } => {
                if (PITCH_MIN..=PITCH_MAX).contains(&pitch) {
                    Ok(())
                } else {
                    Err(ValidationError::OutOfRange {
                        field: "pitch",
                        value: i32::from(pitch),
                    })
                }
            }
        }
    }

    /// Parses raw wire bytes into an event.
    ///
    /// Returns `None` for system, sysex and realtime messages, for truncated
    /// messages, and for data bytes with the high bit set.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let (&status, rest) = data.split_first()?;
        if rest.iter().any(|b| b & 0x80 != 0) {
            return None;
        }
        let channel = status & 0x0F;

        match (status & 0xF0, rest) {
            (0x80, [note, velocity, ..]) => Some(Self::NoteOff {
                channel,
                note: *note,
                velocity: *velocity,
            }),
            (0x90, [note, velocity, ..]) => Some(Self::NoteOn {
                channel,
                note: *note,
                velocity: *velocity,
            }),
            (0xA0, [note, value, ..]) => Some(Self::PolyTouch {
                channel,
                note: *note,
                value: *value,
            }),
            (0xB0, [control, value, ..]) => Some(Self::ControlChange {
                channel,
                control: *control,
                value: *value,
            }),
            (0xC0, [program, ..]) => Some(Self::ProgramChange {
                channel,
                program: *program,
            }),
            (0xD0, [value, ..]) => Some(Self::Aftertouch {
                channel,
                value: *value,
            }),
            (0xE0, [lsb, msb, ..]) => {
                let raw = (i16::from(*msb) << 7) | i16::from(*lsb);
                Some(Self::PitchWheel {
                    channel,
                    pitch: raw - 8192,
                })
            }
            _ => None,
        }
    }

    /// Encodes the event to raw wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let ch = self.channel() & 0x0F;
        match *self {
            Self::NoteOff { note, velocity, .. } => vec![0x80 | ch, note, velocity],
            Self::NoteOn { note, velocity, .. } => vec![0x90 | ch, note, velocity],
            Self::PolyTouch { note, value, .. } => vec![0xA0 | ch, note, value],
            Self::ControlChange { control, value, .. } => vec![0xB0 | ch, control, value],
            Self::ProgramChange { program, .. } => vec![0xC0 | ch, program],
            Self::Aftertouch { value, .. } => vec![0xD0 | ch, value],
            Self::PitchWheel { pitch, .. } => {
                let centered = (i32::from(pitch) + 8192).clamp(0, 0x3FFF);
                let lsb = (centered & 0x7F) as u8;
                let msb = ((centered >> 7) & 0x7F) as u8;
                vec![0xE0 | ch, lsb, msb]
            }
        }
    }
}

/// Renders as `kind field=value ...`, e.g. `note_on channel=0 note=60 velocity=64`.
impl fmt::Display for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} channel={}", self.kind(), self.channel())?;
        match *self {
            Self::NoteOff { note, velocity, .. } | Self::NoteOn { note, velocity, .. } => {
                write!(f, " note={note} velocity={velocity}")
            }
            Self::PolyTouch { note, value, .. } => write!(f, " note={note} value={value}"),
            Self::ControlChange { control, value, .. } => {
                write!(f, " control={control} value={value}")
            }
            Self::ProgramChange { program, .. } => write!(f, " program={program}"),
            Self::Aftertouch { value, .. } => write!(f, " value={value}"),
            Self::PitchWheel { pitch, .. } => write!(f, " pitch={pitch}"),
        }
    }
}

fn check_range(field: &'static str, value: u8, max: u8) -> Result<(), ValidationError> {
    if value <= max {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: i32::from(value),
        })
    }
}

/// One observed hardware event, stamped at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// When the event was captured.
    pub timestamp: DateTime<Utc>,
    /// The input that produced it.
    pub source: SourceId,
    /// The message itself.
    pub event: MidiEvent,
}

impl RawEvent {
    pub const fn new(timestamp: DateTime<Utc>, source: SourceId, event: MidiEvent) -> Self {
        Self {
            timestamp,
            source,
            event,
        }
    }
}

/// A row of the log as read back from storage.
///
/// The payload is kept in its serialized form; [`StoredRecord::decode`]
/// turns it into a [`MidiEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Identity assigned by the log, increasing with insertion order.
    pub id: i64,
    pub captured_at: DateTime<Utc>,
    pub source: String,
    pub kind: String,
    pub payload: String,
}

/// A stored payload that cannot be turned back into an event.
#[derive(Debug, Error)]
pub enum MalformedPayload {
    #[error("record {record_id}: invalid payload JSON")]
    Json {
        record_id: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error("record {record_id}: {source}")]
    Invalid {
        record_id: i64,
        #[source]
        source: ValidationError,
    },
    #[error("record {record_id}: payload is {payload_kind} but row says {row_kind}")]
    KindMismatch {
        record_id: i64,
        row_kind: String,
        payload_kind: EventKind,
    },
}

impl MalformedPayload {
    pub const fn record_id(&self) -> i64 {
        match self {
            Self::Json { record_id, .. }
            | Self::Invalid { record_id, .. }
            | Self::KindMismatch { record_id, .. } => *record_id,
        }
    }
}

impl StoredRecord {
    /// Decodes the payload, checking it against the row's kind column.
    pub fn decode(&self) -> Result<MidiEvent, MalformedPayload> {
        let event: MidiEvent =
            serde_json::from_str(&self.payload).map_err(|source| MalformedPayload::Json {
                record_id: self.id,
                source,
            })?;
        event.validate().map_err(|source| MalformedPayload::Invalid {
            record_id: self.id,
            source,
        })?;
        if event.kind().as_str() != self.kind {
            return Err(MalformedPayload::KindMismatch {
                record_id: self.id,
                row_kind: self.kind.clone(),
                payload_kind: event.kind(),
            });
        }
        Ok(event)
    }
}
