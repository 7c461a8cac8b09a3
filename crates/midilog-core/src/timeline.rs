//! Timeline reconstruction: sessions to Standard MIDI Files and back.
//!
//! Artifacts are format 0 files with a single track. The header declares
//! 500 ticks per quarter note and the track opens with a 500 000 µs/quarter
//! tempo, which makes one tick exactly one millisecond. Every event carries
//! the rounded number of milliseconds since the previous event in the
//! session (zero for the first).

use chrono::{DateTime, Utc};
use midly::{
    Format, Header, MetaMessage, MidiMessage, PitchBend, Smf, Timing, TrackEvent, TrackEventKind,
};
use serde::Serialize;
use thiserror::Error;

use crate::event::{MalformedPayload, MidiEvent};
use crate::segment::Session;

/// Ticks per quarter note in reconstructed artifacts.
pub const TICKS_PER_BEAT: u16 = 500;

/// Tempo in microseconds per quarter note. With [`TICKS_PER_BEAT`] this is
/// one millisecond per tick.
pub const TEMPO_US_PER_BEAT: u32 = 500_000;

/// Largest delta a variable-length quantity can carry.
const MAX_DELTA_MS: u32 = 0x0FFF_FFFF;

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("session starting {start} has an undecodable record")]
    MalformedPayload {
        start: DateTime<Utc>,
        #[source]
        source: MalformedPayload,
    },
    #[error("failed to encode MIDI: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid MIDI data: {0}")]
    Parse(String),
    #[error("unsupported timing, expected 500 ticks per beat")]
    UnsupportedTiming,
}

/// The exportable result of reconstructing one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconstructedArtifact {
    /// Deterministic file name, e.g. `session_3_Keystation_2025-03-01_20-15.mid`.
    pub name: String,
    /// Standard MIDI File bytes.
    #[serde(skip)]
    pub encoded_bytes: Vec<u8>,
    /// Number of sounding events (note-on with non-zero velocity).
    pub event_count: usize,
    /// Number of records in the session.
    pub record_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub start: DateTime<Utc>,
    pub duration_ms: i64,
    /// Start date formatted as `dd.mm.yyyy`.
    pub session_start_date: String,
    /// Start time formatted as `HH:MM`.
    pub session_start_time: String,
}

/// An event with its delta from the previous event, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedEvent {
    pub delta_ms: u32,
    pub event: MidiEvent,
}

/// Rounded, non-negative milliseconds from `from` to `to`.
pub fn delta_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u32 {
    let micros = to
        .signed_duration_since(from)
        .num_microseconds()
        .unwrap_or(i64::MAX);
    if micros <= 0 {
        return 0;
    }
    let millis = micros.saturating_add(500) / 1000;
    u32::try_from(millis).map_or(MAX_DELTA_MS, |ms| ms.min(MAX_DELTA_MS))
}

/// Builds the artifact file name from the session ordinal, an optional tag
/// and the start time.
pub fn artifact_name(ordinal: usize, tag: Option<&str>, start: DateTime<Utc>) -> String {
    let tag = tag
        .map(sanitize_tag)
        .filter(|t| !t.is_empty())
        .map(|t| format!("_{t}"))
        .unwrap_or_default();
    format!(
        "session_{ordinal}{tag}_{}.mid",
        start.format("%Y-%m-%d_%H-%M")
    )
}

/// Keeps alphanumerics, space, dot, underscore and dash; spaces become
/// underscores.
fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-'))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

/// Reconstructs one session into a timed MIDI artifact.
///
/// The whole session fails if any record cannot be decoded.
pub fn reconstruct(
    session: &Session,
    ordinal: usize,
    tag: Option<&str>,
) -> Result<ReconstructedArtifact, ReconstructError> {
    let start = session.start();
    let mut previous = start;
    let mut timed = Vec::with_capacity(session.len());
    let mut event_count = 0;

    for record in session.records() {
        let event = record
            .decode()
            .map_err(|source| ReconstructError::MalformedPayload { start, source })?;
        timed.push(TimedEvent {
            delta_ms: delta_ms(previous, record.captured_at),
            event,
        });
        if event.is_sounding() {
            event_count += 1;
        }
        previous = record.captured_at;
    }

    let encoded_bytes = encode_timeline(&timed)?;
    tracing::debug!(
        ordinal,
        records = timed.len(),
        event_count,
        bytes = encoded_bytes.len(),
        "reconstructed session"
    );

    Ok(ReconstructedArtifact {
        name: artifact_name(ordinal, tag, start),
        encoded_bytes,
        event_count,
        record_count: session.len(),
        source: session.source().map(str::to_string),
        start,
        duration_ms: (session.end() - start).num_milliseconds(),
        session_start_date: start.format("%d.%m.%Y").to_string(),
        session_start_time: start.format("%H:%M").to_string(),
    })
}

/// Writes timed events as a format 0 Standard MIDI File.
pub fn encode_timeline(events: &[TimedEvent]) -> Result<Vec<u8>, ReconstructError> {
    let mut track: Vec<TrackEvent<'static>> = Vec::with_capacity(events.len() + 2);
    track.push(TrackEvent {
        delta: 0.into(),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(TEMPO_US_PER_BEAT.into())),
    });
    for timed in events {
        track.push(TrackEvent {
            delta: timed.delta_ms.min(MAX_DELTA_MS).into(),
            kind: to_track_kind(timed.event),
        });
    }
    track.push(TrackEvent {
        delta: 0.into(),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let smf = Smf {
        header: Header::new(Format::SingleTrack, Timing::Metrical(TICKS_PER_BEAT.into())),
        tracks: vec![track],
    };

    let mut buffer = Vec::new();
    smf.write(&mut buffer)
        .map_err(|e| ReconstructError::Encode(e.to_string()))?;
    Ok(buffer)
}

fn to_track_kind(event: MidiEvent) -> TrackEventKind<'static> {
    let message = match event {
        MidiEvent::NoteOff { note, velocity, .. } => MidiMessage::NoteOff {
            key: note.into(),
            vel: velocity.into(),
        },
        MidiEvent::NoteOn { note, velocity, .. } => MidiMessage::NoteOn {
            key: note.into(),
            vel: velocity.into(),
        },
        MidiEvent::PolyTouch { note, value, .. } => MidiMessage::Aftertouch {
            key: note.into(),
            vel: value.into(),
        },
        MidiEvent::ControlChange { control, value, .. } => MidiMessage::Controller {
            controller: control.into(),
            value: value.into(),
        },
        MidiEvent::ProgramChange { program, .. } => MidiMessage::ProgramChange {
            program: program.into(),
        },
        MidiEvent::Aftertouch { value, .. } => MidiMessage::ChannelAftertouch { vel: value.into() },
        MidiEvent::PitchWheel { pitch, .. } => MidiMessage::PitchBend {
            bend: PitchBend::from_int(pitch),
        },
    };
    TrackEventKind::Midi {
        channel: event.channel().into(),
        message,
    }
}

fn from_midly(channel: u8, message: MidiMessage) -> MidiEvent {
    match message {
        MidiMessage::NoteOff { key, vel } => MidiEvent::NoteOff {
            channel,
            note: key.as_int(),
            velocity: vel.as_int(),
        },
        MidiMessage::NoteOn { key, vel } => MidiEvent::NoteOn {
            channel,
            note: key.as_int(),
            velocity: vel.as_int(),
        },
        MidiMessage::Aftertouch { key, vel } => MidiEvent::PolyTouch {
            channel,
            note: key.as_int(),
            value: vel.as_int(),
        },
        MidiMessage::Controller { controller, value } => MidiEvent::ControlChange {
            channel,
            control: controller.as_int(),
            value: value.as_int(),
        },
        MidiMessage::ProgramChange { program } => MidiEvent::ProgramChange {
            channel,
            program: program.as_int(),
        },
        MidiMessage::ChannelAftertouch { vel } => MidiEvent::Aftertouch {
            channel,
            value: vel.as_int(),
        },
        MidiMessage::PitchBend { bend } => MidiEvent::PitchWheel {
            channel,
            pitch: bend.as_int(),
        },
    }
}

/// Parses an artifact back into its timed events.
///
/// Deltas of non-channel events (tempo, end of track) are folded into the
/// next channel event so cumulative time is preserved.
pub fn decode_artifact(bytes: &[u8]) -> Result<Vec<TimedEvent>, DecodeError> {
    let smf = Smf::parse(bytes).map_err(|e| DecodeError::Parse(e.to_string()))?;
    match smf.header.timing {
        Timing::Metrical(tpb) if tpb.as_int() == TICKS_PER_BEAT => {}
        _ => return Err(DecodeError::UnsupportedTiming),
    }

    let mut events = Vec::new();
    for track in &smf.tracks {
        let mut pending: u32 = 0;
        for event in track {
            pending = pending.saturating_add(event.delta.as_int());
            if let TrackEventKind::Midi { channel, message } = event.kind {
                events.push(TimedEvent {
                    delta_ms: pending,
                    event: from_midly(channel.as_int(), message),
                });
                pending = 0;
            }
        }
    }
    Ok(events)
}

/// Running sum of deltas: each event's offset from the session start.
pub fn absolute_offsets(events: &[TimedEvent]) -> Vec<u64> {
    events
        .iter()
        .scan(0u64, |elapsed, timed| {
            *elapsed += u64::from(timed.delta_ms);
            Some(*elapsed)
        })
        .collect()
}
