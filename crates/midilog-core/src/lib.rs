//! Core domain logic for the MIDI activity logger.
//!
//! This crate contains the fundamental types and logic for:
//! - Events: the closed set of MIDI channel messages and their stored form
//! - Segmentation: splitting an event history into sessions by inactivity gap
//! - Reconstruction: turning a session into a timed Standard MIDI File

pub mod event;
pub mod event_kind;
pub mod segment;
pub mod timeline;
pub mod types;

pub use event::{MalformedPayload, MidiEvent, RawEvent, StoredRecord};
pub use event_kind::{EventKind, UnknownEventKind};
pub use segment::{
    DEFAULT_GAP_THRESHOLD, SegmentMode, Session, segment, segment_by_source, segment_with_mode,
};
pub use timeline::{
    DecodeError, ReconstructError, ReconstructedArtifact, TimedEvent, absolute_offsets,
    artifact_name, decode_artifact, reconstruct,
};
pub use types::{SourceId, ValidationError};
