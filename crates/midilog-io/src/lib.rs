//! MIDI hardware I/O for the MIDI activity logger.
//!
//! - Ports: input/output enumeration and connections through `midir`
//! - Ingestion: the capture supervisor and its per-source persisting tasks
//! - Playback: timed output of reconstructed sessions

pub mod ingest;
pub mod playback;
pub mod ports;

pub use ingest::{
    Captured, DEFAULT_RESCAN_INTERVAL, DeviceEnumerator, EventSender, IngestStats, Ingestor,
    SOURCE_QUEUE_CAPACITY, SourceHandle, offer,
};
pub use playback::{PlaybackError, PlaybackSink, play, play_artifact, silence};
pub use ports::{
    CaptureError, MidirEnumerator, MidirSink, PortInfo, list_input_ports, list_output_ports,
};
