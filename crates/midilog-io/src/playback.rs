//! Timed playback of reconstructed sessions.

use std::time::Duration;

use midilog_core::{DecodeError, TimedEvent, decode_artifact};
use thiserror::Error;

use crate::ports::CaptureError;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Port(#[from] CaptureError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("send failed: {0}")]
    Send(String),
}

/// Anything that accepts raw MIDI bytes.
pub trait PlaybackSink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), PlaybackError>;
}

/// Sends `events` to `sink`, waiting each event's delta before it.
///
/// Returns the number of events sent. On any send failure a best-effort
/// "all notes off" is sent on every channel before the error is returned.
pub async fn play<K: PlaybackSink>(
    sink: &mut K,
    events: &[TimedEvent],
) -> Result<usize, PlaybackError> {
    for (sent, timed) in events.iter().enumerate() {
        if timed.delta_ms > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(timed.delta_ms))).await;
        }
        if let Err(err) = sink.send(&timed.event.to_bytes()) {
            tracing::warn!(sent, error = %err, "playback interrupted");
            silence(sink);
            return Err(err);
        }
    }
    Ok(events.len())
}

/// Decodes an artifact and plays it.
pub async fn play_artifact<K: PlaybackSink>(
    sink: &mut K,
    bytes: &[u8],
) -> Result<usize, PlaybackError> {
    let events = decode_artifact(bytes)?;
    play(sink, &events).await
}

/// Sends "all notes off" (CC 123) on every channel, ignoring failures.
pub fn silence<K: PlaybackSink>(sink: &mut K) {
    for channel in 0..16u8 {
        let _ = sink.send(&[0xB0 | channel, 123, 0]);
    }
}
