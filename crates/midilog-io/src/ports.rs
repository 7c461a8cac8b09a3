//! MIDI hardware access through midir (ALSA on Linux, CoreMIDI on macOS).

use std::collections::BTreeSet;

use chrono::Utc;
use midilog_core::MidiEvent;
use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};

use crate::ingest::{Captured, DeviceEnumerator, EventSender, SourceHandle, offer};
use crate::playback::{PlaybackError, PlaybackSink};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to initialize MIDI: {0}")]
    InitFailed(String),

    #[error("port not found: {0}")]
    PortNotFound(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

/// A discovered MIDI port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub index: usize,
    pub name: String,
}

/// Lists MIDI input ports.
pub fn list_input_ports(client_name: &str) -> Result<Vec<PortInfo>, CaptureError> {
    let midi_in =
        MidiInput::new(client_name).map_err(|e| CaptureError::InitFailed(e.to_string()))?;
    Ok(midi_in
        .ports()
        .iter()
        .enumerate()
        .filter_map(|(index, port)| {
            midi_in
                .port_name(port)
                .ok()
                .map(|name| PortInfo { index, name })
        })
        .collect())
}

/// Lists MIDI output ports.
pub fn list_output_ports(client_name: &str) -> Result<Vec<PortInfo>, CaptureError> {
    let midi_out =
        MidiOutput::new(client_name).map_err(|e| CaptureError::InitFailed(e.to_string()))?;
    Ok(midi_out
        .ports()
        .iter()
        .enumerate()
        .filter_map(|(index, port)| {
            midi_out
                .port_name(port)
                .ok()
                .map(|name| PortInfo { index, name })
        })
        .collect())
}

/// Enumerates and opens hardware inputs.
#[derive(Debug, Clone)]
pub struct MidirEnumerator {
    client_name: String,
}

impl MidirEnumerator {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }
}

impl DeviceEnumerator for MidirEnumerator {
    fn list_active_sources(&self) -> Result<BTreeSet<String>, CaptureError> {
        Ok(list_input_ports(&self.client_name)?
            .into_iter()
            .map(|port| port.name)
            .collect())
    }

    fn open(&self, name: &str, sender: EventSender) -> Result<Box<dyn SourceHandle>, CaptureError> {
        let midi_in = MidiInput::new(&self.client_name)
            .map_err(|e| CaptureError::InitFailed(e.to_string()))?;

        let ports = midi_in.ports();
        let port = ports
            .iter()
            .find(|p| midi_in.port_name(p).is_ok_and(|n| n == name))
            .ok_or_else(|| CaptureError::PortNotFound(name.to_string()))?;

        let source = name.to_string();
        let mut overflowed = 0;
        let connection = midi_in
            .connect(
                port,
                &format!("{}-in", self.client_name),
                move |_stamp, data, _| match MidiEvent::from_bytes(data) {
                    Some(event) => {
                        let captured = Captured {
                            at: Utc::now(),
                            event,
                        };
                        offer(&sender, &source, captured, &mut overflowed);
                    }
                    None => tracing::trace!(status = ?data.first(), "ignoring message"),
                },
                (),
            )
            .map_err(|e| CaptureError::ConnectionFailed(e.to_string()))?;

        Ok(Box::new(MidirInput {
            connection: Some(connection),
            name: name.to_string(),
        }))
    }
}

/// An open hardware input; the connection closes on drop.
struct MidirInput {
    connection: Option<MidiInputConnection<()>>,
    name: String,
}

impl SourceHandle for MidirInput {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MidirInput {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            tracing::debug!(source = %self.name, "closed MIDI input");
        }
    }
}

/// Hardware output used for playback.
pub struct MidirSink {
    connection: Option<MidiOutputConnection>,
    port_name: String,
}

impl MidirSink {
    /// Opens the first output whose name contains `pattern`, or the first
    /// output at all when no pattern is given.
    pub fn open(client_name: &str, pattern: Option<&str>) -> Result<Self, CaptureError> {
        let midi_out =
            MidiOutput::new(client_name).map_err(|e| CaptureError::InitFailed(e.to_string()))?;

        let ports = midi_out.ports();
        let port = ports
            .iter()
            .find(|p| match pattern {
                Some(pattern) => midi_out.port_name(p).is_ok_and(|n| n.contains(pattern)),
                None => true,
            })
            .ok_or_else(|| {
                CaptureError::PortNotFound(pattern.unwrap_or("any output").to_string())
            })?;

        let port_name = midi_out
            .port_name(port)
            .map_err(|e| CaptureError::ConnectionFailed(e.to_string()))?;
        let connection = midi_out
            .connect(port, &format!("{client_name}-out"))
            .map_err(|e| CaptureError::ConnectionFailed(e.to_string()))?;

        tracing::info!(port = %port_name, "opened MIDI output");
        Ok(Self {
            connection: Some(connection),
            port_name,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl PlaybackSink for MidirSink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), PlaybackError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| PlaybackError::Send("connection closed".to_string()))?;
        connection
            .send(bytes)
            .map_err(|e| PlaybackError::Send(e.to_string()))
    }
}

impl Drop for MidirSink {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            tracing::debug!(port = %self.port_name, "closed MIDI output");
        }
    }
}
