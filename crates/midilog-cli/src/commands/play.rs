//! Play command: sends a session to a MIDI output in real time.

use std::io::Write;

use anyhow::{Context, Result};
use midilog_io::{MidirSink, play_artifact, silence};

use crate::Config;
use crate::commands::util::fetch_session;

pub async fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    number: usize,
    source: Option<&str>,
    device: Option<&str>,
) -> Result<()> {
    let artifact = fetch_session(config, number, source)?;
    let mut sink = MidirSink::open(&config.client_name, device)
        .context("failed to open MIDI output")?;

    writeln!(
        writer,
        "Playing {} on {} ({} ms)",
        artifact.name,
        sink.port_name(),
        artifact.duration_ms
    )?;
    writer.flush()?;

    let sent = play_artifact(&mut sink, &artifact.encoded_bytes).await?;
    silence(&mut sink);
    writeln!(writer, "Sent {sent} events")?;
    Ok(())
}
