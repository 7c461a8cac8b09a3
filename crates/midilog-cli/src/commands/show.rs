//! Show command: prints one session's decoded events.

use std::io::Write;

use anyhow::Result;
use midilog_core::{ReconstructedArtifact, absolute_offsets, decode_artifact};

use crate::Config;
use crate::commands::util::fetch_session;

pub fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    number: usize,
    source: Option<&str>,
) -> Result<()> {
    let artifact = fetch_session(config, number, source)?;
    write_session(writer, number, &artifact)
}

pub fn write_session<W: Write>(
    writer: &mut W,
    number: usize,
    artifact: &ReconstructedArtifact,
) -> Result<()> {
    writeln!(
        writer,
        "Session {number}: {} {} ({})",
        artifact.session_start_date,
        artifact.session_start_time,
        artifact.source.as_deref().unwrap_or("all inputs")
    )?;
    writeln!(writer, "File: {}", artifact.name)?;
    writeln!(
        writer,
        "Notes: {}  Events: {}  Duration: {} ms",
        artifact.event_count, artifact.record_count, artifact.duration_ms
    )?;

    let events = decode_artifact(&artifact.encoded_bytes)?;
    for (offset, timed) in absolute_offsets(&events).into_iter().zip(&events) {
        writeln!(writer, "{offset:>8} ms  {}", timed.event)?;
    }
    Ok(())
}
