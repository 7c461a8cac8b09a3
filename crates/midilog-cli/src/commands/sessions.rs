//! Sessions command: lists reconstructed sessions, newest first.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use midilog_core::ReconstructedArtifact;
use midilog_db::{SessionListing, TimeWindow};
use serde::Serialize;

use crate::Config;
use crate::commands::util::{notes, open_log, query_service};

pub const EMPTY_RANGE: &str = "No sessions for this range.";

pub fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    window: TimeWindow,
    source: Option<&str>,
    json: bool,
) -> Result<()> {
    let log = open_log(config)?;
    let listing = query_service(&log, config).list_sessions(window, source)?;
    if json {
        write_json(writer, &listing)
    } else {
        write_text(writer, &listing)
    }
}

/// Sessions grouped under their start date, numbered in listing order.
pub fn write_text<W: Write>(writer: &mut W, listing: &SessionListing) -> Result<()> {
    if listing.is_empty() {
        writeln!(writer, "{EMPTY_RANGE}")?;
        return Ok(());
    }

    let mut current_date: Option<&str> = None;
    for (number, artifact) in (1..).zip(&listing.artifacts) {
        if current_date != Some(artifact.session_start_date.as_str()) {
            writeln!(writer, "{}", artifact.session_start_date)?;
            current_date = Some(artifact.session_start_date.as_str());
        }
        writeln!(
            writer,
            "  {number}. {}  {}  {}  {}",
            artifact.session_start_time,
            source_label(artifact.source.as_deref()),
            notes(artifact.event_count),
            artifact.name
        )?;
    }

    if !listing.failures.is_empty() {
        writeln!(writer, "Could not rebuild:")?;
        for failure in &listing.failures {
            writeln!(
                writer,
                "  - {}  {}: {}",
                failure.start.format("%d.%m.%Y %H:%M"),
                source_label(failure.source.as_deref()),
                failure.error
            )?;
        }
    }

    writeln!(
        writer,
        "Total: {} in {} sessions",
        notes(listing.total_event_count()),
        listing.artifacts.len()
    )?;
    Ok(())
}

#[derive(Serialize)]
struct JsonSession<'a> {
    number: usize,
    #[serde(flatten)]
    artifact: &'a ReconstructedArtifact,
}

#[derive(Serialize)]
struct JsonFailure<'a> {
    ordinal: usize,
    start: DateTime<Utc>,
    source: Option<&'a str>,
    error: String,
}

#[derive(Serialize)]
struct JsonListing<'a> {
    sessions: Vec<JsonSession<'a>>,
    failures: Vec<JsonFailure<'a>>,
    total_notes: usize,
}

pub fn write_json<W: Write>(writer: &mut W, listing: &SessionListing) -> Result<()> {
    let output = JsonListing {
        sessions: (1..)
            .zip(&listing.artifacts)
            .map(|(number, artifact)| JsonSession { number, artifact })
            .collect(),
        failures: listing
            .failures
            .iter()
            .map(|failure| JsonFailure {
                ordinal: failure.ordinal,
                start: failure.start,
                source: failure.source.as_deref(),
                error: failure.error.to_string(),
            })
            .collect(),
        total_notes: listing.total_event_count(),
    };
    serde_json::to_writer_pretty(&mut *writer, &output)?;
    writeln!(writer)?;
    Ok(())
}

fn source_label(source: Option<&str>) -> &str {
    source.unwrap_or("all inputs")
}
