//! Shared utilities for CLI commands.

use std::sync::LazyLock;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use midilog_core::ReconstructedArtifact;
use midilog_db::{PersistentLog, QueryService, TimeWindow};
use regex::Regex;

use crate::Config;
use crate::cli::RangeArgs;

/// Pre-compiled regex for relative time parsing.
static RELATIVE_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s+(minute|hour|day|week)s?\s+ago$").unwrap());

/// Conservative bounds for relative time parsing (~1000 years in minutes).
const MAX_RELATIVE_MINUTES: i64 = 1000 * 365 * 24 * 60;

/// Parse a datetime string as either ISO 8601 or relative time.
///
/// Supports:
/// - ISO 8601: "2026-01-15T10:30:00Z"
/// - Relative: "2 hours ago", "30 minutes ago", "1 day ago", "1 week ago"
pub fn parse_datetime(s: &str, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let Some(caps) = RELATIVE_TIME_RE.captures(s) else {
        anyhow::bail!(
            "Invalid datetime: {s}. Use ISO 8601 (e.g., 2026-01-15T10:30:00Z) or relative (e.g., '2 hours ago')"
        );
    };

    let n: i64 = caps[1]
        .parse()
        .context("failed to parse number in relative time")?;

    let (max_for_unit, minutes_per_unit) = match &caps[2] {
        "minute" => (MAX_RELATIVE_MINUTES, 1),
        "hour" => (MAX_RELATIVE_MINUTES / 60, 60),
        "day" => (MAX_RELATIVE_MINUTES / (60 * 24), 60 * 24),
        "week" => (MAX_RELATIVE_MINUTES / (60 * 24 * 7), 60 * 24 * 7),
        unit => anyhow::bail!("Unknown time unit: {unit}"),
    };

    if n > max_for_unit {
        anyhow::bail!("Relative time value too large: {n} {}", &caps[2]);
    }

    Ok(now - Duration::minutes(n * minutes_per_unit))
}

impl RangeArgs {
    /// The selected window; today when nothing is selected.
    pub fn window(&self, now: DateTime<Utc>) -> anyhow::Result<TimeWindow> {
        if let Some(since) = &self.since {
            return Ok(TimeWindow::Since(parse_datetime(since, now)?));
        }
        Ok(match (self.days, self.all, self.week) {
            (Some(days), _, _) => TimeWindow::Days(days),
            (None, true, _) => TimeWindow::ALL,
            (None, false, true) => TimeWindow::Days(7),
            (None, false, false) => TimeWindow::Days(1),
        })
    }
}

/// Opens the log, ensuring the parent directory exists.
pub fn open_log(config: &Config) -> anyhow::Result<PersistentLog> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    let log = PersistentLog::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    Ok(log.with_retry(config.retry_policy()))
}

/// A query service configured from `config`.
pub fn query_service<'a>(log: &'a PersistentLog, config: &Config) -> QueryService<'a> {
    QueryService::new(log)
        .with_gap_threshold(config.gap_threshold())
        .with_mode(config.segment_mode())
}

/// The session shown as `number` by `sessions --all`, reconstructed.
pub fn fetch_session(
    config: &Config,
    number: usize,
    source: Option<&str>,
) -> anyhow::Result<ReconstructedArtifact> {
    let index = session_index(number)?;
    let log = open_log(config)?;
    query_service(&log, config)
        .get_session_by_ordinal(index, source)?
        .with_context(|| format!("no session number {number}"))
}

/// Converts a 1-based session number into an index.
pub fn session_index(number: usize) -> anyhow::Result<usize> {
    number
        .checked_sub(1)
        .context("session numbers start at 1")
}

/// "1 note", "12 notes".
pub fn notes(count: usize) -> String {
    if count == 1 {
        "1 note".to_string()
    } else {
        format!("{count} notes")
    }
}
