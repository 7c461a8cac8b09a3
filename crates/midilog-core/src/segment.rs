//! Session segmentation by inactivity gap.
//!
//! A session is a maximal run of records in which consecutive timestamps are
//! closer than the gap threshold. A gap equal to or larger than the threshold
//! always starts a new session.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::StoredRecord;

/// Default inactivity gap that ends a session.
pub const DEFAULT_GAP_THRESHOLD: Duration = Duration::seconds(60);

/// How records from different sources are grouped before segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentMode {
    /// Each source is segmented on its own.
    #[default]
    PerSource,
    /// All sources form a single stream, split by wall-clock proximity only.
    Merged,
}

/// A run of records without an internal gap at or above the threshold.
///
/// Sessions are only built by the segmenter and always hold at least one
/// record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    source: Option<String>,
    records: Vec<StoredRecord>,
}

impl Session {
    fn start_with(record: StoredRecord, source: Option<&str>) -> Self {
        Self {
            source: source.map(str::to_string),
            records: vec![record],
        }
    }

    /// Timestamp of the first record.
    pub fn start(&self) -> DateTime<Utc> {
        self.records[0].captured_at
    }

    /// Timestamp of the last record.
    pub fn end(&self) -> DateTime<Utc> {
        self.records[self.records.len() - 1].captured_at
    }

    /// The records in capture order.
    pub fn records(&self) -> &[StoredRecord] {
        &self.records
    }

    /// The source this session was segmented for, `None` for a merged session.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Always false; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Splits records, already sorted by timestamp, into sessions.
///
/// Single pass with no lookahead. The previous timestamp is updated on every
/// record, so the gap is always measured between neighbours.
pub fn segment(records: Vec<StoredRecord>, gap_threshold: Duration) -> Vec<Session> {
    segment_tagged(records, gap_threshold, None)
}

fn segment_tagged(
    records: Vec<StoredRecord>,
    gap_threshold: Duration,
    source: Option<&str>,
) -> Vec<Session> {
    let mut sessions = Vec::new();
    let mut current: Option<Session> = None;
    let mut previous: Option<DateTime<Utc>> = None;

    for record in records {
        let timestamp = record.captured_at;
        let joins = previous.is_some_and(|prev| timestamp - prev < gap_threshold);
        match current.as_mut() {
            Some(session) if joins => session.records.push(record),
            _ => {
                if let Some(done) = current.replace(Session::start_with(record, source)) {
                    sessions.push(done);
                }
            }
        }
        previous = Some(timestamp);
    }

    sessions.extend(current);
    sessions
}

/// Segments each source independently and returns all sessions ordered by
/// start time, ties broken by source identity.
pub fn segment_by_source(records: Vec<StoredRecord>, gap_threshold: Duration) -> Vec<Session> {
    let mut by_source: BTreeMap<String, Vec<StoredRecord>> = BTreeMap::new();
    for record in records {
        by_source
            .entry(record.source.clone())
            .or_default()
            .push(record);
    }

    let mut sessions: Vec<Session> = by_source
        .into_iter()
        .flat_map(|(source, records)| segment_tagged(records, gap_threshold, Some(&source)))
        .collect();
    sessions.sort_by(|a, b| a.start().cmp(&b.start()).then_with(|| a.source.cmp(&b.source)));
    sessions
}

/// Segments records according to `mode`.
pub fn segment_with_mode(
    records: Vec<StoredRecord>,
    gap_threshold: Duration,
    mode: SegmentMode,
) -> Vec<Session> {
    match mode {
        SegmentMode::PerSource => segment_by_source(records, gap_threshold),
        SegmentMode::Merged => segment(records, gap_threshold),
    }
}
