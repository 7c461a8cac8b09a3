//! Session listing over the persistent log.
//!
//! Reads a time window, segments it and reconstructs every session into a
//! MIDI artifact. A session that fails to reconstruct is reported on its own
//! and never hides the others.

use chrono::{DateTime, Duration, Utc};
use midilog_core::{
    DEFAULT_GAP_THRESHOLD, ReconstructError, ReconstructedArtifact, SegmentMode, Session,
    reconstruct, segment_with_mode,
};
use rayon::prelude::*;
use thiserror::Error;

use crate::{DbError, PersistentLog, SqliteStore, Store};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Reconstruct(#[from] ReconstructError),
}

/// Which part of history to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    /// The last `n` days; zero means all history.
    Days(u32),
    /// Everything at or after an instant.
    Since(DateTime<Utc>),
}

impl TimeWindow {
    pub const ALL: Self = Self::Days(0);

    /// Lower bound for the window, `None` for all history. A window reaching
    /// past the earliest representable instant covers all history too.
    pub fn cutoff(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Days(0) => None,
            Self::Days(days) => {
                Duration::try_days(i64::from(days)).and_then(|span| now.checked_sub_signed(span))
            }
            Self::Since(since) => Some(since),
        }
    }
}

/// A session that could not be reconstructed.
#[derive(Debug)]
pub struct SessionFailure {
    pub ordinal: usize,
    pub start: DateTime<Utc>,
    pub source: Option<String>,
    pub error: ReconstructError,
}

/// Result of listing sessions: artifacts newest first, plus failures.
#[derive(Debug, Default)]
pub struct SessionListing {
    pub artifacts: Vec<ReconstructedArtifact>,
    pub failures: Vec<SessionFailure>,
}

impl SessionListing {
    /// True when the window held no sessions at all.
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty() && self.failures.is_empty()
    }

    /// Sounding events across all reconstructed sessions.
    pub fn total_event_count(&self) -> usize {
        self.artifacts.iter().map(|a| a.event_count).sum()
    }
}

/// Lists and fetches reconstructed sessions.
pub struct QueryService<'a, S = SqliteStore> {
    log: &'a PersistentLog<S>,
    gap_threshold: Duration,
    mode: SegmentMode,
}

impl<'a, S: Store> QueryService<'a, S> {
    pub const fn new(log: &'a PersistentLog<S>) -> Self {
        Self {
            log,
            gap_threshold: DEFAULT_GAP_THRESHOLD,
            mode: SegmentMode::PerSource,
        }
    }

    #[must_use]
    pub const fn with_gap_threshold(mut self, gap_threshold: Duration) -> Self {
        self.gap_threshold = gap_threshold;
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: SegmentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sessions in `window`, optionally for one source, newest first.
    pub fn list_sessions(
        &self,
        window: TimeWindow,
        source: Option<&str>,
    ) -> Result<SessionListing, QueryError> {
        self.list_sessions_at(window, source, Utc::now())
    }

    /// [`list_sessions`](Self::list_sessions) with an explicit current time.
    pub fn list_sessions_at(
        &self,
        window: TimeWindow,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SessionListing, QueryError> {
        let sessions = self.sessions(window.cutoff(now), source)?;
        tracing::debug!(
            sessions = sessions.len(),
            source = source.unwrap_or("*"),
            "listing sessions"
        );

        let results: Vec<_> = sessions
            .par_iter()
            .enumerate()
            .map(|(ordinal, session)| {
                let tag = session_tag(session, source);
                (ordinal, session, reconstruct(session, ordinal, tag))
            })
            .collect();

        let mut listing = SessionListing::default();
        for (ordinal, session, result) in results.into_iter().rev() {
            match result {
                Ok(artifact) => listing.artifacts.push(artifact),
                Err(error) => {
                    tracing::warn!(
                        ordinal,
                        start = %session.start(),
                        error = %error,
                        "skipping session"
                    );
                    listing.failures.push(SessionFailure {
                        ordinal,
                        start: session.start(),
                        source: session.source().map(str::to_string),
                        error,
                    });
                }
            }
        }
        Ok(listing)
    }

    /// The session at `index` in the newest-first listing of all history.
    ///
    /// Out of range is `Ok(None)`. Only the selected session is
    /// reconstructed.
    pub fn get_session_by_ordinal(
        &self,
        index: usize,
        source: Option<&str>,
    ) -> Result<Option<ReconstructedArtifact>, QueryError> {
        let sessions = self.sessions(None, source)?;
        let Some(ordinal) = sessions.len().checked_sub(index.saturating_add(1)) else {
            return Ok(None);
        };
        let session = &sessions[ordinal];
        let artifact = reconstruct(session, ordinal, session_tag(session, source))?;
        Ok(Some(artifact))
    }

    /// Sessions in chronological order.
    fn sessions(
        &self,
        since: Option<DateTime<Utc>>,
        source: Option<&str>,
    ) -> Result<Vec<Session>, QueryError> {
        let records = self.log.query(since, source)?;
        Ok(segment_with_mode(records, self.gap_threshold, self.mode))
    }
}

fn session_tag<'s>(session: &'s Session, filter: Option<&'s str>) -> Option<&'s str> {
    filter.or_else(|| session.source())
}
