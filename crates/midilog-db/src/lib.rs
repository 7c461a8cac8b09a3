//! Storage layer for the MIDI activity logger.
//!
//! Provides the append-only event log using `rusqlite`.
//!
//! # Thread Safety
//!
//! A `rusqlite::Connection` is `Send` but not `Sync`. [`PersistentLog`] keeps
//! its write handle behind a `Mutex`, so one log can be shared across
//! ingestion threads with `Arc<PersistentLog>`. Appends are serialized; the
//! handle is only ever refreshed while that lock is held.
//!
//! File-backed logs answer queries from a fresh read-only connection
//! (the database runs in WAL mode), so reads never wait on the writer lock.
//! In-memory logs have no second connection to read from and query through
//! the write handle.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in RFC 3339 format with microsecond
//! precision (e.g., `2025-03-01T20:15:30.123456Z`). This ensures:
//! - Lexicographic ordering matches chronological ordering
//! - Human-readable values in the database
//! - Timezone-aware (always UTC)
//!
//! ## Payload Storage
//!
//! The `payload` column holds the JSON form of a `MidiEvent` and the
//! `event_kind` column repeats its tag (e.g., `note_on`). Payloads are
//! bounded to 255 bytes, which every channel message fits comfortably.

mod query;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use midilog_core::{EventKind, RawEvent, StoredRecord};
use rusqlite::{Connection, OpenFlags, params};
use thiserror::Error;

pub use query::{QueryError, QueryService, SessionFailure, SessionListing, TimeWindow};

/// Maximum serialized payload length, in bytes.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failed to parse a stored timestamp.
    #[error("invalid timestamp for record {record_id}: {timestamp}")]
    TimestampParse {
        record_id: i64,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Append failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The event can never be stored; retrying would not help.
    #[error("rejected {kind} event from {source_id}: {reason}")]
    Rejected {
        source_id: String,
        kind: EventKind,
        reason: String,
    },
    /// Every attempt in the retry budget failed.
    #[error("append of {kind} event from {source_id} failed after {attempts} attempts")]
    Exhausted {
        source_id: String,
        kind: EventKind,
        attempts: u32,
        #[source]
        last: DbError,
    },
}

/// Acknowledgement of a durable append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Identity assigned to the new record.
    pub id: i64,
    /// Attempts it took, 1 when the first write succeeded.
    pub attempts: u32,
}

/// Bounded retry policy for appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// A row ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub captured_at: String,
    pub source: String,
    pub kind: EventKind,
    pub payload: String,
}

impl NewRecord {
    /// Serializes and bounds-checks an event for storage.
    pub fn from_event(event: &RawEvent) -> Result<Self, PersistError> {
        let kind = event.event.kind();
        let reject = |reason: String| PersistError::Rejected {
            source_id: event.source.to_string(),
            kind,
            reason,
        };

        event.event.validate().map_err(|e| reject(e.to_string()))?;
        let payload = serde_json::to_string(&event.event)
            .map_err(|e| reject(format!("payload not serializable: {e}")))?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(reject(format!(
                "payload is {} bytes, limit is {MAX_PAYLOAD_LEN}",
                payload.len()
            )));
        }

        Ok(Self {
            captured_at: format_timestamp(event.timestamp),
            source: event.source.to_string(),
            kind,
            payload,
        })
    }
}

/// Latest event timestamp grouped by source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLastEvent {
    pub source: String,
    pub last_event: String,
    pub event_count: i64,
}

/// The storage handle behind a [`PersistentLog`].
///
/// [`SqliteStore`] is the production implementation; the seam exists so
/// failures can be injected.
pub trait Store: Send {
    /// Writes one row, returning its identity.
    fn insert(&mut self, record: &NewRecord) -> Result<i64, DbError>;

    /// Reads rows at or after `since`, optionally for one source, ordered by
    /// timestamp then identity.
    fn records_since(
        &self,
        since: Option<DateTime<Utc>>,
        source: Option<&str>,
    ) -> Result<Vec<StoredRecord>, DbError>;

    /// Latest timestamp and row count per source.
    fn last_events_by_source(&self) -> Result<Vec<SourceLastEvent>, DbError>;

    /// Replaces the underlying handle with a fresh one.
    fn reconnect(&mut self) -> Result<(), DbError>;
}

/// `SQLite` storage handle.
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = open_file(path)?;
        init(&conn)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        init(&conn)?;
        Ok(Self { conn, path: None })
    }

    /// The backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Store for SqliteStore {
    fn insert(&mut self, record: &NewRecord) -> Result<i64, DbError> {
        self.conn.execute(
            "INSERT INTO midi_log (captured_at, source, event_kind, payload) VALUES (?, ?, ?, ?)",
            params![
                record.captured_at,
                record.source,
                record.kind.as_str(),
                record.payload
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn records_since(
        &self,
        since: Option<DateTime<Utc>>,
        source: Option<&str>,
    ) -> Result<Vec<StoredRecord>, DbError> {
        select_records(&self.conn, since, source)
    }

    fn last_events_by_source(&self) -> Result<Vec<SourceLastEvent>, DbError> {
        select_last_events(&self.conn)
    }

    fn reconnect(&mut self) -> Result<(), DbError> {
        let Some(path) = self.path.as_deref() else {
            // A second in-memory connection would be a different, empty database.
            tracing::debug!("in-memory store keeps its connection");
            return Ok(());
        };
        tracing::warn!(path = %path.display(), "refreshing database connection");
        let conn = open_file(path)?;
        init(&conn)?;
        self.conn = conn;
        Ok(())
    }
}

fn open_file(path: &Path) -> Result<Connection, DbError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    Ok(conn)
}

fn open_read_only(path: &Path) -> Result<Connection, DbError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Initializes the database schema.
///
/// This is idempotent - safe to call on an already-initialized database.
fn init(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "
        -- midi_log: one row per captured MIDI message
        -- captured_at: RFC 3339 UTC (e.g., '2025-03-01T20:15:30.123456Z')
        -- event_kind: message kind (e.g., 'note_on')
        -- payload: JSON object with the message fields
        CREATE TABLE IF NOT EXISTS midi_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            captured_at TEXT NOT NULL,
            source TEXT NOT NULL CHECK (length(source) <= 128),
            event_kind TEXT NOT NULL CHECK (length(event_kind) <= 128),
            payload TEXT NOT NULL CHECK (length(payload) <= 255)
        );

        CREATE INDEX IF NOT EXISTS idx_midi_log_captured_at ON midi_log(captured_at);
        CREATE INDEX IF NOT EXISTS idx_midi_log_source ON midi_log(source, captured_at);
        ",
    )?;
    Ok(())
}

fn select_records(
    conn: &Connection,
    since: Option<DateTime<Utc>>,
    source: Option<&str>,
) -> Result<Vec<StoredRecord>, DbError> {
    let since = since.map(format_timestamp);
    let mut stmt = conn.prepare(
        "
        SELECT id, captured_at, source, event_kind, payload
        FROM midi_log
        WHERE (?1 IS NULL OR captured_at >= ?1)
          AND (?2 IS NULL OR source = ?2)
        ORDER BY captured_at ASC, id ASC
        ",
    )?;
    let rows = stmt.query_map(params![since, source], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;
    let mut records = Vec::new();
    for row in rows {
        let (id, captured_at, source, kind, payload) = row?;
        records.push(StoredRecord {
            id,
            captured_at: parse_timestamp(&captured_at, id)?,
            source,
            kind,
            payload,
        });
    }
    Ok(records)
}

fn select_last_events(conn: &Connection) -> Result<Vec<SourceLastEvent>, DbError> {
    let mut stmt = conn.prepare(
        "
        SELECT source, MAX(captured_at) AS last_event, COUNT(*)
        FROM midi_log
        GROUP BY source
        ORDER BY last_event DESC, source ASC
        ",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(SourceLastEvent {
            source: row.get(0)?,
            last_event: row.get(1)?,
            event_count: row.get(2)?,
        })
    })?;
    let mut sources = Vec::new();
    for row in rows {
        sources.push(row?);
    }
    Ok(sources)
}

fn parse_timestamp(timestamp: &str, record_id: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            record_id,
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

struct Writer<S> {
    store: S,
    /// Bumped on every successful handle refresh.
    generation: u64,
}

/// Append-only durable event log.
///
/// Shared by reference (`Arc<PersistentLog>`) between ingestion tasks and
/// query callers. See the [module documentation](self) for the locking
/// discipline.
pub struct PersistentLog<S = SqliteStore> {
    writer: Mutex<Writer<S>>,
    read_path: Option<PathBuf>,
    retry: RetryPolicy,
}

impl PersistentLog<SqliteStore> {
    /// Opens a file-backed log, creating the database if necessary.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let store = SqliteStore::open(path)?;
        let mut log = Self::with_store(store);
        log.read_path = Some(path.to_path_buf());
        Ok(log)
    }

    /// Opens an in-memory log.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Ok(Self::with_store(SqliteStore::open_in_memory()?))
    }
}

impl<S: Store> PersistentLog<S> {
    /// Wraps a storage handle. Queries go through the same handle.
    pub fn with_store(store: S) -> Self {
        Self {
            writer: Mutex::new(Writer {
                store,
                generation: 0,
            }),
            read_path: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the retry policy. A zero attempt budget is treated as one.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            ..retry
        };
        self
    }

    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn lock_writer(&self) -> MutexGuard<'_, Writer<S>> {
        // The guarded state is a connection plus a counter; a panic while
        // holding it leaves nothing half-updated.
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Durably appends one event.
    ///
    /// A failed write is retried up to the policy's attempt budget. Before
    /// each retry the lock is released for the backoff pause, then the
    /// storage handle is refreshed (unless another writer already refreshed
    /// the handle that failed) and the insert is attempted again.
    pub fn append(&self, event: &RawEvent) -> Result<Ack, PersistError> {
        let record = NewRecord::from_event(event)?;
        tracing::debug!(
            source = %record.source,
            kind = %record.kind,
            captured_at = %record.captured_at,
            "append event"
        );

        let mut stale_generation = None;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_insert(&record, stale_generation) {
                Ok(id) => {
                    if attempt > 1 {
                        tracing::info!(
                            source = %record.source,
                            kind = %record.kind,
                            attempt,
                            "append recovered"
                        );
                    }
                    return Ok(Ack {
                        id,
                        attempts: attempt,
                    });
                }
                Err((err, generation)) => {
                    tracing::warn!(
                        source = %record.source,
                        kind = %record.kind,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %err,
                        "append failed"
                    );
                    if attempt >= self.retry.max_attempts {
                        tracing::error!(
                            source = %record.source,
                            kind = %record.kind,
                            attempts = attempt,
                            "giving up on event"
                        );
                        return Err(PersistError::Exhausted {
                            source_id: record.source,
                            kind: record.kind,
                            attempts: attempt,
                            last: err,
                        });
                    }
                    stale_generation = Some(generation);
                    std::thread::sleep(self.retry.backoff);
                }
            }
        }
    }

    /// One attempt under the writer lock. On failure, returns the error with
    /// the generation of the handle that produced it.
    fn try_insert(
        &self,
        record: &NewRecord,
        stale_generation: Option<u64>,
    ) -> Result<i64, (DbError, u64)> {
        let mut writer = self.lock_writer();
        if stale_generation == Some(writer.generation) {
            let generation = writer.generation;
            writer
                .store
                .reconnect()
                .map_err(|err| (err, generation))?;
            writer.generation += 1;
        }
        let generation = writer.generation;
        writer
            .store
            .insert(record)
            .map_err(|err| (err, generation))
    }

    /// Reads records at or after `since` (all history when `None`),
    /// optionally for one source, ordered by timestamp then identity.
    ///
    /// No matching rows is an empty vector, not an error.
    pub fn query(
        &self,
        since: Option<DateTime<Utc>>,
        source: Option<&str>,
    ) -> Result<Vec<StoredRecord>, DbError> {
        match &self.read_path {
            Some(path) => select_records(&open_read_only(path)?, since, source),
            None => self.lock_writer().store.records_since(since, source),
        }
    }

    /// Lists the last event timestamp per source, ordered by most recent.
    pub fn last_event_times_by_source(&self) -> Result<Vec<SourceLastEvent>, DbError> {
        match &self.read_path {
            Some(path) => select_last_events(&open_read_only(path)?),
            None => self.lock_writer().store.last_events_by_source(),
        }
    }
}
