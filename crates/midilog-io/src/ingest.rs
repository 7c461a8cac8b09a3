//! Event ingestion: one persisting task per open MIDI source.
//!
//! The [`Ingestor`] supervises the set of open sources. On every rescan tick
//! it re-enumerates devices, opens sources that appeared, drops handles of
//! sources that vanished and reaps tasks whose source closed by itself. A
//! source that fails to open is logged and tried again on the next tick.
//!
//! Each source task persists events in arrival order and waits for every
//! append (retries included) before taking the next one, so a slow or failing
//! source only ever holds up itself. Driver callbacks never block: a source
//! queues at most [`SOURCE_QUEUE_CAPACITY`] events, and while its task is
//! stalled further events from that source are dropped and counted.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use midilog_core::{MidiEvent, RawEvent, SourceId};
use midilog_db::{PersistentLog, SqliteStore, Store};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ports::CaptureError;

/// Default interval between device rescans.
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Events a source may queue ahead of its persisting task.
pub const SOURCE_QUEUE_CAPACITY: usize = 1024;

/// An event stamped at the moment the driver delivered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Captured {
    pub at: DateTime<Utc>,
    pub event: MidiEvent,
}

pub type EventSender = mpsc::Sender<Captured>;

/// Queues an event without blocking the caller.
///
/// A full queue drops the event and bumps `overflowed`; a closed queue means
/// the source is being detached and the event is discarded silently.
pub fn offer(sender: &EventSender, source: &str, captured: Captured, overflowed: &mut u64) {
    match sender.try_send(captured) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            *overflowed += 1;
            tracing::warn!(
                source,
                overflowed = *overflowed,
                "source queue full, event dropped"
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// An open input. Dropping it closes the input and its event channel.
pub trait SourceHandle {
    fn name(&self) -> &str;
}

/// Discovers and opens MIDI inputs.
pub trait DeviceEnumerator {
    /// Names of the inputs currently present.
    fn list_active_sources(&self) -> Result<BTreeSet<String>, CaptureError>;

    /// Opens an input that delivers its events into `sender` until the
    /// returned handle is dropped.
    fn open(&self, name: &str, sender: EventSender) -> Result<Box<dyn SourceHandle>, CaptureError>;
}

/// Counters reported when ingestion stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Sources opened over the whole run, re-opens included.
    pub sources_opened: usize,
    pub persisted: u64,
    /// Events given up on after a rejected or exhausted append.
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct TaskStats {
    persisted: u64,
    dropped: u64,
}

impl IngestStats {
    fn absorb(&mut self, task: TaskStats) {
        self.persisted += task.persisted;
        self.dropped += task.dropped;
    }
}

struct ActiveSource {
    handle: Box<dyn SourceHandle>,
    task: JoinHandle<TaskStats>,
}

/// Supervises capture from every present source into a [`PersistentLog`].
pub struct Ingestor<E, S = SqliteStore> {
    enumerator: E,
    log: Arc<PersistentLog<S>>,
    rescan_interval: Duration,
    active: HashMap<String, ActiveSource>,
    stats: IngestStats,
}

impl<E: DeviceEnumerator, S: Store + 'static> Ingestor<E, S> {
    pub fn new(enumerator: E, log: Arc<PersistentLog<S>>) -> Self {
        Self {
            enumerator,
            log,
            rescan_interval: DEFAULT_RESCAN_INTERVAL,
            active: HashMap::new(),
            stats: IngestStats::default(),
        }
    }

    /// Sets the rescan period; anything under a millisecond is rounded up.
    #[must_use]
    pub fn with_rescan_interval(mut self, interval: Duration) -> Self {
        self.rescan_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Captures until `shutdown` resolves, then closes every source and waits
    /// for in-flight appends.
    pub async fn run<F>(mut self, shutdown: F) -> IngestStats
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.rescan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => self.rescan().await,
            }
        }

        tracing::info!(sources = self.active.len(), "stopping capture");
        let names: Vec<String> = self.active.keys().cloned().collect();
        for name in names {
            self.detach(&name).await;
        }
        tracing::info!(
            persisted = self.stats.persisted,
            dropped = self.stats.dropped,
            "capture stopped"
        );
        self.stats
    }

    async fn rescan(&mut self) {
        let closed: Vec<String> = self
            .active
            .iter()
            .filter(|(_, source)| source.task.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        for name in closed {
            tracing::info!(source = %name, "source closed");
            self.detach(&name).await;
        }

        let present = match self.enumerator.list_active_sources() {
            Ok(present) => present,
            Err(err) => {
                tracing::warn!(error = %err, "device enumeration failed");
                return;
            }
        };

        let vanished: Vec<String> = self
            .active
            .keys()
            .filter(|name| !present.contains(*name))
            .cloned()
            .collect();
        for name in vanished {
            tracing::info!(source = %name, "source detached");
            self.detach(&name).await;
        }

        for name in present {
            if !self.active.contains_key(&name) {
                self.attach(name);
            }
        }
    }

    fn attach(&mut self, name: String) {
        let source = match SourceId::new(name.as_str()) {
            Ok(source) => source,
            Err(err) => {
                tracing::warn!(source = %name, error = %err, "skipping source");
                return;
            }
        };
        let (sender, receiver) = mpsc::channel(SOURCE_QUEUE_CAPACITY);
        match self.enumerator.open(&name, sender) {
            Ok(handle) => {
                tracing::info!(source = %handle.name(), "source attached");
                let task = tokio::spawn(persist_source(Arc::clone(&self.log), source, receiver));
                self.active.insert(name, ActiveSource { handle, task });
                self.stats.sources_opened += 1;
            }
            Err(err) => {
                tracing::warn!(source = %name, error = %err, "source unavailable");
            }
        }
    }

    /// Drops the source's handle and waits for its task to drain.
    async fn detach(&mut self, name: &str) {
        let Some(ActiveSource { handle, task }) = self.active.remove(name) else {
            return;
        };
        drop(handle);
        match task.await {
            Ok(task_stats) => self.stats.absorb(task_stats),
            Err(err) => tracing::error!(source = %name, error = %err, "source task failed"),
        }
    }
}

async fn persist_source<S: Store + 'static>(
    log: Arc<PersistentLog<S>>,
    source: SourceId,
    mut receiver: mpsc::Receiver<Captured>,
) -> TaskStats {
    let mut stats = TaskStats::default();
    while let Some(captured) = receiver.recv().await {
        let event = RawEvent::new(captured.at, source.clone(), captured.event);
        let log = Arc::clone(&log);
        match tokio::task::spawn_blocking(move || log.append(&event)).await {
            Ok(Ok(_)) => stats.persisted += 1,
            Ok(Err(err)) => {
                tracing::error!(source = %source, error = %err, "event dropped");
                stats.dropped += 1;
            }
            Err(err) => {
                tracing::error!(source = %source, error = %err, "append task failed");
                stats.dropped += 1;
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use midilog_core::StoredRecord;
    use midilog_db::{DbError, NewRecord, RetryPolicy, SourceLastEvent};

    /// Devices controlled by the test; open handles expose their senders.
    #[derive(Clone, Default)]
    struct FakeDevices {
        present: Arc<Mutex<BTreeSet<String>>>,
        broken: Arc<Mutex<BTreeSet<String>>>,
        senders: Arc<Mutex<HashMap<String, EventSender>>>,
    }

    impl FakeDevices {
        fn plug(&self, name: &str) {
            self.present.lock().unwrap().insert(name.to_string());
        }

        fn unplug(&self, name: &str) {
            self.present.lock().unwrap().remove(name);
        }

        fn break_source(&self, name: &str) {
            self.broken.lock().unwrap().insert(name.to_string());
        }

        fn is_open(&self, name: &str) -> bool {
            self.senders.lock().unwrap().contains_key(name)
        }

        fn emit(&self, name: &str, offset_ms: i64, event: MidiEvent) {
            let at = DateTime::parse_from_rfc3339("2025-03-01T20:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
                + chrono::Duration::milliseconds(offset_ms);
            let senders = self.senders.lock().unwrap();
            senders[name].try_send(Captured { at, event }).unwrap();
        }

        async fn wait_until(&self, check: impl Fn(&Self) -> bool) {
            for _ in 0..500 {
                if check(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("condition not reached");
        }
    }

    struct FakeHandle {
        name: String,
        senders: Arc<Mutex<HashMap<String, EventSender>>>,
    }

    impl SourceHandle for FakeHandle {
        fn name(&self) -> &str {
            &self.name
        }
    }

    impl Drop for FakeHandle {
        fn drop(&mut self) {
            self.senders.lock().unwrap().remove(&self.name);
        }
    }

    impl DeviceEnumerator for FakeDevices {
        fn list_active_sources(&self) -> Result<BTreeSet<String>, CaptureError> {
            Ok(self.present.lock().unwrap().clone())
        }

        fn open(
            &self,
            name: &str,
            sender: EventSender,
        ) -> Result<Box<dyn SourceHandle>, CaptureError> {
            if self.broken.lock().unwrap().contains(name) {
                return Err(CaptureError::ConnectionFailed(name.to_string()));
            }
            self.senders
                .lock()
                .unwrap()
                .insert(name.to_string(), sender);
            Ok(Box::new(FakeHandle {
                name: name.to_string(),
                senders: Arc::clone(&self.senders),
            }))
        }
    }

    fn note(note: u8) -> MidiEvent {
        MidiEvent::NoteOn {
            channel: 0,
            note,
            velocity: 100,
        }
    }

    #[tokio::test]
    async fn sources_are_captured_independently() {
        let devices = FakeDevices::default();
        devices.plug("keys");
        devices.plug("pads");
        devices.plug("broken");
        devices.break_source("broken");

        let log = Arc::new(PersistentLog::open_in_memory().unwrap());
        let ingestor = Ingestor::new(devices.clone(), Arc::clone(&log))
            .with_rescan_interval(Duration::from_millis(10));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let driver = async {
            devices
                .wait_until(|d| d.is_open("keys") && d.is_open("pads"))
                .await;
            devices.emit("keys", 0, note(60));
            devices.emit("pads", 5, note(40));
            devices.emit("keys", 10, note(62));
            stop.send(()).unwrap();
        };
        let (stats, ()) = tokio::join!(
            ingestor.run(async {
                let _ = stopped.await;
            }),
            driver
        );

        assert_eq!(stats.persisted, 3);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.sources_opened, 2);
        let keys = log.query(None, Some("keys")).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].decode().unwrap(), note(60));
        assert_eq!(keys[1].decode().unwrap(), note(62));
        assert_eq!(log.query(None, Some("pads")).unwrap().len(), 1);
        assert!(log.query(None, Some("broken")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn rescan_follows_plug_and_unplug() {
        let devices = FakeDevices::default();
        devices.plug("keys");

        let log = Arc::new(PersistentLog::open_in_memory().unwrap());
        let ingestor = Ingestor::new(devices.clone(), Arc::clone(&log))
            .with_rescan_interval(Duration::from_millis(10));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let driver = async {
            devices.wait_until(|d| d.is_open("keys")).await;
            devices.emit("keys", 0, note(60));
            devices.unplug("keys");
            devices.wait_until(|d| !d.is_open("keys")).await;

            devices.plug("keys");
            devices.plug("pads");
            devices
                .wait_until(|d| d.is_open("keys") && d.is_open("pads"))
                .await;
            devices.emit("pads", 100, note(40));
            stop.send(()).unwrap();
        };
        let (stats, ()) = tokio::join!(
            ingestor.run(async {
                let _ = stopped.await;
            }),
            driver
        );

        assert_eq!(stats.sources_opened, 3);
        assert_eq!(stats.persisted, 2);
        assert_eq!(log.query(None, None).unwrap().len(), 2);
    }

    fn notes_of<S: Store>(log: &Arc<PersistentLog<S>>, source: &str) -> Vec<u8> {
        log.query(None, Some(source))
            .unwrap()
            .iter()
            .map(|record| match record.decode().unwrap() {
                MidiEvent::NoteOn { note, .. } => note,
                other => panic!("unexpected event {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn unplugging_one_source_leaves_the_other_capturing() {
        let devices = FakeDevices::default();
        devices.plug("keys");
        devices.plug("pads");

        let log = Arc::new(PersistentLog::open_in_memory().unwrap());
        let ingestor = Ingestor::new(devices.clone(), Arc::clone(&log))
            .with_rescan_interval(Duration::from_millis(10));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let driver = async {
            devices
                .wait_until(|d| d.is_open("keys") && d.is_open("pads"))
                .await;
            devices.emit("keys", 0, note(60));
            devices.emit("pads", 1, note(30));
            devices.emit("keys", 2, note(61));
            devices.unplug("keys");

            // Several rescan ticks pass while pads keeps playing.
            for pad in 31..41 {
                devices.emit("pads", 10 * i64::from(pad), note(pad));
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            devices.wait_until(|d| !d.is_open("keys")).await;
            devices.emit("pads", 500, note(41));
            stop.send(()).unwrap();
        };
        let (stats, ()) = tokio::join!(
            ingestor.run(async {
                let _ = stopped.await;
            }),
            driver
        );

        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.sources_opened, 2);
        assert_eq!(notes_of(&log, "keys"), vec![60, 61]);
        assert_eq!(notes_of(&log, "pads"), (30..42).collect::<Vec<u8>>());
    }

    /// Fails every insert for one source and journals what reached storage.
    struct StallingStore {
        inner: SqliteStore,
        stalled: &'static str,
        journal: Arc<Mutex<Vec<String>>>,
    }

    impl Store for StallingStore {
        fn insert(&mut self, record: &NewRecord) -> Result<i64, DbError> {
            if record.source == self.stalled {
                self.journal
                    .lock()
                    .unwrap()
                    .push(format!("{} failed", record.source));
                return Err(DbError::TimestampParse {
                    record_id: 0,
                    timestamp: record.captured_at.clone(),
                    source: DateTime::parse_from_rfc3339("unavailable").unwrap_err(),
                });
            }
            let id = self.inner.insert(record)?;
            self.journal
                .lock()
                .unwrap()
                .push(format!("{} stored", record.source));
            Ok(id)
        }

        fn records_since(
            &self,
            since: Option<DateTime<Utc>>,
            source: Option<&str>,
        ) -> Result<Vec<StoredRecord>, DbError> {
            self.inner.records_since(since, source)
        }

        fn last_events_by_source(&self) -> Result<Vec<SourceLastEvent>, DbError> {
            self.inner.last_events_by_source()
        }

        fn reconnect(&mut self) -> Result<(), DbError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stalled_appends_hold_up_only_their_own_source() {
        let devices = FakeDevices::default();
        devices.plug("keys");
        devices.plug("pads");

        let journal = Arc::new(Mutex::new(Vec::new()));
        let store = StallingStore {
            inner: SqliteStore::open_in_memory().unwrap(),
            stalled: "keys",
            journal: Arc::clone(&journal),
        };
        let log = Arc::new(PersistentLog::with_store(store).with_retry(RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(300),
        }));
        let ingestor = Ingestor::new(devices.clone(), Arc::clone(&log))
            .with_rescan_interval(Duration::from_millis(10));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let driver = async {
            devices
                .wait_until(|d| d.is_open("keys") && d.is_open("pads"))
                .await;
            devices.emit("keys", 0, note(60));
            devices.wait_until(|_| !journal.lock().unwrap().is_empty()).await;
            devices.emit("pads", 1, note(30));
            devices.emit("pads", 2, note(31));
            devices.emit("pads", 3, note(32));

            let pads_stored = |_: &FakeDevices| {
                let journal = journal.lock().unwrap();
                journal.iter().filter(|e| *e == "pads stored").count() == 3
            };
            devices.wait_until(pads_stored).await;
            let keys_attempts = journal
                .lock()
                .unwrap()
                .iter()
                .filter(|e| *e == "keys failed")
                .count();
            assert!(keys_attempts < 3, "pads waited for keys to give up");
            stop.send(()).unwrap();
        };
        let (stats, ()) = tokio::join!(
            ingestor.run(async {
                let _ = stopped.await;
            }),
            driver
        );

        assert_eq!(stats.persisted, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(notes_of(&log, "pads"), vec![30, 31, 32]);
        assert!(notes_of(&log, "keys").is_empty());
        let failures = journal.lock().unwrap();
        assert_eq!(failures.iter().filter(|e| *e == "keys failed").count(), 3);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (sender, mut receiver) = mpsc::channel(2);
        let at = Utc::now();
        let mut overflowed = 0;
        for pitch in [60, 61, 62, 63] {
            let captured = Captured {
                at,
                event: note(pitch),
            };
            offer(&sender, "keys", captured, &mut overflowed);
        }
        assert_eq!(overflowed, 2);
        assert_eq!(receiver.try_recv().unwrap().event, note(60));
        assert_eq!(receiver.try_recv().unwrap().event, note(61));
        assert!(receiver.try_recv().is_err());

        drop(receiver);
        let late = Captured {
            at,
            event: note(64),
        };
        offer(&sender, "keys", late, &mut overflowed);
        assert_eq!(overflowed, 2);
    }

    #[tokio::test]
    async fn failed_append_does_not_stop_the_source() {
        let devices = FakeDevices::default();
        devices.plug("keys");

        let log = Arc::new(PersistentLog::open_in_memory().unwrap());
        let ingestor = Ingestor::new(devices.clone(), Arc::clone(&log))
            .with_rescan_interval(Duration::from_millis(10));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let driver = async {
            devices.wait_until(|d| d.is_open("keys")).await;
            devices.emit("keys", 0, note(200));
            devices.emit("keys", 10, note(60));
            stop.send(()).unwrap();
        };
        let (stats, ()) = tokio::join!(
            ingestor.run(async {
                let _ = stopped.await;
            }),
            driver
        );

        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.persisted, 1);
        let records = log.query(None, None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decode().unwrap(), note(60));
    }
}
