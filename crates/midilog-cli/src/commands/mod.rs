//! CLI subcommand implementations.

pub mod capture;
pub mod export;
pub mod play;
pub mod sessions;
pub mod show;
pub mod status;
pub mod util;

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{DateTime, Duration, Utc};
    use midilog_core::{MidiEvent, RawEvent, SourceId};
    use midilog_db::PersistentLog;

    pub fn at(timestamp: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(timestamp)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn push(log: &PersistentLog, source: &str, timestamp: DateTime<Utc>, event: MidiEvent) {
        log.append(&RawEvent::new(
            timestamp,
            SourceId::new(source).unwrap(),
            event,
        ))
        .unwrap();
    }

    const fn on(note: u8) -> MidiEvent {
        MidiEvent::NoteOn {
            channel: 0,
            note,
            velocity: 90,
        }
    }

    const fn off(note: u8) -> MidiEvent {
        MidiEvent::NoteOff {
            channel: 0,
            note,
            velocity: 0,
        }
    }

    /// Four sessions over two days:
    /// - keys, 28.02.2025 09:00, 1 note
    /// - keys, 01.03.2025 20:15:00, 3 notes
    /// - pads, 01.03.2025 20:15:10, 1 note
    /// - keys, 01.03.2025 20:20, 1 note
    pub fn seed(log: &PersistentLog) {
        let morning = at("2025-02-28T09:00:00Z");
        push(log, "keys", morning, on(48));
        push(log, "keys", morning + Duration::milliseconds(250), off(48));

        let evening = at("2025-03-01T20:15:00Z");
        push(log, "keys", evening, on(60));
        push(log, "keys", evening + Duration::milliseconds(500), on(62));
        push(log, "keys", evening + Duration::milliseconds(1_500), off(60));
        push(log, "keys", evening + Duration::milliseconds(1_510), on(64));
        push(log, "pads", evening + Duration::seconds(10), on(40));
        push(log, "keys", evening + Duration::minutes(5), on(67));
    }

    /// Shortly after the last fixture event.
    pub fn now() -> DateTime<Utc> {
        at("2025-03-01T21:00:00Z")
    }
}
