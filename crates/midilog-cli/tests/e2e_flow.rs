//! End-to-end tests driving the `midilog` binary.
//!
//! Tests the query side of the pipeline: persist → segment → reconstruct →
//! list / export / show, against a temporary database and config file.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use chrono::{DateTime, Duration, Utc};
use midilog_core::{MidiEvent, RawEvent, SourceId, decode_artifact};
use midilog_db::PersistentLog;
use tempfile::TempDir;

fn midilog_binary() -> String {
    env!("CARGO_BIN_EXE_midilog").to_string()
}

struct Fixture {
    temp: TempDir,
    config: PathBuf,
    database: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let database = temp.path().join("data").join("midi_log.db");
        let config = temp.path().join("midilog.toml");
        std::fs::write(
            &config,
            format!("database_path = {:?}\n", database.display().to_string()),
        )
        .unwrap();
        Self {
            temp,
            config,
            database,
        }
    }

    fn log(&self) -> PersistentLog {
        std::fs::create_dir_all(self.database.parent().unwrap()).unwrap();
        PersistentLog::open(&self.database).unwrap()
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(midilog_binary())
            .env("HOME", self.temp.path())
            .env("XDG_CONFIG_HOME", self.temp.path().join("config"))
            .env_remove("RUST_LOG")
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .output()
            .expect("failed to run midilog")
    }

    fn stdout(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "midilog {args:?} should succeed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout).unwrap()
    }
}

fn note_on(log: &PersistentLog, source: &str, at: DateTime<Utc>, note: u8) {
    log.append(&RawEvent::new(
        at,
        SourceId::new(source).unwrap(),
        MidiEvent::NoteOn {
            channel: 0,
            note,
            velocity: 100,
        },
    ))
    .unwrap();
}

fn fixed(timestamp: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(timestamp)
        .unwrap()
        .with_timezone(&Utc)
}

/// Two sessions on one device, the second two minutes after the first.
fn seed_history(log: &PersistentLog) {
    let start = fixed("2025-03-01T20:15:00Z");
    for (offset_ms, note) in [(0, 60), (500, 62), (1_500, 64), (1_510, 65)] {
        note_on(log, "Keystation", start + Duration::milliseconds(offset_ms), note);
    }
    note_on(log, "Keystation", start + Duration::minutes(2), 67);
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_sessions_lists_history_newest_first() {
    let fixture = Fixture::new();
    seed_history(&fixture.log());

    let output = fixture.stdout(&["sessions", "--all"]);
    assert_eq!(
        output,
        "01.03.2025\n  \
         1. 20:17  Keystation  1 note  session_1_Keystation_2025-03-01_20-17.mid\n  \
         2. 20:15  Keystation  4 notes  session_0_Keystation_2025-03-01_20-15.mid\n\
         Total: 5 notes in 2 sessions\n"
    );
}

#[test]
fn test_empty_range_is_not_an_error() {
    let fixture = Fixture::new();
    seed_history(&fixture.log());

    let output = fixture.stdout(&["sessions", "--today"]);
    assert_eq!(output, "No sessions for this range.\n");
}

#[test]
fn test_recent_events_show_up_today() {
    let fixture = Fixture::new();
    let log = fixture.log();
    let recent = Utc::now() - Duration::minutes(10);
    note_on(&log, "Keystation", recent, 60);
    note_on(&log, "Keystation", recent + Duration::seconds(1), 64);
    drop(log);

    let output = fixture.stdout(&["sessions", "--today", "--json"]);
    let value: serde_json::Value = serde_json::from_str(&output).unwrap();
    assert_eq!(value["sessions"].as_array().unwrap().len(), 1);
    assert_eq!(value["total_notes"], 2);
}

#[test]
fn test_export_writes_decodable_files() {
    let fixture = Fixture::new();
    seed_history(&fixture.log());
    let out = fixture.temp.path().join("exported");

    let output = fixture.stdout(&["export", "--all", "--out", out.to_str().unwrap()]);
    assert!(output.contains("Exported 2 sessions"));
    assert_eq!(
        files_in(&out),
        vec![
            "session_0_Keystation_2025-03-01_20-15.mid",
            "session_1_Keystation_2025-03-01_20-17.mid",
        ]
    );

    let bytes = std::fs::read(out.join("session_0_Keystation_2025-03-01_20-15.mid")).unwrap();
    let deltas: Vec<u32> = decode_artifact(&bytes)
        .unwrap()
        .iter()
        .map(|e| e.delta_ms)
        .collect();
    assert_eq!(deltas, vec![0, 500, 1_000, 10]);
}

#[test]
fn test_show_prints_session_events() {
    let fixture = Fixture::new();
    seed_history(&fixture.log());

    let output = fixture.stdout(&["show", "2"]);
    assert!(output.starts_with("Session 2: 01.03.2025 20:15 (Keystation)\n"));
    assert!(output.contains("    1500 ms  note_on channel=0 note=64 velocity=100\n"));
}

#[test]
fn test_show_unknown_session_fails() {
    let fixture = Fixture::new();
    seed_history(&fixture.log());

    let output = fixture.run(&["show", "3"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no session number 3"));

    let output = fixture.run(&["show", "0"]);
    assert!(!output.status.success());
}

#[test]
fn test_source_filter_and_environment_override() {
    let fixture = Fixture::new();
    let log = fixture.log();
    seed_history(&log);
    note_on(&log, "Pads", fixed("2025-03-01T20:15:05Z"), 40);
    drop(log);

    let output = fixture.stdout(&["sessions", "--all", "--source", "Pads"]);
    assert!(output.contains("session_0_Pads_2025-03-01_20-15.mid"));
    assert!(output.ends_with("Total: 1 note in 1 sessions\n"));

    // A five minute gap threshold joins both Keystation sessions.
    let output = Command::new(midilog_binary())
        .env("HOME", fixture.temp.path())
        .env("XDG_CONFIG_HOME", fixture.temp.path().join("config"))
        .env("MIDILOG_GAP_THRESHOLD_SECS", "300")
        .arg("--config")
        .arg(&fixture.config)
        .args(["sessions", "--all", "--source", "Keystation"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.ends_with("Total: 5 notes in 1 sessions\n"));
}

#[test]
fn test_oversized_gap_threshold_joins_everything() {
    let fixture = Fixture::new();
    seed_history(&fixture.log());

    let output = Command::new(midilog_binary())
        .env("HOME", fixture.temp.path())
        .env("XDG_CONFIG_HOME", fixture.temp.path().join("config"))
        .env("MIDILOG_GAP_THRESHOLD_SECS", "10000000000000000")
        .arg("--config")
        .arg(&fixture.config)
        .args(["sessions", "--days", "100000000"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.ends_with("Total: 5 notes in 1 sessions\n"));
}
