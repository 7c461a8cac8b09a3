//! Export command: writes session MIDI files into a directory.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use midilog_db::{SessionListing, TimeWindow};

use crate::Config;
use crate::commands::sessions::EMPTY_RANGE;
use crate::commands::util::{notes, open_log, query_service};

pub fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    window: TimeWindow,
    source: Option<&str>,
    out: &Path,
) -> Result<()> {
    let log = open_log(config)?;
    let listing = query_service(&log, config).list_sessions(window, source)?;
    write_artifacts(writer, &listing, out)?;
    Ok(())
}

/// Writes every artifact under its own name. Returns the number of files.
pub fn write_artifacts<W: Write>(
    writer: &mut W,
    listing: &SessionListing,
    out: &Path,
) -> Result<usize> {
    if listing.is_empty() {
        writeln!(writer, "{EMPTY_RANGE}")?;
        return Ok(0);
    }

    std::fs::create_dir_all(out)
        .with_context(|| format!("failed to create {}", out.display()))?;

    for artifact in &listing.artifacts {
        let path = out.join(&artifact.name);
        std::fs::write(&path, &artifact.encoded_bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::debug!(path = %path.display(), bytes = artifact.encoded_bytes.len(), "wrote session");
        writeln!(writer, "{}  ({})", artifact.name, notes(artifact.event_count))?;
    }
    for failure in &listing.failures {
        writeln!(
            writer,
            "skipped session {} from {}: {}",
            failure.ordinal,
            failure.start.format("%d.%m.%Y %H:%M"),
            failure.error
        )?;
    }

    writeln!(
        writer,
        "Exported {} sessions to {}",
        listing.artifacts.len(),
        out.display()
    )?;
    Ok(listing.artifacts.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    use insta::assert_snapshot;
    use midilog_core::decode_artifact;
    use midilog_db::{PersistentLog, QueryService};

    use crate::commands::fixtures::{now, seed};

    #[test]
    fn writes_one_file_per_session() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("exports");
        let log = PersistentLog::open_in_memory().unwrap();
        seed(&log);
        let listing = QueryService::new(&log)
            .list_sessions_at(TimeWindow::Days(1), None, now())
            .unwrap();

        let mut output = Vec::new();
        let written = write_artifacts(&mut output, &listing, &out).unwrap();
        assert_eq!(written, 3);

        let output = String::from_utf8(output)
            .unwrap()
            .replace(&out.display().to_string(), "[OUT]");
        assert_snapshot!(output, @r"
        session_2_keys_2025-03-01_20-20.mid  (1 note)
        session_1_pads_2025-03-01_20-15.mid  (1 note)
        session_0_keys_2025-03-01_20-15.mid  (3 notes)
        Exported 3 sessions to [OUT]
        ");

        let bytes = std::fs::read(out.join("session_0_keys_2025-03-01_20-15.mid")).unwrap();
        let deltas: Vec<u32> = decode_artifact(&bytes)
            .unwrap()
            .iter()
            .map(|e| e.delta_ms)
            .collect();
        assert_eq!(deltas, vec![0, 500, 1_000, 10]);
    }

    #[test]
    fn empty_range_writes_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("exports");
        let mut output = Vec::new();
        let written = write_artifacts(&mut output, &SessionListing::default(), &out).unwrap();
        assert_eq!(written, 0);
        assert!(!out.exists());
        assert_eq!(String::from_utf8(output).unwrap(), format!("{EMPTY_RANGE}\n"));
    }
}
