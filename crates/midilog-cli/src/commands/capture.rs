//! Capture command: records every MIDI input until ctrl-c.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use midilog_io::{IngestStats, Ingestor, MidirEnumerator};

use crate::Config;
use crate::commands::util::open_log;

pub async fn run<W: Write>(writer: &mut W, config: &Config, rescan_secs: Option<u64>) -> Result<()> {
    let log = Arc::new(open_log(config)?);
    let interval = rescan_secs.map_or_else(|| config.rescan_interval(), Duration::from_secs);

    tracing::info!(
        database = %config.database_path.display(),
        rescan_secs = interval.as_secs(),
        "capturing, press ctrl-c to stop"
    );
    let stats = Ingestor::new(MidirEnumerator::new(&config.client_name), log)
        .with_rescan_interval(interval)
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
            }
        })
        .await;

    write_summary(writer, &stats)
}

pub fn write_summary<W: Write>(writer: &mut W, stats: &IngestStats) -> Result<()> {
    writeln!(
        writer,
        "Captured {} events from {} sources",
        stats.persisted, stats.sources_opened
    )?;
    if stats.dropped > 0 {
        writeln!(writer, "Dropped {} events after failed writes", stats.dropped)?;
    }
    Ok(())
}
