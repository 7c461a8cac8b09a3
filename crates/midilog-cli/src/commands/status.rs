//! Status command for showing recent activity by source and visible devices.

use std::io::Write;

use anyhow::Result;
use midilog_db::PersistentLog;
use midilog_io::{CaptureError, PortInfo, list_input_ports, list_output_ports};

use crate::Config;
use crate::commands::util::open_log;

pub fn run<W: Write>(writer: &mut W, config: &Config) -> Result<()> {
    let log = open_log(config)?;
    write_log_status(writer, config, &log)?;
    write_ports(writer, "Inputs", list_input_ports(&config.client_name))?;
    write_ports(writer, "Outputs", list_output_ports(&config.client_name))?;
    Ok(())
}

pub fn write_log_status<W: Write>(
    writer: &mut W,
    config: &Config,
    log: &PersistentLog,
) -> Result<()> {
    let sources = log.last_event_times_by_source()?;

    writeln!(writer, "MIDI logger status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;

    if sources.is_empty() {
        writeln!(writer, "No events recorded.")?;
        return Ok(());
    }

    writeln!(writer, "Sources:")?;
    for source in sources {
        writeln!(
            writer,
            "- {}: {} ({} events)",
            source.source, source.last_event, source.event_count
        )?;
    }

    Ok(())
}

/// Device problems are reported, never fatal.
pub fn write_ports<W: Write>(
    writer: &mut W,
    label: &str,
    ports: Result<Vec<PortInfo>, CaptureError>,
) -> Result<()> {
    match ports {
        Ok(ports) if ports.is_empty() => writeln!(writer, "{label}: none")?,
        Ok(ports) => {
            writeln!(writer, "{label}:")?;
            for port in ports {
                writeln!(writer, "- {}", port.name)?;
            }
        }
        Err(err) => writeln!(writer, "{label}: unavailable ({err})")?,
    }
    Ok(())
}
