//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// MIDI activity logger.
///
/// Records everything played on attached MIDI inputs and turns it into one
/// MIDI file per playing session.
#[derive(Debug, Parser)]
#[command(name = "midilog", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Capture events from every MIDI input until interrupted.
    Capture {
        /// Seconds between device rescans (overrides config).
        #[arg(long)]
        rescan_secs: Option<u64>,
    },

    /// List recorded sessions, newest first.
    Sessions {
        #[command(flatten)]
        range: RangeArgs,

        /// Only sessions from this input.
        #[arg(long)]
        source: Option<String>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Write session MIDI files into a directory.
    Export {
        #[command(flatten)]
        range: RangeArgs,

        /// Only sessions from this input.
        #[arg(long)]
        source: Option<String>,

        /// Output directory (created if missing).
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Show the events of one session.
    Show {
        /// Session number as listed by `sessions --all` (1 is the newest).
        number: usize,

        /// Number sessions of this input only.
        #[arg(long)]
        source: Option<String>,
    },

    /// Play one session to a MIDI output.
    Play {
        /// Session number as listed by `sessions --all` (1 is the newest).
        number: usize,

        /// Number sessions of this input only.
        #[arg(long)]
        source: Option<String>,

        /// Output port name, or part of it. Defaults to the first output.
        #[arg(long)]
        device: Option<String>,
    },

    /// Show database and device status.
    Status,
}

/// Time range selection. Defaults to today.
#[derive(Debug, Clone, Default, Args)]
#[group(multiple = false)]
pub struct RangeArgs {
    /// The last 24 hours.
    #[arg(long)]
    pub today: bool,

    /// The last 7 days.
    #[arg(long)]
    pub week: bool,

    /// All history.
    #[arg(long)]
    pub all: bool,

    /// The last N days (0 is all history).
    #[arg(long, value_name = "N")]
    pub days: Option<u32>,

    /// Since a time: ISO 8601 or relative (e.g., "2 hours ago").
    #[arg(long, value_name = "WHEN")]
    pub since: Option<String>,
}
