//! Configuration loading and management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use midilog_core::SegmentMode;
use midilog_db::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Silence, in seconds, that ends a session.
    pub gap_threshold_secs: u64,
    /// Seconds between MIDI device rescans while capturing.
    pub rescan_interval_secs: u64,
    /// Total attempts per append, the first included.
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Segment all sources as one stream instead of per source.
    pub merge_sources: bool,
    /// Client name announced to the MIDI subsystem.
    pub client_name: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("midi_log.db"),
            gap_threshold_secs: 60,
            rescan_interval_secs: 5,
            retry_attempts: 3,
            retry_backoff_ms: 100,
            merge_sources: false,
            client_name: "midilog".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (MIDILOG_*)
        figment = figment.merge(Env::prefixed("MIDILOG_"));

        figment.extract()
    }

    /// Values beyond the representable range saturate, joining everything
    /// into one session per source.
    pub fn gap_threshold(&self) -> chrono::Duration {
        i64::try_from(self.gap_threshold_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub const fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub const fn segment_mode(&self) -> SegmentMode {
        if self.merge_sources {
            SegmentMode::Merged
        } else {
            SegmentMode::PerSource
        }
    }
}

/// Returns the platform-specific config directory for midilog.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("midilog"))
}

/// Returns the platform-specific data directory for midilog.
///
/// On Linux: `~/.local/share/midilog`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("midilog"))
}
