//! Resolved CLI configuration.
//!
//! The tracker config comes from, in order: `--config PATH`, the
//! `CTXWATCH_CONFIG` environment variable (wired through clap), then
//! `<data-dir>/config.toml` when it exists, then built-in defaults. Command
//! line overrides are applied last.

use std::path::{Path, PathBuf};

use ctxwatch::TrackerConfig;
use tracing::debug;

/// Name of the config file looked up inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Configuration for one CLI invocation.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Root of all persisted state.
    pub data_dir: PathBuf,
    pub tracker: TrackerConfig,
}

/// Values given on the command line that override the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub quota_limit: Option<u64>,
    pub working_ceiling: Option<u64>,
}

impl CliConfig {
    /// Resolve the data directory and tracker config.
    pub fn resolve(
        config_path: Option<&Path>,
        data_dir: Option<PathBuf>,
        overrides: &Overrides,
    ) -> Result<Self, String> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        let implicit = data_dir.join(CONFIG_FILE);
        let path = match config_path {
            Some(path) => Some(path.to_path_buf()),
            None if implicit.is_file() => Some(implicit),
            None => None,
        };

        let mut tracker = match &path {
            Some(path) => {
                debug!("Loading config from {}", path.display());
                TrackerConfig::load(path).map_err(|e| e.to_string())?
            }
            None => TrackerConfig::default(),
        };
        if let Some(limit) = overrides.quota_limit {
            tracker = tracker.with_quota_limit(limit);
        }
        if let Some(ceiling) = overrides.working_ceiling {
            tracker = tracker.with_working_ceiling(ceiling);
        }
        tracker.validate().map_err(|e| e.to_string())?;

        Ok(Self { data_dir, tracker })
    }

    /// Directory the file store writes into.
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }
}

/// `~/.local/share/ctxwatch` (or the platform equivalent), falling back to
/// `.ctxwatch` in the working directory.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("ctxwatch"))
        .unwrap_or_else(|| PathBuf::from(".ctxwatch"))
}
