//! Tracker configuration.
//!
//! A single [`TrackerConfig`] is built once (from TOML or in code) and handed
//! to every tracker at construction. Every section is `#[serde(default)]`, so
//! a config file only needs the values it overrides:
//!
//! ```toml
//! [quota]
//! limit = 2_000_000
//!
//! [context.thresholds]
//! danger = 0.75
//!
//! [compaction]
//! recency_turns = 8
//! ```
//!
//! Builder methods cover the common overrides in tests:
//!
//! ```ignore
//! let config = TrackerConfig::default()
//!     .with_quota_limit(500_000)
//!     .with_working_ceiling(100_000)
//!     .with_recency_turns(3);
//! ```

use std::path::Path;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};
use crate::retry::RetryConfig;

/// Default rolling quota: tokens per window.
pub const DEFAULT_QUOTA_LIMIT: u64 = 1_000_000;
/// Default rolling quota window length.
pub const DEFAULT_WINDOW_HOURS: u32 = 5;
/// Default hard context limit in tokens.
pub const DEFAULT_CONTEXT_LIMIT: u64 = 200_000;
/// Default working ceiling (90% of the hard limit).
pub const DEFAULT_WORKING_CEILING: u64 = 180_000;

/// Top-level configuration for the tracking core.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub quota: QuotaConfig,
    pub context: ContextConfig,
    pub compaction: CompactionConfig,
    pub persistence: RetryConfig,
}

/// Rolling quota window settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    /// Tokens allowed per window.
    pub limit: u64,
    /// Window length in hours, anchored at first use.
    pub window_hours: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_QUOTA_LIMIT,
            window_hours: DEFAULT_WINDOW_HOURS,
        }
    }
}

impl QuotaConfig {
    /// Window length as a duration.
    pub fn window(&self) -> TimeDelta {
        TimeDelta::hours(i64::from(self.window_hours))
    }
}

/// Per-session context window settings.
///
/// The context ceiling is independent of the quota limit; the two are never
/// combined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Hard context limit of the model.
    pub limit: u64,
    /// Working ceiling that tier percentages are computed against.
    pub working_ceiling: u64,
    pub thresholds: AlertThresholds,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_CONTEXT_LIMIT,
            working_ceiling: DEFAULT_WORKING_CEILING,
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Alert tier boundaries as fractions of the working ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertThresholds {
    pub warning: f64,
    pub danger: f64,
    pub critical: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning: 0.50,
            danger: 0.80,
            critical: 0.90,
        }
    }
}

/// Compaction policy tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompactionConfig {
    /// Number of most recent conversation turns a file read must be
    /// referenced in to stay fresh.
    pub recency_turns: usize,
    /// Operations above this estimate with no later reference are verbose.
    pub verbose_threshold: u64,
    /// Conversation turns kept verbatim by strategic compaction.
    pub strategic_keep_turns: usize,
    /// Maximum characters of an archived turn's summary line.
    pub summary_max_chars: usize,
    /// Run soft compaction automatically once a session reaches warning.
    pub auto_soft: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            recency_turns: 5,
            verbose_threshold: 8_000,
            strategic_keep_turns: 10,
            summary_max_chars: 160,
            auto_soft: true,
        }
    }
}

impl TrackerConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: TrackerConfig =
            toml::from_str(s).map_err(|e| TrackerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .map_err(|e| TrackerError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&data)
    }

    /// Reject configurations the trackers cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.quota.limit == 0 {
            return Err(TrackerError::Config("quota.limit must be positive".into()));
        }
        if self.quota.window_hours == 0 {
            return Err(TrackerError::Config(
                "quota.window_hours must be positive".into(),
            ));
        }
        if self.context.working_ceiling == 0 || self.context.working_ceiling > self.context.limit {
            return Err(TrackerError::Config(format!(
                "context.working_ceiling must be in 1..={}",
                self.context.limit
            )));
        }
        let t = self.context.thresholds;
        let in_range = |v: f64| v > 0.0 && v <= 1.0;
        if !(in_range(t.warning) && in_range(t.danger) && in_range(t.critical))
            || !(t.warning < t.danger && t.danger < t.critical)
        {
            return Err(TrackerError::Config(
                "context.thresholds must satisfy 0 < warning < danger < critical <= 1".into(),
            ));
        }
        if self.compaction.summary_max_chars < 8 {
            return Err(TrackerError::Config(
                "compaction.summary_max_chars must be at least 8".into(),
            ));
        }
        Ok(())
    }

    pub fn with_quota_limit(mut self, limit: u64) -> Self {
        self.quota.limit = limit;
        self
    }

    pub fn with_window_hours(mut self, hours: u32) -> Self {
        self.quota.window_hours = hours;
        self
    }

    /// Override the context limit and working ceiling together.
    pub fn with_context_limits(mut self, limit: u64, working_ceiling: u64) -> Self {
        self.context.limit = limit;
        self.context.working_ceiling = working_ceiling;
        self
    }

    pub fn with_working_ceiling(mut self, working_ceiling: u64) -> Self {
        self.context.working_ceiling = working_ceiling;
        self
    }

    pub fn with_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.context.thresholds = thresholds;
        self
    }

    pub fn with_recency_turns(mut self, turns: usize) -> Self {
        self.compaction.recency_turns = turns;
        self
    }

    pub fn with_verbose_threshold(mut self, tokens: u64) -> Self {
        self.compaction.verbose_threshold = tokens;
        self
    }

    pub fn with_strategic_keep_turns(mut self, turns: usize) -> Self {
        self.compaction.strategic_keep_turns = turns;
        self
    }

    pub fn with_auto_soft(mut self, enabled: bool) -> Self {
        self.compaction.auto_soft = enabled;
        self
    }

    pub fn with_persistence(mut self, retry: RetryConfig) -> Self {
        self.persistence = retry;
        self
    }
}
