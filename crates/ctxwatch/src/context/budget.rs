//! Context budget: maps a session's token total onto alert tiers.
//!
//! Percentages are computed against the working ceiling (180k of a 200k
//! limit by default), not the hard limit, so the critical tier fires while
//! there is still room to write a handoff.
//!
//! | Tier | Threshold | Advice |
//! |------|-----------|--------|
//! | fresh | < 50% | none |
//! | warning | >= 50% | awareness; soft compaction runs |
//! | danger | >= 80% | strategic compaction |
//! | critical | >= 90% | emergency compaction or handoff |

use serde::{Deserialize, Serialize};

use crate::config::{AlertThresholds, ContextConfig};

/// Characters per token used when the tracker has to estimate a size itself
/// (summary lines written by compaction). Most tokenizers average 3-4 chars
/// per token; 3.5 is the middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Estimate the token size of a piece of text.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as f64 / DEFAULT_CHARS_PER_TOKEN).ceil() as u64
}

/// Alert tier for a session's context usage.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertTier {
    Fresh,
    Warning,
    Danger,
    Critical,
}

impl std::fmt::Display for AlertTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertTier::Fresh => write!(f, "fresh"),
            AlertTier::Warning => write!(f, "warning"),
            AlertTier::Danger => write!(f, "danger"),
            AlertTier::Critical => write!(f, "critical"),
        }
    }
}

/// Computes usage fractions and tiers for a session.
#[derive(Debug, Clone)]
pub struct ContextBudget {
    limit: u64,
    working_ceiling: u64,
    thresholds: AlertThresholds,
}

impl ContextBudget {
    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            limit: config.limit,
            working_ceiling: config.working_ceiling,
            thresholds: config.thresholds,
        }
    }

    /// Hard context limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Ceiling that tiers are computed against.
    pub fn working_ceiling(&self) -> u64 {
        self.working_ceiling
    }

    /// Usage as a fraction of the working ceiling (0.0 to 1.0+).
    pub fn fraction(&self, total: u64) -> f64 {
        if self.working_ceiling == 0 {
            return 1.0;
        }
        total as f64 / self.working_ceiling as f64
    }

    /// Usage as a fraction of the hard limit.
    pub fn limit_fraction(&self, total: u64) -> f64 {
        if self.limit == 0 {
            return 1.0;
        }
        total as f64 / self.limit as f64
    }

    /// Tier for a token total. Always recomputed, never cached.
    pub fn tier(&self, total: u64) -> AlertTier {
        let pct = self.fraction(total);
        if pct >= self.thresholds.critical {
            AlertTier::Critical
        } else if pct >= self.thresholds.danger {
            AlertTier::Danger
        } else if pct >= self.thresholds.warning {
            AlertTier::Warning
        } else {
            AlertTier::Fresh
        }
    }

    /// Human-readable advisory for a tier. `None` while fresh.
    pub fn advisory(&self, total: u64) -> Option<String> {
        let pct = self.fraction(total) * 100.0;
        match self.tier(total) {
            AlertTier::Fresh => None,
            AlertTier::Warning => Some(format!(
                "[Context notice: ~{pct:.0}% of working context used. \
                 Stale file reads and duplicate tool output can be dropped.]"
            )),
            AlertTier::Danger => Some(format!(
                "[Context notice: ~{pct:.0}% of working context used ({total} / {} tokens). \
                 Strategic compaction recommended: archive older conversation into a handoff.]",
                self.working_ceiling
            )),
            AlertTier::Critical => Some(format!(
                "[Context notice: ~{pct:.0}% of working context used ({total} / {} tokens). \
                 Write a handoff NOW and restart the session.]",
                self.working_ceiling
            )),
        }
    }
}
