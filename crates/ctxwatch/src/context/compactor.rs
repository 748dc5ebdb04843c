//! Tiered compaction policies.
//!
//! Planning is pure: [`plan`] reads a [`ContextState`] and returns a
//! [`CompactionPlan`] without touching it. The plan is applied later with
//! [`ContextTracker::apply_plan`](super::tracker::ContextTracker::apply_plan),
//! so a caller can persist whatever the plan produces (a handoff draft, say)
//! between the two steps and drop the whole thing if it is cancelled.

use serde::{Deserialize, Serialize};

use super::budget::{AlertTier, estimate_tokens};
use super::candidates::{self, CandidateReason};
use super::tracker::{ArchivedTurn, Category, ContextState, Operation, OperationRef};
use crate::config::CompactionConfig;
use crate::error::{Result, TrackerError};

/// How aggressively to compact.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompactionPolicy {
    /// Drop stale file reads and duplicate tool output. Automatic.
    Soft,
    /// Soft removals plus archiving older conversation turns into summary
    /// lines. Must be confirmed by the caller.
    Strategic { confirmed: bool },
    /// Drop everything that is not protected and request a handoff.
    Emergency,
}

impl CompactionPolicy {
    /// The policy matching a tier, if any. Strategic comes back unconfirmed.
    pub fn recommended(tier: AlertTier) -> Option<Self> {
        match tier {
            AlertTier::Fresh => None,
            AlertTier::Warning => Some(CompactionPolicy::Soft),
            AlertTier::Danger => Some(CompactionPolicy::Strategic { confirmed: false }),
            AlertTier::Critical => Some(CompactionPolicy::Emergency),
        }
    }

    /// Same policy with strategic confirmation granted.
    pub fn confirmed(self) -> Self {
        match self {
            CompactionPolicy::Strategic { .. } => CompactionPolicy::Strategic { confirmed: true },
            other => other,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompactionPolicy::Soft => "soft",
            CompactionPolicy::Strategic { .. } => "strategic",
            CompactionPolicy::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for CompactionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CompactionPolicy {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "soft" => Ok(CompactionPolicy::Soft),
            "strategic" => Ok(CompactionPolicy::Strategic { confirmed: false }),
            "emergency" => Ok(CompactionPolicy::Emergency),
            other => Err(TrackerError::InvalidInput(format!(
                "unknown compaction policy: {other}"
            ))),
        }
    }
}

/// A conversation turn to archive. If the operation is also listed for
/// removal only the summary is kept; otherwise the operation is rewritten
/// in place as its summary line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub operation: OperationRef,
    pub summary: String,
    pub summary_tokens: u64,
}

/// What a compaction would do, computed without mutating anything.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompactionPlan {
    pub session_id: String,
    pub policy: CompactionPolicy,
    /// Revision of the state the plan was computed from.
    pub revision: u64,
    pub removals: Vec<OperationRef>,
    pub archives: Vec<ArchiveEntry>,
    pub restart_required: bool,
}

impl CompactionPlan {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.archives.is_empty()
    }

    /// Tokens the plan reclaims if every operation is still present.
    pub fn estimated_reclaim(&self) -> u64 {
        let removed: u64 = self.removals.iter().map(|r| r.estimated_tokens).sum();
        let archived: u64 = self
            .archives
            .iter()
            .filter(|a| !self.removals.iter().any(|r| r.id == a.operation.id))
            .map(|a| a.operation.estimated_tokens.saturating_sub(a.summary_tokens))
            .sum();
        removed + archived
    }

    /// Archived turns as they would appear in a handoff.
    pub fn archived_turns(&self, state: &ContextState) -> Vec<ArchivedTurn> {
        self.archives
            .iter()
            .filter_map(|a| {
                state.operation(a.operation.id).map(|op| ArchivedTurn {
                    operation_id: op.id,
                    timestamp: op.timestamp,
                    summary: a.summary.clone(),
                    original_tokens: op.estimated_tokens,
                })
            })
            .collect()
    }
}

/// Result of applying a plan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompactionOutcome {
    pub session_id: String,
    pub policy: CompactionPolicy,
    pub removed: Vec<OperationRef>,
    pub archived: Vec<ArchivedTurn>,
    pub reclaimed_tokens: u64,
    pub total_before: u64,
    pub total_after: u64,
    pub tier_before: AlertTier,
    pub tier_after: AlertTier,
    /// The session should be restarted from a handoff.
    pub restart_required: bool,
    /// Handoff written as part of this compaction, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_id: Option<String>,
}

/// Compute a plan for `policy` over `state`.
pub fn plan(
    state: &ContextState,
    config: &CompactionConfig,
    policy: CompactionPolicy,
) -> Result<CompactionPlan> {
    if state.is_closed() {
        return Err(TrackerError::SessionClosed(state.session_id.clone()));
    }
    if policy == (CompactionPolicy::Strategic { confirmed: false }) {
        return Err(TrackerError::ConfirmationRequired(state.session_id.clone()));
    }

    let mut removals = Vec::new();
    let mut archives = Vec::new();

    match policy {
        CompactionPolicy::Soft | CompactionPolicy::Strategic { .. } => {
            removals.extend(
                candidates::identify(state, config)
                    .into_iter()
                    .filter(|c| {
                        matches!(
                            c.reason,
                            CandidateReason::StaleFileRead | CandidateReason::DuplicateToolOutput
                        )
                    })
                    .map(|c| c.operation),
            );
            if matches!(policy, CompactionPolicy::Strategic { .. }) {
                archives = strategic_archives(state, config);
            }
        }
        CompactionPolicy::Emergency => {
            let last_turn = state.last_turn_index();
            for (i, op) in state.operations.iter().enumerate() {
                if candidates::is_protected(state, i, last_turn) {
                    continue;
                }
                removals.push(op.to_ref());
                if op.category == Category::Conversation {
                    archives.push(archive_entry(op, config));
                }
            }
        }
    }

    Ok(CompactionPlan {
        session_id: state.session_id.clone(),
        policy,
        revision: state.revision,
        removals,
        archives,
        restart_required: policy == CompactionPolicy::Emergency,
    })
}

/// Conversation turns older than the last `strategic_keep_turns` that have
/// not been archived yet.
fn strategic_archives(state: &ContextState, config: &CompactionConfig) -> Vec<ArchiveEntry> {
    let last_turn = state.last_turn_index();
    let turns: Vec<usize> = state
        .operations
        .iter()
        .enumerate()
        .filter(|(_, op)| op.category == Category::Conversation)
        .map(|(i, _)| i)
        .collect();
    let cutoff = turns.len().saturating_sub(config.strategic_keep_turns);

    turns[..cutoff]
        .iter()
        .filter(|&&i| !candidates::is_protected(state, i, last_turn))
        .map(|&i| archive_entry(&state.operations[i], config))
        .collect()
}

fn archive_entry(op: &Operation, config: &CompactionConfig) -> ArchiveEntry {
    let summary = summarize_turn(op, config.summary_max_chars);
    ArchiveEntry {
        operation: op.to_ref(),
        summary_tokens: estimate_tokens(&summary),
        summary,
    }
}

/// One-line summary of a conversation turn, at most `max_chars` characters.
pub fn summarize_turn(op: &Operation, max_chars: usize) -> String {
    let body = match op.metadata.summary.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => format!("conversation turn, {} tokens", op.estimated_tokens),
    };
    let mut line = format!("[{}] {body}", op.timestamp.format("%H:%M"));
    if !op.metadata.references.is_empty() {
        line.push_str(&format!(" (refs: {})", op.metadata.references.join(", ")));
    }
    truncate_chars(&line, max_chars)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
