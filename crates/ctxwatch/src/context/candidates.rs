//! Compaction candidate scan.
//!
//! Walks a session's operation log and flags operations whose tokens could
//! be reclaimed. Candidates are recomputed on demand and never persisted.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::tracker::{Category, ContextState, Operation, OperationRef};
use crate::config::CompactionConfig;

/// Why an operation was flagged.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateReason {
    /// A file read not referenced in the most recent conversation turns.
    StaleFileRead,
    /// A tool result byte-identical to an earlier one.
    DuplicateToolOutput,
    /// A large operation nothing refers back to.
    VerboseOutput,
}

impl std::fmt::Display for CandidateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateReason::StaleFileRead => write!(f, "stale-file-read"),
            CandidateReason::DuplicateToolOutput => write!(f, "duplicate-tool-output"),
            CandidateReason::VerboseOutput => write!(f, "verbose-output"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompactionCandidate {
    pub operation: OperationRef,
    pub reclaimable_tokens: u64,
    pub reason: CandidateReason,
}

/// Whether compaction must leave the operation at `index` alone.
///
/// Protected: the system prompt, the most recent conversation turn,
/// in-progress edits, operations touching a file that is still open, and
/// summary lines from an earlier strategic compaction.
pub fn is_protected(state: &ContextState, index: usize, last_turn: Option<usize>) -> bool {
    let Some(op) = state.operations.get(index) else {
        return false;
    };
    let meta = &op.metadata;
    op.category == Category::SystemPrompt
        || last_turn == Some(index)
        || meta.in_progress_edit
        || meta.archived
        || meta.file_path.as_deref().is_some_and(|p| state.files.is_open(p))
        || meta.references.iter().any(|r| state.files.is_open(r))
}

/// Flag every compactable operation, at most once each.
///
/// When an operation matches several reasons the first in
/// stale > duplicate > verbose order wins.
pub fn identify(state: &ContextState, config: &CompactionConfig) -> Vec<CompactionCandidate> {
    let ops = &state.operations;
    let turn_indices: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.category == Category::Conversation)
        .map(|(i, _)| i)
        .collect();
    let last_turn = turn_indices.last().copied();

    let recent_start = turn_indices.len().saturating_sub(config.recency_turns);
    let recent_turns: Vec<&Operation> = turn_indices[recent_start..]
        .iter()
        .map(|&i| &ops[i])
        .collect();

    let mut seen_payloads = HashSet::new();
    let mut candidates = Vec::new();

    for (i, op) in ops.iter().enumerate() {
        let first_payload = match (op.category, op.metadata.payload_hash) {
            (Category::ToolResult, Some(hash)) => seen_payloads.insert(hash),
            _ => true,
        };
        if is_protected(state, i, last_turn) {
            continue;
        }

        let stale = op.category == Category::FileRead
            && is_stale_read(op, i, &turn_indices, &recent_turns, config);
        let reason = if stale {
            Some(CandidateReason::StaleFileRead)
        } else if !first_payload {
            Some(CandidateReason::DuplicateToolOutput)
        } else if is_verbose(op, &ops[i + 1..], config) {
            Some(CandidateReason::VerboseOutput)
        } else {
            None
        };

        if let Some(reason) = reason {
            candidates.push(CompactionCandidate {
                operation: op.to_ref(),
                reclaimable_tokens: op.estimated_tokens,
                reason,
            });
        }
    }
    candidates
}

fn is_stale_read(
    op: &Operation,
    index: usize,
    turn_indices: &[usize],
    recent_turns: &[&Operation],
    config: &CompactionConfig,
) -> bool {
    let turns_after = turn_indices.iter().filter(|&&t| t > index).count();
    if turns_after < config.recency_turns {
        return false;
    }
    !recent_turns.iter().any(|turn| turn.metadata.refers_to(op))
}

fn is_verbose(op: &Operation, later: &[Operation], config: &CompactionConfig) -> bool {
    if matches!(op.category, Category::SystemPrompt | Category::Conversation) {
        return false;
    }
    if op.estimated_tokens <= config.verbose_threshold {
        return false;
    }
    !later.iter().any(|next| next.metadata.refers_to(op))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::context::tracker::{ContextTracker, OperationMetadata};
    use chrono::{DateTime, TimeDelta, Utc};

    fn t(minute: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + TimeDelta::minutes(minute)
    }

    fn tracker(recency: usize) -> ContextTracker {
        let config = TrackerConfig::default().with_recency_turns(recency);
        ContextTracker::new("s1", "/work/app", t(0), &config)
    }

    fn turns(ctx: &mut ContextTracker, n: usize, start: i64, meta: OperationMetadata) {
        for i in 0..n {
            ctx.record_operation(Category::Conversation, 100, meta.clone(), t(start + i as i64))
                .unwrap();
        }
    }

    fn reasons(ctx: &ContextTracker) -> Vec<(u64, CandidateReason)> {
        ctx.identify_compaction_candidates()
            .into_iter()
            .map(|c| (c.operation.id, c.reason))
            .collect()
    }

    #[test]
    fn unreferenced_read_becomes_stale_after_recency_window() {
        let mut ctx = tracker(3);
        ctx.record_operation(Category::FileRead, 500, OperationMetadata::for_file("a.rs"), t(0))
            .unwrap();
        turns(&mut ctx, 2, 1, OperationMetadata::new());
        assert!(reasons(&ctx).is_empty());

        turns(&mut ctx, 1, 3, OperationMetadata::new());
        assert_eq!(reasons(&ctx), vec![(0, CandidateReason::StaleFileRead)]);
    }

    #[test]
    fn recent_reference_keeps_read_fresh() {
        let mut ctx = tracker(3);
        ctx.record_operation(Category::FileRead, 500, OperationMetadata::for_file("a.rs"), t(0))
            .unwrap();
        turns(&mut ctx, 3, 1, OperationMetadata::new());
        ctx.record_operation(
            Category::Conversation,
            100,
            OperationMetadata::new().with_reference("a.rs"),
            t(10),
        )
        .unwrap();
        turns(&mut ctx, 1, 11, OperationMetadata::new());
        assert!(reasons(&ctx).is_empty());
    }

    #[test]
    fn later_identical_tool_result_is_duplicate() {
        let mut ctx = tracker(5);
        let payload = OperationMetadata::new().with_payload("cargo test: 12 passed");
        ctx.record_operation(Category::ToolResult, 300, payload.clone(), t(0)).unwrap();
        ctx.record_operation(Category::ToolResult, 300, payload.clone(), t(1)).unwrap();
        ctx.record_operation(Category::ToolResult, 300, payload, t(2)).unwrap();
        ctx.record_operation(
            Category::ToolResult,
            300,
            OperationMetadata::new().with_payload("different"),
            t(3),
        )
        .unwrap();
        assert_eq!(
            reasons(&ctx),
            vec![
                (1, CandidateReason::DuplicateToolOutput),
                (2, CandidateReason::DuplicateToolOutput)
            ]
        );
    }

    #[test]
    fn large_unreferenced_output_is_verbose() {
        let mut ctx = tracker(5);
        ctx.record_operation(Category::ToolResult, 9_000, OperationMetadata::new(), t(0)).unwrap();
        ctx.record_operation(
            Category::ToolResult,
            9_000,
            OperationMetadata::for_file("big.log"),
            t(1),
        )
        .unwrap();
        ctx.record_operation(
            Category::Conversation,
            50,
            OperationMetadata::new().with_reference("big.log"),
            t(2),
        )
        .unwrap();
        ctx.record_operation(Category::Conversation, 20_000, OperationMetadata::new(), t(3)).unwrap();
        assert_eq!(reasons(&ctx), vec![(0, CandidateReason::VerboseOutput)]);
    }

    #[test]
    fn protected_operations_never_flagged() {
        let mut ctx = tracker(1);
        ctx.record_operation(Category::SystemPrompt, 20_000, OperationMetadata::new(), t(0)).unwrap();
        ctx.record_operation(
            Category::FileRead,
            400,
            OperationMetadata::for_file("editing.rs").in_progress(),
            t(1),
        )
        .unwrap();
        ctx.record_operation(
            Category::GeneratedCode,
            12_000,
            OperationMetadata::for_file("open.rs"),
            t(2),
        )
        .unwrap();
        ctx.record_operation(
            Category::ToolResult,
            12_000,
            OperationMetadata::new().with_reference("open.rs"),
            t(3),
        )
        .unwrap();
        turns(&mut ctx, 2, 4, OperationMetadata::new());
        assert!(reasons(&ctx).is_empty());
    }

    #[test]
    fn stale_wins_over_verbose() {
        let mut ctx = tracker(1);
        ctx.record_operation(Category::FileRead, 50_000, OperationMetadata::for_file("huge.rs"), t(0))
            .unwrap();
        turns(&mut ctx, 2, 1, OperationMetadata::new());
        assert_eq!(reasons(&ctx), vec![(0, CandidateReason::StaleFileRead)]);
    }

    #[test]
    fn closing_a_file_releases_protection() {
        let mut ctx = tracker(5);
        ctx.record_operation(
            Category::GeneratedCode,
            10_000,
            OperationMetadata::for_file("gen.rs"),
            t(0),
        )
        .unwrap();
        turns(&mut ctx, 1, 1, OperationMetadata::new());
        assert!(reasons(&ctx).is_empty());
        ctx.close_file("gen.rs");
        assert_eq!(reasons(&ctx), vec![(0, CandidateReason::VerboseOutput)]);
    }
}
