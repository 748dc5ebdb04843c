//! Per-session token accounting.
//!
//! A [`ContextTracker`] owns the live [`ContextState`] of one session: the
//! ordered operation log, the per-category totals, the structured notes that
//! later become a handoff, and the session's lifecycle phase. Every mutation
//! goes through `&mut self`, so an append and its category increment are
//! never observed apart.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::budget::{AlertTier, ContextBudget};
use super::candidates::{self, CompactionCandidate};
use super::compactor::{CompactionOutcome, CompactionPlan, CompactionPolicy};
use super::file_tracker::{FileAccessType, FileActivity};
use crate::config::{CompactionConfig, TrackerConfig};
use crate::error::{Result, TrackerError};
use crate::fingerprint::fnv1a;
use crate::memory::Decision;

// ── Operations ─────────────────────────────────────────────────────

/// What kind of content an operation put into the context window.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    SystemPrompt,
    FileRead,
    ToolResult,
    Conversation,
    GeneratedCode,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::SystemPrompt,
        Category::FileRead,
        Category::ToolResult,
        Category::Conversation,
        Category::GeneratedCode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::SystemPrompt => "system-prompt",
            Category::FileRead => "file-read",
            Category::ToolResult => "tool-result",
            Category::Conversation => "conversation",
            Category::GeneratedCode => "generated-code",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| TrackerError::InvalidInput(format!("unknown category: {s}")))
    }
}

/// Optional facts attached to an operation.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct OperationMetadata {
    /// File the operation read, wrote or searched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Paths (or decimal operation ids) this operation refers back to.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    /// The operation belongs to an edit that is still underway.
    pub in_progress_edit: bool,
    /// Hash of the raw payload, for duplicate detection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<u64>,
    /// One-line description used when the operation is archived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Set on summary lines written by strategic compaction.
    pub archived: bool,
}

impl OperationMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_file(path: impl Into<String>) -> Self {
        Self {
            file_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.references.push(reference.into());
        self
    }

    /// Hash `payload` into [`payload_hash`](Self::payload_hash).
    pub fn with_payload(mut self, payload: &str) -> Self {
        self.payload_hash = Some(fnv1a(payload.as_bytes()));
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn in_progress(mut self) -> Self {
        self.in_progress_edit = true;
        self
    }

    /// Whether this metadata points back at `target` by path or id.
    pub fn refers_to(&self, target: &Operation) -> bool {
        let id = target.id.to_string();
        self.references.iter().any(|r| {
            *r == id || target.metadata.file_path.as_deref() == Some(r.as_str())
        })
    }
}

/// One token-consuming operation in a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: u64,
    pub category: Category,
    pub estimated_tokens: u64,
    #[serde(default)]
    pub metadata: OperationMetadata,
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    pub fn to_ref(&self) -> OperationRef {
        OperationRef {
            id: self.id,
            category: self.category,
            estimated_tokens: self.estimated_tokens,
        }
    }
}

/// Lightweight handle to an operation, returned by mutations and compaction.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationRef {
    pub id: u64,
    pub category: Category,
    pub estimated_tokens: u64,
}

/// A conversation turn that compaction replaced (or removed) and kept as a
/// summary line for the handoff.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArchivedTurn {
    pub operation_id: u64,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub original_tokens: u64,
}

// ── Session state ──────────────────────────────────────────────────

/// Lifecycle of a tracked session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Active,
    /// A compaction plan is being applied.
    Compacting,
    /// Usage reached the critical tier.
    Critical,
    /// Emergency compaction ran; a handoff was requested and the session
    /// should restart.
    HandoffPending,
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionPhase::Active => "active",
            SessionPhase::Compacting => "compacting",
            SessionPhase::Critical => "critical",
            SessionPhase::HandoffPending => "handoff_pending",
            SessionPhase::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Structured notes the session's collaborators record as work progresses.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SessionNotes {
    pub accomplishments: Vec<String>,
    pub decisions: Vec<Decision>,
    pub next_steps: Vec<String>,
    pub tech_stack: BTreeSet<String>,
}

/// The accumulated token footprint of one session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContextState {
    pub session_id: String,
    pub project_path: String,
    pub started_at: DateTime<Utc>,
    pub totals: BTreeMap<Category, u64>,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub notes: SessionNotes,
    #[serde(default)]
    pub archived_turns: Vec<ArchivedTurn>,
    #[serde(default)]
    pub files: FileActivity,
    #[serde(default)]
    pub phase: SessionPhase,
    /// Bumped on every mutation.
    #[serde(default)]
    pub revision: u64,
    /// Tokens reclaimed by compaction over the session's lifetime.
    #[serde(default)]
    pub reclaimed_total: u64,
    /// Id for the next recorded operation; also the count ever recorded.
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub last_event: Option<DateTime<Utc>>,
    /// Handoff written by emergency compaction; closing the session reuses
    /// it instead of writing another.
    #[serde(default)]
    pub pending_handoff: Option<String>,
}

impl ContextState {
    pub fn new(
        session_id: impl Into<String>,
        project_path: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project_path: project_path.into(),
            started_at,
            totals: Category::ALL.into_iter().map(|c| (c, 0)).collect(),
            operations: Vec::new(),
            notes: SessionNotes::default(),
            archived_turns: Vec::new(),
            files: FileActivity::default(),
            phase: SessionPhase::Active,
            revision: 0,
            reclaimed_total: 0,
            next_id: 0,
            last_event: None,
            pending_handoff: None,
        }
    }

    /// Sum of the category totals.
    pub fn total(&self) -> u64 {
        self.totals.values().sum()
    }

    pub fn category_total(&self, category: Category) -> u64 {
        self.totals.get(&category).copied().unwrap_or(0)
    }

    /// Whether any operation was ever recorded, including ones since removed.
    pub fn has_operations(&self) -> bool {
        self.next_id > 0
    }

    pub fn operation(&self, id: u64) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    /// Index of the most recent conversation turn.
    pub fn last_turn_index(&self) -> Option<usize> {
        self.operations
            .iter()
            .rposition(|op| op.category == Category::Conversation)
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    fn add(&mut self, category: Category, tokens: u64) {
        *self.totals.entry(category).or_insert(0) += tokens;
    }

    fn subtract(&mut self, category: Category, tokens: u64) {
        let slot = self.totals.entry(category).or_insert(0);
        *slot = slot.saturating_sub(tokens);
    }
}

/// Query snapshot of a session's usage. Recomputed on every call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UsageSnapshot {
    pub session_id: String,
    pub total: u64,
    pub limit: u64,
    pub working_ceiling: u64,
    /// Percent of the working ceiling.
    pub percent: f64,
    /// Percent of the hard limit.
    pub percent_of_limit: f64,
    pub by_category: BTreeMap<Category, u64>,
    pub tier: AlertTier,
    pub phase: SessionPhase,
    pub operations: usize,
    pub reclaimed_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisory: Option<String>,
}

// ── Tracker ────────────────────────────────────────────────────────

/// Tracks one session's context usage.
#[derive(Debug, Clone)]
pub struct ContextTracker {
    state: ContextState,
    budget: ContextBudget,
    compaction: CompactionConfig,
}

impl ContextTracker {
    pub fn new(
        session_id: impl Into<String>,
        project_path: impl Into<String>,
        started_at: DateTime<Utc>,
        config: &TrackerConfig,
    ) -> Self {
        Self::from_state(ContextState::new(session_id, project_path, started_at), config)
    }

    /// Resume tracking from a checkpointed state.
    pub fn from_state(state: ContextState, config: &TrackerConfig) -> Self {
        Self {
            state,
            budget: ContextBudget::from_config(&config.context),
            compaction: config.compaction.clone(),
        }
    }

    pub fn state(&self) -> &ContextState {
        &self.state
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    pub fn compaction_config(&self) -> &CompactionConfig {
        &self.compaction
    }

    pub fn tier(&self) -> AlertTier {
        self.budget.tier(self.state.total())
    }

    pub fn files(&self) -> &FileActivity {
        &self.state.files
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.is_closed() {
            return Err(TrackerError::SessionClosed(self.state.session_id.clone()));
        }
        Ok(())
    }

    /// Append an operation and bump its category total.
    ///
    /// Events must arrive in timestamp order: anything earlier than the
    /// session start or the previous operation is a [`TrackerError::StaleEvent`].
    pub fn record_operation(
        &mut self,
        category: Category,
        estimated_tokens: i64,
        metadata: OperationMetadata,
        timestamp: DateTime<Utc>,
    ) -> Result<OperationRef> {
        if estimated_tokens < 0 {
            return Err(TrackerError::InvalidInput(format!(
                "estimated tokens must be non-negative, got {estimated_tokens}"
            )));
        }
        self.ensure_open()?;
        let boundary = self
            .state
            .last_event
            .map_or(self.state.started_at, |last| last.max(self.state.started_at));
        if timestamp < boundary {
            return Err(TrackerError::StaleEvent {
                session_id: self.state.session_id.clone(),
                timestamp,
                boundary,
            });
        }

        let tokens = estimated_tokens as u64;
        let id = self.state.next_id;
        if let Some(path) = metadata.file_path.as_deref() {
            let access = match category {
                Category::FileRead => FileAccessType::Read,
                Category::GeneratedCode => FileAccessType::Write,
                _ => FileAccessType::Search,
            };
            self.state.files.record(path, access, id);
            if metadata.in_progress_edit {
                self.state.files.open(path);
            }
        }

        let op = Operation {
            id,
            category,
            estimated_tokens: tokens,
            metadata,
            timestamp,
        };
        let op_ref = op.to_ref();
        self.state.operations.push(op);
        self.state.add(category, tokens);
        self.state.next_id += 1;
        self.state.last_event = Some(timestamp);
        self.state.revision += 1;

        if self.state.phase == SessionPhase::Active && self.tier() == AlertTier::Critical {
            info!(
                "Session {} reached critical context usage ({} tokens)",
                self.state.session_id,
                self.state.total()
            );
            self.state.phase = SessionPhase::Critical;
        }
        Ok(op_ref)
    }

    /// Totals, percentages and the current tier.
    pub fn usage_snapshot(&self) -> UsageSnapshot {
        let total = self.state.total();
        UsageSnapshot {
            session_id: self.state.session_id.clone(),
            total,
            limit: self.budget.limit(),
            working_ceiling: self.budget.working_ceiling(),
            percent: self.budget.fraction(total) * 100.0,
            percent_of_limit: self.budget.limit_fraction(total) * 100.0,
            by_category: self.state.totals.clone(),
            tier: self.budget.tier(total),
            phase: self.state.phase,
            operations: self.state.operations.len(),
            reclaimed_total: self.state.reclaimed_total,
            advisory: self.budget.advisory(total),
        }
    }

    /// Operations eligible for removal, recomputed from the current log.
    pub fn identify_compaction_candidates(&self) -> Vec<CompactionCandidate> {
        candidates::identify(&self.state, &self.compaction)
    }

    // ── Notes ──

    pub fn record_accomplishment(&mut self, text: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.state.notes.accomplishments.push(text.into());
        self.state.revision += 1;
        Ok(())
    }

    pub fn record_decision(
        &mut self,
        decision: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.state.notes.decisions.push(Decision::new(decision, rationale));
        self.state.revision += 1;
        Ok(())
    }

    pub fn record_next_step(&mut self, text: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.state.notes.next_steps.push(text.into());
        self.state.revision += 1;
        Ok(())
    }

    pub fn record_tech(&mut self, tech: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        if self.state.notes.tech_stack.insert(tech.into()) {
            self.state.revision += 1;
        }
        Ok(())
    }

    /// The session finished editing `path`; its operations become
    /// compactable again.
    pub fn close_file(&mut self, path: &str) -> bool {
        let closed = self.state.files.close(path);
        if closed {
            self.state.revision += 1;
        }
        closed
    }

    // ── Compaction ──

    /// Compute, without applying, what `policy` would do to this session.
    pub fn plan(&self, policy: CompactionPolicy) -> Result<CompactionPlan> {
        super::compactor::plan(&self.state, &self.compaction, policy)
    }

    /// Plan and apply in one step. Used when no persistence sits between
    /// the two.
    pub fn compact(&mut self, policy: CompactionPolicy) -> Result<CompactionOutcome> {
        let plan = self.plan(policy)?;
        self.apply_plan(&plan)
    }

    /// Apply a plan computed from an earlier view of this session.
    ///
    /// Operations that disappeared since planning are skipped. Nothing is
    /// written until every entry has been resolved, so the state either
    /// reflects the whole plan or none of it.
    pub fn apply_plan(&mut self, plan: &CompactionPlan) -> Result<CompactionOutcome> {
        self.ensure_open()?;
        if plan.session_id != self.state.session_id {
            return Err(TrackerError::InvalidInput(format!(
                "plan for session {} applied to session {}",
                plan.session_id, self.state.session_id
            )));
        }

        let total_before = self.state.total();
        let tier_before = self.budget.tier(total_before);
        let resume_phase = self.state.phase;
        self.state.phase = SessionPhase::Compacting;

        // The state moved on since planning: anything that became protected
        // in the meantime stays.
        let protected_now: HashSet<u64> = if plan.revision != self.state.revision {
            let last_turn = self.state.last_turn_index();
            self.state
                .operations
                .iter()
                .enumerate()
                .filter(|(i, _)| candidates::is_protected(&self.state, *i, last_turn))
                .map(|(_, op)| op.id)
                .collect()
        } else {
            HashSet::new()
        };
        if !protected_now.is_empty() {
            debug!(
                "Plan for {} is {} revision(s) old; re-checking protection",
                self.state.session_id,
                self.state.revision.saturating_sub(plan.revision)
            );
        }

        let removal_ids: HashSet<u64> = plan
            .removals
            .iter()
            .map(|r| r.id)
            .filter(|id| !protected_now.contains(id))
            .collect();
        let mut archived = Vec::new();
        let mut reclaimed = 0u64;

        for entry in plan
            .archives
            .iter()
            .filter(|a| !protected_now.contains(&a.operation.id))
        {
            let Some(op) = self
                .state
                .operations
                .iter_mut()
                .find(|op| op.id == entry.operation.id)
            else {
                continue;
            };
            if op.metadata.archived {
                continue;
            }
            let turn = ArchivedTurn {
                operation_id: op.id,
                timestamp: op.timestamp,
                summary: entry.summary.clone(),
                original_tokens: op.estimated_tokens,
            };
            if !removal_ids.contains(&op.id) {
                let new_tokens = entry.summary_tokens.min(op.estimated_tokens);
                let saved = op.estimated_tokens - new_tokens;
                let category = op.category;
                op.estimated_tokens = new_tokens;
                op.metadata.archived = true;
                op.metadata.summary = Some(entry.summary.clone());
                self.state.subtract(category, saved);
                reclaimed += saved;
            }
            archived.push(turn);
        }

        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.state.operations.len());
        for op in std::mem::take(&mut self.state.operations) {
            if removal_ids.contains(&op.id) {
                removed.push(op.to_ref());
            } else {
                kept.push(op);
            }
        }
        self.state.operations = kept;
        for r in &removed {
            self.state.subtract(r.category, r.estimated_tokens);
            reclaimed += r.estimated_tokens;
        }

        self.state.archived_turns.extend(archived.iter().cloned());
        self.state.reclaimed_total += reclaimed;
        if !removed.is_empty() || !archived.is_empty() {
            self.state.revision += 1;
        }

        let total_after = self.state.total();
        let tier_after = self.budget.tier(total_after);
        self.state.phase = match (plan.policy, resume_phase) {
            (CompactionPolicy::Emergency, _) => SessionPhase::HandoffPending,
            (_, SessionPhase::HandoffPending) => SessionPhase::HandoffPending,
            _ if tier_after == AlertTier::Critical => SessionPhase::Critical,
            _ => SessionPhase::Active,
        };

        debug!(
            "Compaction ({}) on {}: removed {} ops, archived {} turns, reclaimed {reclaimed} tokens",
            plan.policy,
            self.state.session_id,
            removed.len(),
            archived.len()
        );

        Ok(CompactionOutcome {
            session_id: self.state.session_id.clone(),
            policy: plan.policy,
            removed,
            archived,
            reclaimed_tokens: reclaimed,
            total_before,
            total_after,
            tier_before,
            tier_after,
            restart_required: plan.restart_required,
            handoff_id: None,
        })
    }

    /// Move to the terminal phase. Further mutations fail.
    /// Remember the handoff an emergency compaction wrote for this session.
    pub fn mark_handoff(&mut self, handoff_id: impl Into<String>) {
        self.state.pending_handoff = Some(handoff_id.into());
        self.state.revision += 1;
    }

    pub fn close(&mut self) {
        if self.state.phase != SessionPhase::Closed {
            self.state.phase = SessionPhase::Closed;
            self.state.revision += 1;
        }
    }
}
