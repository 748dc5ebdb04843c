//! Session handoffs: the durable bridge between a session that filled its
//! context and the one that picks up after it.
//!
//! A [`Handoff`] is built from structured session notes (never from parsed
//! model output), written once, and later folded into the project's
//! [`ProjectMemory`] by the next session's bootstrap. Folding is idempotent
//! per handoff id.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::{ArchivedTurn, Category, ContextState, OperationRef};
use crate::error::{Result, TrackerError};
use crate::fingerprint::project_key;
use crate::memory::{Decision, ProjectMemory, SessionHistoryEntry};
use crate::quota::QuotaStatus;
use crate::retry::{RetryConfig, with_retry};
use crate::store::StateStore;

/// What caused a handoff to be written.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandoffTrigger {
    Strategic,
    Emergency,
    Manual,
}

impl std::fmt::Display for HandoffTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandoffTrigger::Strategic => write!(f, "strategic"),
            HandoffTrigger::Emergency => write!(f, "emergency"),
            HandoffTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// An operation a compaction dropped from the context window.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RemovedOperation {
    pub operation_id: u64,
    pub category: Category,
    pub tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl std::fmt::Display for RemovedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} op {}", self.category, self.operation_id)?;
        if let Some(path) = &self.file_path {
            write!(f, " `{path}`")?;
        } else if let Some(summary) = &self.summary {
            write!(f, ": {summary}")?;
        }
        write!(f, " ({} tokens)", self.tokens)
    }
}

/// Immutable record of one session's outcome.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Handoff {
    pub id: String,
    pub source_session_id: String,
    pub project_path: String,
    pub project_key: String,
    pub created_at: DateTime<Utc>,
    pub trigger: HandoffTrigger,
    pub accomplishments: Vec<String>,
    pub decisions: Vec<Decision>,
    pub next_steps: Vec<String>,
    /// Files in play and the context footprint at handoff time.
    pub preserved_context: String,
    #[serde(default)]
    pub archived_turns: Vec<ArchivedTurn>,
    /// Operations removed by the compaction that wrote this handoff.
    #[serde(default)]
    pub removed: Vec<RemovedOperation>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    pub tokens_at_handoff: u64,
    pub quota_remaining: u64,
    /// Key of the project memory this handoff updates.
    pub memory_ref: String,
}

impl Handoff {
    /// Synthesize a handoff from a session's state.
    ///
    /// Fails with [`TrackerError::IncompleteSession`] if the session never
    /// recorded an operation.
    pub fn create(
        state: &ContextState,
        quota: &QuotaStatus,
        memory: &ProjectMemory,
        trigger: HandoffTrigger,
    ) -> Result<Self> {
        if !state.has_operations() {
            return Err(TrackerError::IncompleteSession(state.session_id.clone()));
        }

        let mut preserved = format!(
            "Context at handoff: {} tokens across {} operations ({} reclaimed by compaction).\n",
            state.total(),
            state.operations.len(),
            state.reclaimed_total
        );
        let files = state.files.build_preservation_note();
        if !files.is_empty() {
            preserved.push_str(&files);
        }

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_session_id: state.session_id.clone(),
            project_path: state.project_path.clone(),
            project_key: project_key(&state.project_path),
            created_at: Utc::now(),
            trigger,
            accomplishments: state.notes.accomplishments.clone(),
            decisions: state.notes.decisions.clone(),
            next_steps: state.notes.next_steps.clone(),
            preserved_context: preserved,
            archived_turns: state.archived_turns.clone(),
            removed: Vec::new(),
            tech_stack: state.notes.tech_stack.iter().cloned().collect(),
            tokens_at_handoff: state.total(),
            quota_remaining: quota.remaining,
            memory_ref: memory.project_key.clone(),
        })
    }

    /// Add turns archived by a compaction that has not been applied yet.
    pub fn with_archived_turns(mut self, turns: impl IntoIterator<Item = ArchivedTurn>) -> Self {
        for turn in turns {
            if !self
                .archived_turns
                .iter()
                .any(|t| t.operation_id == turn.operation_id)
            {
                self.archived_turns.push(turn);
            }
        }
        self
    }

    /// Record the operations a pending compaction will remove. Refs that
    /// are no longer in `state` are skipped.
    pub fn with_removed(mut self, state: &ContextState, removals: &[OperationRef]) -> Self {
        self.removed.extend(removals.iter().filter_map(|r| {
            state.operation(r.id).map(|op| RemovedOperation {
                operation_id: op.id,
                category: op.category,
                tokens: op.estimated_tokens,
                file_path: op.metadata.file_path.clone(),
                summary: op.metadata.summary.clone(),
            })
        }));
        self
    }

    /// The markdown handoff file.
    pub fn render_markdown(&self) -> String {
        let mut md = format!("# Session Handoff: {}\n\n", self.source_session_id);
        md.push_str(&format!(
            "- Project: `{}`\n- Created: {}\n- Trigger: {}\n- Handoff id: {}\n\n",
            self.project_path,
            self.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.trigger,
            self.id
        ));

        section(&mut md, "Accomplishments", &self.accomplishments, |s| format!("- {s}"));
        if !self.decisions.is_empty() {
            md.push_str("## Decisions\n\n");
            for d in &self.decisions {
                md.push_str(&format!("- **{}**: {}\n", d.decision, d.rationale));
            }
            md.push('\n');
        }
        if !self.next_steps.is_empty() {
            md.push_str("## Next Steps\n\n");
            for (i, step) in self.next_steps.iter().enumerate() {
                md.push_str(&format!("{}. {step}\n", i + 1));
            }
            md.push('\n');
        }
        section(&mut md, "Tech Stack", &self.tech_stack, |s| format!("- {s}"));

        md.push_str("## Preserved Context\n\n");
        md.push_str(self.preserved_context.trim_end());
        md.push_str("\n\n");

        if !self.archived_turns.is_empty() {
            md.push_str("## Archived Conversation\n\n");
            for turn in &self.archived_turns {
                md.push_str(&format!("- {}\n", turn.summary));
            }
            md.push('\n');
        }

        if !self.removed.is_empty() {
            let total: u64 = self.removed.iter().map(|r| r.tokens).sum();
            md.push_str(&format!("## Removed From Context ({total} tokens)\n\n"));
            for op in &self.removed {
                md.push_str(&format!("- {op}\n"));
            }
            md.push('\n');
        }

        md.push_str(&format!(
            "## Status\n\n- Context tokens at handoff: {}\n- Quota remaining: {}\n",
            self.tokens_at_handoff, self.quota_remaining
        ));
        md
    }
}

fn section(md: &mut String, title: &str, items: &[String], line: impl Fn(&str) -> String) {
    if items.is_empty() {
        return;
    }
    md.push_str(&format!("## {title}\n\n"));
    for item in items {
        md.push_str(&line(item));
        md.push('\n');
    }
    md.push('\n');
}

/// Fold a handoff into project memory.
///
/// Appends one session-history entry, appends decisions and unions the
/// tech stack. Returns `false` without touching `memory` when the handoff
/// id was already applied.
pub fn apply_handoff_to_memory(handoff: &Handoff, memory: &mut ProjectMemory) -> bool {
    if memory.has_applied(&handoff.id) {
        return false;
    }
    memory.sessions.push(SessionHistoryEntry {
        handoff_id: handoff.id.clone(),
        session_id: handoff.source_session_id.clone(),
        ended_at: handoff.created_at,
        trigger: handoff.trigger,
        accomplishments: handoff.accomplishments.clone(),
        tokens_at_handoff: handoff.tokens_at_handoff,
    });
    memory.decisions.extend(handoff.decisions.iter().cloned());
    memory.tech_stack.extend(handoff.tech_stack.iter().cloned());
    memory.applied_handoffs.insert(handoff.id.clone());
    memory.updated_at = memory.updated_at.max(handoff.created_at);
    true
}

/// [`ProjectMemory::analyze`] walks the project directory with blocking
/// I/O, so it runs on the blocking pool.
async fn analyze_project(project_path: &str) -> ProjectMemory {
    let path = project_path.to_string();
    match tokio::task::spawn_blocking(move || ProjectMemory::analyze(&path, Utc::now())).await {
        Ok(memory) => memory,
        Err(e) => {
            warn!("Project analysis for {project_path} failed: {e}");
            ProjectMemory::new(project_path, Utc::now())
        }
    }
}

/// Result of bootstrapping a new session on a project.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub memory: ProjectMemory,
    /// Handoffs folded in by this bootstrap, oldest first.
    pub applied: Vec<Handoff>,
    /// The memory did not exist and was created by analysing the project.
    pub created: bool,
}

impl Bootstrap {
    /// The handoff the new session continues from.
    pub fn latest(&self) -> Option<&Handoff> {
        self.applied.last()
    }
}

/// Writes handoffs and is the only writer of project session history.
pub struct HandoffManager {
    store: Arc<dyn StateStore>,
    retry: RetryConfig,
    /// One async lock per project key; memory updates for a project are
    /// serialized across sessions.
    project_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl HandoffManager {
    pub fn new(store: Arc<dyn StateStore>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry,
            project_locks: DashMap::new(),
        }
    }

    fn project_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.project_locks
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    pub fn create_handoff(
        &self,
        state: &ContextState,
        quota: &QuotaStatus,
        memory: &ProjectMemory,
        trigger: HandoffTrigger,
    ) -> Result<Handoff> {
        Handoff::create(state, quota, memory, trigger)
    }

    /// Write a handoff, retrying transient failures. On failure the caller
    /// still owns the handoff and can persist it again later.
    pub async fn persist(&self, handoff: &Handoff) -> Result<()> {
        with_retry(&self.retry, "save handoff", || self.store.save_handoff(handoff)).await?;
        info!(
            "Wrote {} handoff {} for session {}",
            handoff.trigger, handoff.id, handoff.source_session_id
        );
        Ok(())
    }

    /// Project memory as stored, if any.
    pub async fn load_memory(&self, project_path: &str) -> Result<Option<ProjectMemory>> {
        let key = project_key(project_path);
        with_retry(&self.retry, "load memory", || self.store.load_memory(&key)).await
    }

    async fn pending_handoffs(&self, key: &str, memory: Option<&ProjectMemory>) -> Result<Vec<Handoff>> {
        let handoffs = with_retry(&self.retry, "list handoffs", || self.store.list_handoffs(key)).await?;
        Ok(handoffs
            .into_iter()
            .filter(|h| memory.is_none_or(|m| !m.has_applied(&h.id)))
            .collect())
    }

    /// The most recent handoff for a project not yet folded into its memory.
    pub async fn load_handoff(&self, project_path: &str) -> Result<Option<Handoff>> {
        let key = project_key(project_path);
        let memory = self.load_memory(project_path).await?;
        Ok(self.pending_handoffs(&key, memory.as_ref()).await?.pop())
    }

    /// A persisted handoff by id.
    pub async fn find_handoff(&self, project_path: &str, handoff_id: &str) -> Result<Option<Handoff>> {
        let key = project_key(project_path);
        let handoffs = with_retry(&self.retry, "list handoffs", || self.store.list_handoffs(&key)).await?;
        Ok(handoffs.into_iter().find(|h| h.id == handoff_id))
    }

    pub fn apply_handoff_to_memory(&self, handoff: &Handoff, memory: &mut ProjectMemory) -> bool {
        apply_handoff_to_memory(handoff, memory)
    }

    /// Save project memory under its project lock.
    pub async fn save_memory(&self, memory: &ProjectMemory) -> Result<()> {
        let lock = self.project_lock(&memory.project_key);
        let _guard = lock.lock().await;
        with_retry(&self.retry, "save memory", || self.store.save_memory(memory)).await
    }

    /// Start a session on a project: load (or create) its memory, fold in
    /// every unconsumed handoff in order and save the result.
    pub async fn bootstrap(&self, project_path: &str) -> Result<Bootstrap> {
        let key = project_key(project_path);
        let lock = self.project_lock(&key);
        let _guard = lock.lock().await;

        let stored = with_retry(&self.retry, "load memory", || self.store.load_memory(&key)).await?;
        let created = stored.is_none();
        let mut memory = match stored {
            Some(memory) => memory,
            None => analyze_project(project_path).await,
        };

        let pending = self.pending_handoffs(&key, Some(&memory)).await?;
        let mut applied = Vec::new();
        for handoff in pending {
            if apply_handoff_to_memory(&handoff, &mut memory) {
                applied.push(handoff);
            }
        }

        if created || !applied.is_empty() {
            memory.updated_at = memory.updated_at.max(Utc::now());
            with_retry(&self.retry, "save memory", || self.store.save_memory(&memory)).await?;
        }
        debug!(
            "Bootstrapped {project_path}: {} handoff(s) applied, {} sessions in history",
            applied.len(),
            memory.sessions.len()
        );
        Ok(Bootstrap {
            memory,
            applied,
            created,
        })
    }
}
