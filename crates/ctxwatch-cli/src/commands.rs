//! Command implementations. Each returns the text to print so the binary
//! stays a thin shell and tests can drive commands directly.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::result::Result;
use std::sync::Arc;

use chrono::Utc;
use ctxwatch::adapters::read_transcript;
use ctxwatch::prelude::*;
use tracing::{debug, warn};

use crate::cli::{Cli, Command};
use crate::config::CliConfig;

/// Run one CLI invocation against the persisted state.
pub async fn run(cli: &Cli) -> Result<String, String> {
    let config = CliConfig::resolve(cli.config.as_deref(), cli.data_dir.clone(), &cli.overrides())?;
    debug!("State directory: {}", config.state_dir().display());
    let store = Arc::new(FileStore::new(config.state_dir()));
    let monitor = UsageMonitor::open(config.tracker.clone(), store)
        .await
        .map_err(|e| format!("failed to load state: {e}"))?;

    match &cli.command {
        Command::Ingest { file, transcript } => ingest(&monitor, file, *transcript).await,
        Command::Status { session, json } => status(&monitor, session.as_deref(), *json).await,
        Command::Compact {
            session,
            policy,
            yes,
        } => compact(&monitor, session, policy, *yes).await,
        Command::Close { session } => close(&monitor, session).await,
        Command::CloseFile { session, path } => close_file(&monitor, session, path).await,
        Command::Handoff { project } => {
            let project = resolve_project(project);
            let pending = monitor
                .handoffs()
                .load_handoff(&project)
                .await
                .map_err(|e| e.to_string())?;
            Ok(match pending {
                Some(handoff) => handoff.render_markdown(),
                None => format!("No pending handoff for {project}\n"),
            })
        }
        Command::Bootstrap { project } => {
            let project = resolve_project(project);
            let boot = monitor.bootstrap(&project).await.map_err(|e| e.to_string())?;
            let mut out = boot.memory.summary();
            if let Some(latest) = boot.latest() {
                out.push('\n');
                out.push_str(&latest.render_markdown());
            }
            Ok(out)
        }
    }
}

/// Project paths are stored as absolute paths, the way session logs report
/// their working directory.
fn resolve_project(project: &str) -> String {
    std::fs::canonicalize(project)
        .unwrap_or_else(|_| PathBuf::from(project))
        .to_string_lossy()
        .to_string()
}

// ── ingest ─────────────────────────────────────────────────────────

/// Counts from one ingest run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub recorded: usize,
    pub dropped: usize,
    /// Lines or events rejected as invalid.
    pub rejected: usize,
    pub compactions: usize,
}

impl IngestSummary {
    pub fn render(&self) -> String {
        format!(
            "Ingested {} event(s): {} dropped as out of order, {} rejected, {} compaction(s)\n",
            self.recorded, self.dropped, self.rejected, self.compactions
        )
    }
}

async fn ingest(monitor: &UsageMonitor, file: &Path, transcript: bool) -> Result<String, String> {
    let mut summary = IngestSummary::default();
    let events = if transcript {
        read_transcript(file)
            .await
            .map_err(|e| format!("failed to read transcript '{}': {e}", file.display()))?
    } else {
        let content = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| format!("failed to read '{}': {e}", file.display()))?;
        let mut events = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match UsageEvent::from_json_line(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!("{}:{}: {e}", file.display(), n + 1);
                    summary.rejected += 1;
                }
            }
        }
        events
    };

    for event in events {
        match monitor.ingest(event).await {
            Ok(IngestOutcome::Recorded { compactions, .. }) => {
                summary.recorded += 1;
                summary.compactions += compactions.len();
            }
            Ok(IngestOutcome::Dropped { .. }) => summary.dropped += 1,
            Err(e) => {
                warn!("Rejected event: {e}");
                summary.rejected += 1;
            }
        }
    }
    monitor.checkpoint().await.map_err(|e| e.to_string())?;

    let mut out = summary.render();
    out.push_str(&render_status(
        &monitor.quota_status(Utc::now()),
        &monitor.snapshots().await,
    ));
    Ok(out)
}

// ── status ─────────────────────────────────────────────────────────

async fn status(monitor: &UsageMonitor, session: Option<&str>, json: bool) -> Result<String, String> {
    let quota = monitor.quota_status(Utc::now());
    let snapshots = match session {
        Some(id) => vec![
            monitor
                .snapshot(id)
                .await
                .ok_or_else(|| format!("unknown session: {id}"))?,
        ],
        None => monitor.snapshots().await,
    };
    if json {
        let value = serde_json::json!({ "quota": quota, "sessions": snapshots });
        return serde_json::to_string_pretty(&value)
            .map(|s| s + "\n")
            .map_err(|e| format!("failed to serialize status: {e}"));
    }
    Ok(render_status(&quota, &snapshots))
}

/// Quota line followed by one line per session.
pub fn render_status(quota: &QuotaStatus, snapshots: &[UsageSnapshot]) -> String {
    let mut out = format!("{}\n", quota.to_log_string());
    if snapshots.is_empty() {
        out.push_str("No tracked sessions\n");
    }
    for s in snapshots {
        let _ = writeln!(
            out,
            "{}  {} / {} tokens ({:.1}%)  {}  {}",
            s.session_id, s.total, s.working_ceiling, s.percent, s.tier, s.phase
        );
        if let Some(advice) = &s.advisory {
            let _ = writeln!(out, "    {advice}");
        }
    }
    out
}

// ── compact / close ────────────────────────────────────────────────

async fn compact(monitor: &UsageMonitor, session: &str, policy: &str, yes: bool) -> Result<String, String> {
    let mut policy: CompactionPolicy = policy.parse().map_err(|e: TrackerError| e.to_string())?;
    if yes {
        policy = policy.confirmed();
    }
    let outcome = monitor.compact(session, policy).await.map_err(|e| match e {
        TrackerError::ConfirmationRequired(_) => format!("{e}; rerun with --yes"),
        other => other.to_string(),
    })?;
    monitor.checkpoint().await.map_err(|e| e.to_string())?;
    Ok(render_outcome(&outcome))
}

pub fn render_outcome(outcome: &CompactionOutcome) -> String {
    let mut out = format!(
        "{} compaction of {}: removed {}, archived {}, reclaimed {} tokens\n{} -> {} tokens ({} -> {})\n",
        outcome.policy,
        outcome.session_id,
        outcome.removed.len(),
        outcome.archived.len(),
        outcome.reclaimed_tokens,
        outcome.total_before,
        outcome.total_after,
        outcome.tier_before,
        outcome.tier_after,
    );
    if let Some(id) = &outcome.handoff_id {
        let _ = writeln!(out, "Handoff {id} written");
    }
    if outcome.restart_required {
        out.push_str("Restart the session from the handoff.\n");
    }
    out
}

async fn close(monitor: &UsageMonitor, session: &str) -> Result<String, String> {
    let handoff = monitor
        .close_session(session, HandoffTrigger::Manual)
        .await
        .map_err(|e| e.to_string())?;
    monitor.checkpoint().await.map_err(|e| e.to_string())?;
    Ok(handoff.render_markdown())
}

/// Files written through the transcript stay open until closed here.
async fn close_file(monitor: &UsageMonitor, session: &str, path: &str) -> Result<String, String> {
    let was_open = monitor
        .session_state(session)
        .await
        .ok_or_else(|| format!("unknown session: {session}"))?
        .files
        .is_open(path);
    monitor
        .annotate(
            session,
            SessionNote::FileClosed {
                path: path.to_string(),
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    if !was_open {
        return Ok(format!("{path} was not open in {session}\n"));
    }
    monitor.checkpoint().await.map_err(|e| e.to_string())?;
    Ok(format!("Closed {path} in {session}\n"))
}
