//! Usage events in, tracker events out.
//!
//! [`UsageEvent`] is the input record the monitor ingests: one
//! token-consuming operation of one session. [`TrackerEvent`] is what the
//! monitor reports back as state changes. Callers implement
//! [`EventHandler`] to observe tracker events for logging, dashboards or
//! approval prompts.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests; denies nothing, approves nothing |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::context::{
    AlertTier, Category, CompactionOutcome, CompactionPolicy, OperationMetadata, OperationRef,
    UsageSnapshot,
};
use crate::error::{Result, TrackerError};
use crate::handoff::Handoff;
use crate::quota::QuotaWindow;

// ── Input ──────────────────────────────────────────────────────────

/// One token-consuming operation reported by a collaborator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UsageEvent {
    #[serde(alias = "sessionId")]
    pub session_id: String,
    #[serde(default, alias = "projectPath", alias = "cwd")]
    pub project_path: String,
    pub category: Category,
    #[serde(alias = "estimatedTokens", alias = "tokens")]
    pub estimated_tokens: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: OperationMetadata,
}

impl UsageEvent {
    pub fn new(
        session_id: impl Into<String>,
        project_path: impl Into<String>,
        category: Category,
        estimated_tokens: i64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project_path: project_path.into(),
            category,
            estimated_tokens,
            timestamp,
            metadata: OperationMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: OperationMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Parse one JSON line. Malformed records and non-numeric token counts
    /// are [`TrackerError::InvalidInput`].
    pub fn from_json_line(line: &str) -> Result<Self> {
        let event: UsageEvent = serde_json::from_str(line.trim())
            .map_err(|e| TrackerError::InvalidInput(format!("malformed usage event: {e}")))?;
        if event.session_id.is_empty() {
            return Err(TrackerError::InvalidInput("usage event has no session id".into()));
        }
        Ok(event)
    }
}

// ── Output ─────────────────────────────────────────────────────────

/// State changes reported by the [`UsageMonitor`](crate::monitor::UsageMonitor).
#[derive(Debug)]
pub enum TrackerEvent<'a> {
    /// An operation was recorded for a session.
    OperationRecorded {
        session_id: &'a str,
        operation: &'a OperationRef,
    },
    /// An out-of-order event was logged and dropped.
    StaleEventDropped {
        session_id: &'a str,
        error: &'a TrackerError,
    },
    /// A new quota window opened.
    QuotaWindowOpened { window: &'a QuotaWindow },
    /// A session crossed into a different alert tier.
    TierChanged {
        session_id: &'a str,
        from: AlertTier,
        to: AlertTier,
        snapshot: &'a UsageSnapshot,
    },
    /// A compaction needs the caller's go-ahead. Answer with
    /// [`EventResponse::Approve`] to run it.
    ConfirmationRequested {
        session_id: &'a str,
        policy: CompactionPolicy,
        snapshot: &'a UsageSnapshot,
    },
    Compacted { outcome: &'a CompactionOutcome },
    HandoffWritten { handoff: &'a Handoff },
    SessionClosed { session_id: &'a str },
    Bootstrapped {
        project_path: &'a str,
        applied_handoffs: usize,
    },
    /// A store write failed after all retries. In-memory state is intact.
    PersistenceFailed {
        operation: &'a str,
        error: &'a TrackerError,
    },
}

/// Response from an event handler, for events that need feedback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventResponse {
    Approve,
    Deny(String),
}

/// Trait for observing tracker events.
pub trait EventHandler: Send + Sync {
    /// Called for each event. Return `None` for most events; answer
    /// `ConfirmationRequested` with `Approve` or `Deny`. The default
    /// implementation answers nothing, which leaves confirmations pending.
    fn on_event(&self, event: &TrackerEvent<'_>) -> Option<EventResponse> {
        let _ = event;
        None
    }
}

/// Ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&TrackerEvent<'_>) -> Option<EventResponse> + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&TrackerEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&TrackerEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    fn on_event(&self, event: &TrackerEvent<'_>) -> Option<EventResponse> {
        (self.0)(event)
    }
}

/// Dispatches to several handlers in order; the first response wins.
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &TrackerEvent<'_>) -> Option<EventResponse> {
        let mut first = None;
        for handler in &self.handlers {
            let response = handler.on_event(event);
            if first.is_none() {
                first = response;
            }
        }
        first
    }
}

/// Logs every event via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &TrackerEvent<'_>) -> Option<EventResponse> {
        match event {
            TrackerEvent::OperationRecorded {
                session_id,
                operation,
            } => {
                trace!(
                    "[{session_id}] op {} {} +{}t",
                    operation.id, operation.category, operation.estimated_tokens
                );
            }
            TrackerEvent::StaleEventDropped { session_id, error } => {
                warn!("[{session_id}] dropped: {error}");
            }
            TrackerEvent::QuotaWindowOpened { window } => {
                info!(
                    "Quota window opened {} .. {}",
                    window.start.format("%Y-%m-%d %H:%M"),
                    window.end.format("%H:%M")
                );
            }
            TrackerEvent::TierChanged {
                session_id,
                from,
                to,
                snapshot,
            } => {
                if to > from {
                    warn!(
                        "[{session_id}] context {from} -> {to}: {} / {} tokens ({:.1}%)",
                        snapshot.total, snapshot.working_ceiling, snapshot.percent
                    );
                } else {
                    info!(
                        "[{session_id}] context {from} -> {to}: {} / {} tokens ({:.1}%)",
                        snapshot.total, snapshot.working_ceiling, snapshot.percent
                    );
                }
            }
            TrackerEvent::ConfirmationRequested {
                session_id, policy, ..
            } => {
                info!("[{session_id}] {policy} compaction awaiting confirmation");
            }
            TrackerEvent::Compacted { outcome } => {
                info!(
                    "[{}] {} compaction reclaimed {} tokens ({} -> {}, {} -> {})",
                    outcome.session_id,
                    outcome.policy,
                    outcome.reclaimed_tokens,
                    outcome.total_before,
                    outcome.total_after,
                    outcome.tier_before,
                    outcome.tier_after
                );
            }
            TrackerEvent::HandoffWritten { handoff } => {
                info!(
                    "[{}] handoff {} written ({})",
                    handoff.source_session_id, handoff.id, handoff.trigger
                );
            }
            TrackerEvent::SessionClosed { session_id } => {
                info!("[{session_id}] session closed");
            }
            TrackerEvent::Bootstrapped {
                project_path,
                applied_handoffs,
            } => {
                debug!("Bootstrapped {project_path} ({applied_handoffs} handoff(s) applied)");
            }
            TrackerEvent::PersistenceFailed { operation, error } => {
                warn!("{operation}: {error}");
            }
        }
        None
    }
}
