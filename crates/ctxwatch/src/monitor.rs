//! The facade collaborators call: ingest usage events, query usage,
//! compact, annotate and close sessions.
//!
//! # Locking
//!
//! Each session's [`ContextTracker`] sits behind its own async mutex in a
//! [`DashMap`] keyed by session id, so sessions never contend with each
//! other. The quota tracker has its own short-lived lock. No lock is held
//! across store I/O: compaction plans under the session lock, releases it
//! while the handoff is written, then re-locks to apply. Dropping a
//! `compact` future before that last step leaves the session untouched.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::context::{
    AlertTier, CompactionCandidate, CompactionOutcome, CompactionPolicy, ContextState,
    ContextTracker, OperationRef, SessionPhase, UsageSnapshot,
};
use crate::error::{Result, TrackerError};
use crate::events::{EventHandler, EventResponse, LoggingHandler, TrackerEvent, UsageEvent};
use crate::handoff::{Bootstrap, Handoff, HandoffManager, HandoffTrigger};
use crate::memory::ProjectMemory;
use crate::quota::{QuotaStatus, QuotaTracker};
use crate::retry::with_retry;
use crate::store::StateStore;

/// A structured note attached to a session while it runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionNote {
    Accomplishment { text: String },
    Decision { decision: String, rationale: String },
    NextStep { text: String },
    Tech { name: String },
    /// The session finished editing a file.
    FileClosed { path: String },
}

/// What happened to an ingested event.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Recorded {
        operation: OperationRef,
        /// False when the quota side rejected the event as stale.
        quota_applied: bool,
        tier: AlertTier,
        /// Compactions the event triggered, in order.
        compactions: Vec<CompactionOutcome>,
    },
    /// The event was out of order for its session and was dropped.
    Dropped { session_id: String, reason: String },
}

impl IngestOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, IngestOutcome::Recorded { .. })
    }
}

type SessionSlot = Arc<Mutex<ContextTracker>>;

/// Tracks quota and context usage across sessions.
pub struct UsageMonitor {
    config: TrackerConfig,
    quota: QuotaTracker,
    sessions: DashMap<String, SessionSlot>,
    handoffs: HandoffManager,
    store: Arc<dyn StateStore>,
    handler: Box<dyn EventHandler>,
}

impl UsageMonitor {
    /// Create a monitor with empty state. Events are logged via
    /// [`LoggingHandler`] until [`with_handler`](Self::with_handler) replaces it.
    pub fn new(config: TrackerConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            quota: QuotaTracker::new(config.quota.clone()),
            sessions: DashMap::new(),
            handoffs: HandoffManager::new(store.clone(), config.persistence.clone()),
            store,
            handler: Box::new(LoggingHandler),
            config,
        })
    }

    /// Create a monitor and restore checkpointed state from the store.
    pub async fn open(config: TrackerConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        let monitor = Self::new(config, store)?;
        monitor.restore().await?;
        Ok(monitor)
    }

    pub fn with_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn handoffs(&self) -> &HandoffManager {
        &self.handoffs
    }

    fn emit(&self, event: TrackerEvent<'_>) -> Option<EventResponse> {
        self.handler.on_event(&event)
    }

    fn slot(&self, session_id: &str) -> Option<SessionSlot> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    fn require_slot(&self, session_id: &str) -> Result<SessionSlot> {
        self.slot(session_id)
            .ok_or_else(|| TrackerError::UnknownSession(session_id.to_string()))
    }

    /// Slot for the event's session, created on its first event.
    fn slot_for(&self, event: &UsageEvent) -> SessionSlot {
        self.sessions
            .entry(event.session_id.clone())
            .or_insert_with(|| {
                debug!("Tracking new session {}", event.session_id);
                Arc::new(Mutex::new(ContextTracker::new(
                    event.session_id.clone(),
                    event.project_path.clone(),
                    event.timestamp,
                    &self.config,
                )))
            })
            .clone()
    }

    /// Retry a store operation; report the final failure to the handler.
    async fn persist<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::io::Result<T>>,
    {
        let result = with_retry(&self.config.persistence, operation, op).await;
        if let Err(error) = &result {
            self.emit(TrackerEvent::PersistenceFailed { operation, error });
        }
        result
    }

    // ── Ingestion ──

    /// Record one usage event into its session's context and the shared
    /// quota.
    ///
    /// Out-of-order events are logged and reported as
    /// [`IngestOutcome::Dropped`] rather than failing. When `auto_soft` is
    /// on, soft compaction runs as soon as the session reaches warning.
    /// Crossing into danger or critical asks the handler for confirmation
    /// and runs the matching compaction on [`EventResponse::Approve`].
    pub async fn ingest(&self, event: UsageEvent) -> Result<IngestOutcome> {
        if event.estimated_tokens < 0 {
            return Err(TrackerError::InvalidInput(format!(
                "estimated tokens must be non-negative, got {}",
                event.estimated_tokens
            )));
        }
        let session_id = event.session_id.clone();
        let slot = self.slot_for(&event);
        let mut tracker = slot.lock().await;
        let tier_before = tracker.tier();

        let operation = match tracker.record_operation(
            event.category,
            event.estimated_tokens,
            event.metadata,
            event.timestamp,
        ) {
            Ok(op) => op,
            Err(error) if error.is_stale() => {
                self.emit(TrackerEvent::StaleEventDropped {
                    session_id: &session_id,
                    error: &error,
                });
                return Ok(IngestOutcome::Dropped {
                    session_id,
                    reason: error.to_string(),
                });
            }
            Err(error) => return Err(error),
        };
        self.emit(TrackerEvent::OperationRecorded {
            session_id: &session_id,
            operation: &operation,
        });

        let quota_applied =
            match self
                .quota
                .charge(&session_id, event.estimated_tokens, event.timestamp)
            {
                Ok(charge) => {
                    if charge.opened {
                        self.emit(TrackerEvent::QuotaWindowOpened {
                            window: &charge.window,
                        });
                    }
                    true
                }
                Err(error) if error.is_stale() => {
                    self.emit(TrackerEvent::StaleEventDropped {
                        session_id: &session_id,
                        error: &error,
                    });
                    false
                }
                Err(error) => return Err(error),
            };

        let mut compactions = Vec::new();
        if self.config.compaction.auto_soft && tracker.tier() >= AlertTier::Warning {
            let plan = tracker.plan(CompactionPolicy::Soft)?;
            if !plan.is_empty() {
                let outcome = tracker.apply_plan(&plan)?;
                self.emit(TrackerEvent::Compacted { outcome: &outcome });
                compactions.push(outcome);
            }
        }

        let tier = tracker.tier();
        let mut escalation = None;
        if tier != tier_before {
            let snapshot = tracker.usage_snapshot();
            self.emit(TrackerEvent::TierChanged {
                session_id: &session_id,
                from: tier_before,
                to: tier,
                snapshot: &snapshot,
            });
            let escalating = tier > tier_before && tracker.phase() != SessionPhase::HandoffPending;
            if let Some(policy) = CompactionPolicy::recommended(tier).filter(|_| escalating)
                && policy != CompactionPolicy::Soft
            {
                let response = self.emit(TrackerEvent::ConfirmationRequested {
                    session_id: &session_id,
                    policy,
                    snapshot: &snapshot,
                });
                if response == Some(EventResponse::Approve) {
                    escalation = Some(policy.confirmed());
                }
            }
        }

        let tier = match escalation {
            Some(CompactionPolicy::Emergency) => {
                drop(tracker);
                let outcome = self.compact(&session_id, CompactionPolicy::Emergency).await?;
                let tier = outcome.tier_after;
                compactions.push(outcome);
                tier
            }
            Some(policy) => {
                let outcome = tracker.compact(policy)?;
                self.emit(TrackerEvent::Compacted { outcome: &outcome });
                let tier = outcome.tier_after;
                compactions.push(outcome);
                tier
            }
            None => tier,
        };

        Ok(IngestOutcome::Recorded {
            operation,
            quota_applied,
            tier,
            compactions,
        })
    }

    // ── Queries (never fail) ──

    pub async fn snapshot(&self, session_id: &str) -> Option<UsageSnapshot> {
        let slot = self.slot(session_id)?;
        let tracker = slot.lock().await;
        Some(tracker.usage_snapshot())
    }

    /// Snapshots of every tracked session, sorted by session id.
    pub async fn snapshots(&self) -> Vec<UsageSnapshot> {
        let reads = self
            .all_slots()
            .into_iter()
            .map(|slot| async move { slot.lock().await.usage_snapshot() });
        let mut snapshots = futures::future::join_all(reads).await;
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    pub async fn session_state(&self, session_id: &str) -> Option<ContextState> {
        let slot = self.slot(session_id)?;
        let tracker = slot.lock().await;
        Some(tracker.state().clone())
    }

    pub async fn candidates(&self, session_id: &str) -> Option<Vec<CompactionCandidate>> {
        let slot = self.slot(session_id)?;
        let tracker = slot.lock().await;
        Some(tracker.identify_compaction_candidates())
    }

    pub fn quota_status(&self, now: DateTime<Utc>) -> QuotaStatus {
        self.quota.status(now)
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Clone the slot handles so no map shard stays locked across an await.
    fn all_slots(&self) -> Vec<SessionSlot> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    // ── Mutations ──

    async fn memory_or_new(&self, project_path: &str) -> Result<ProjectMemory> {
        Ok(self
            .handoffs
            .load_memory(project_path)
            .await?
            .unwrap_or_else(|| ProjectMemory::new(project_path, Utc::now())))
    }

    /// Compact a session.
    ///
    /// Emergency compaction writes a handoff covering everything it removes
    /// before the removal is applied; if that write fails the session is
    /// left as it was.
    pub async fn compact(&self, session_id: &str, policy: CompactionPolicy) -> Result<CompactionOutcome> {
        let slot = self.require_slot(session_id)?;
        let project_path = slot.lock().await.state().project_path.clone();
        let memory = match policy {
            CompactionPolicy::Emergency => Some(self.memory_or_new(&project_path).await?),
            _ => None,
        };

        let (plan, handoff) = {
            let tracker = slot.lock().await;
            let plan = tracker.plan(policy)?;
            let handoff = match &memory {
                Some(memory) => Some(
                    self.handoffs
                        .create_handoff(
                            tracker.state(),
                            &self.quota.status(Utc::now()),
                            memory,
                            HandoffTrigger::Emergency,
                        )?
                        .with_archived_turns(plan.archived_turns(tracker.state()))
                        .with_removed(tracker.state(), &plan.removals),
                ),
                None => None,
            };
            (plan, handoff)
        };

        if let Some(handoff) = &handoff {
            self.persist("save handoff", || self.store.save_handoff(handoff))
                .await?;
            self.emit(TrackerEvent::HandoffWritten { handoff });
        }

        let mut outcome = {
            let mut tracker = slot.lock().await;
            let outcome = tracker.apply_plan(&plan)?;
            if let Some(handoff) = &handoff {
                tracker.mark_handoff(&handoff.id);
            }
            outcome
        };
        outcome.handoff_id = handoff.map(|h| h.id);
        self.emit(TrackerEvent::Compacted { outcome: &outcome });
        Ok(outcome)
    }

    /// Attach a structured note to a session.
    pub async fn annotate(&self, session_id: &str, note: SessionNote) -> Result<()> {
        let slot = self.require_slot(session_id)?;
        let mut tracker = slot.lock().await;
        match note {
            SessionNote::Accomplishment { text } => tracker.record_accomplishment(text),
            SessionNote::Decision {
                decision,
                rationale,
            } => tracker.record_decision(decision, rationale),
            SessionNote::NextStep { text } => tracker.record_next_step(text),
            SessionNote::Tech { name } => tracker.record_tech(name),
            SessionNote::FileClosed { path } => {
                tracker.close_file(&path);
                Ok(())
            }
        }
    }

    /// End a session: write its handoff, mark it closed and checkpoint it.
    ///
    /// A session waiting on the handoff its emergency compaction wrote is
    /// closed with that handoff; no second one is written. The handoff is
    /// folded into project memory by the next [`bootstrap`](Self::bootstrap)
    /// on the project.
    pub async fn close_session(&self, session_id: &str, trigger: HandoffTrigger) -> Result<Handoff> {
        let slot = self.require_slot(session_id)?;
        let (project_path, pending) = {
            let tracker = slot.lock().await;
            if tracker.state().is_closed() {
                return Err(TrackerError::SessionClosed(session_id.to_string()));
            }
            let pending = tracker
                .state()
                .pending_handoff
                .clone()
                .filter(|_| tracker.phase() == SessionPhase::HandoffPending);
            (tracker.state().project_path.clone(), pending)
        };

        let existing = match pending {
            Some(id) => {
                let found = self.handoffs.find_handoff(&project_path, &id).await?;
                if found.is_none() {
                    warn!("Handoff {id} for session {session_id} is missing; writing a new one");
                }
                found
            }
            None => None,
        };

        let handoff = match existing {
            Some(handoff) => {
                debug!("Closing {session_id} with its pending handoff {}", handoff.id);
                handoff
            }
            None => {
                let memory = self.memory_or_new(&project_path).await?;
                let handoff = {
                    let tracker = slot.lock().await;
                    if tracker.state().is_closed() {
                        return Err(TrackerError::SessionClosed(session_id.to_string()));
                    }
                    self.handoffs.create_handoff(
                        tracker.state(),
                        &self.quota.status(Utc::now()),
                        &memory,
                        trigger,
                    )?
                };
                self.persist("save handoff", || self.store.save_handoff(&handoff))
                    .await?;
                self.emit(TrackerEvent::HandoffWritten { handoff: &handoff });
                handoff
            }
        };

        let state = {
            let mut tracker = slot.lock().await;
            tracker.close();
            tracker.state().clone()
        };
        self.emit(TrackerEvent::SessionClosed { session_id });
        self.persist("save context", || self.store.save_context(&state))
            .await?;
        info!("Closed session {session_id} with handoff {}", handoff.id);
        Ok(handoff)
    }

    /// Start work on a project: fold pending handoffs into its memory.
    pub async fn bootstrap(&self, project_path: &str) -> Result<Bootstrap> {
        let boot = self.handoffs.bootstrap(project_path).await?;
        self.emit(TrackerEvent::Bootstrapped {
            project_path,
            applied_handoffs: boot.applied.len(),
        });
        Ok(boot)
    }

    // ── Checkpointing ──

    /// Persist quota history and every session's state. Returns the number
    /// of sessions written.
    pub async fn checkpoint(&self) -> Result<usize> {
        let history = self.quota.history();
        self.persist("save quota", || self.store.save_quota(&history))
            .await?;
        let slots = self.all_slots();
        for slot in &slots {
            let state = slot.lock().await.state().clone();
            self.persist("save context", || self.store.save_context(&state))
                .await?;
        }
        debug!("Checkpointed quota ({} windows) and {} sessions", history.len(), slots.len());
        Ok(slots.len())
    }

    /// Reload quota history and session states from the store. Returns the
    /// number of sessions restored.
    pub async fn restore(&self) -> Result<usize> {
        let history = self.persist("load quota", || self.store.load_quota()).await?;
        self.quota.restore(history);
        let states = self
            .persist("load contexts", || self.store.load_contexts())
            .await?;
        let count = states.len();
        for state in states {
            let tracker = ContextTracker::from_state(state, &self.config);
            self.sessions.insert(
                tracker.session_id().to_string(),
                Arc::new(Mutex::new(tracker)),
            );
        }
        debug!("Restored {count} sessions");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Category, OperationMetadata};
    use crate::events::{FnEventHandler, NoopHandler};
    use crate::store::MemoryStore;
    use chrono::TimeDelta;

    fn t(minute: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + TimeDelta::minutes(minute)
    }

    fn monitor(config: TrackerConfig) -> UsageMonitor {
        UsageMonitor::new(config, Arc::new(MemoryStore::new()))
            .unwrap()
            .with_handler(NoopHandler)
    }

    fn event(session: &str, category: Category, tokens: i64, minute: i64) -> UsageEvent {
        UsageEvent::new(session, "/work/app", category, tokens, t(minute))
    }

    #[tokio::test]
    async fn ingest_updates_context_and_quota() {
        let m = monitor(TrackerConfig::default());
        let outcome = m.ingest(event("s1", Category::SystemPrompt, 3_000, 0)).await.unwrap();
        assert!(outcome.is_recorded());
        m.ingest(event("s2", Category::Conversation, 500, 1)).await.unwrap();

        assert_eq!(m.snapshot("s1").await.unwrap().total, 3_000);
        assert_eq!(m.quota_status(t(2)).used, 3_500);
        assert_eq!(m.session_ids(), vec!["s1", "s2"]);
        assert!(m.snapshot("nope").await.is_none());
    }

    #[tokio::test]
    async fn negative_tokens_have_no_effect() {
        let m = monitor(TrackerConfig::default());
        let err = m.ingest(event("s1", Category::Conversation, -1, 0)).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidInput(_)));
        assert!(m.session_ids().is_empty());
        assert_eq!(m.quota_status(t(0)).used, 0);
    }

    #[tokio::test]
    async fn out_of_order_event_dropped() {
        let m = monitor(TrackerConfig::default());
        m.ingest(event("s1", Category::Conversation, 100, 10)).await.unwrap();
        let outcome = m.ingest(event("s1", Category::Conversation, 100, 5)).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Dropped { .. }));
        assert_eq!(m.snapshot("s1").await.unwrap().total, 100);
        assert_eq!(m.quota_status(t(11)).used, 100);
    }

    #[tokio::test]
    async fn quota_stale_keeps_context_event() {
        let m = monitor(TrackerConfig::default());
        m.ingest(event("s1", Category::Conversation, 100, 60)).await.unwrap();
        // A new session whose first event predates the active window's start.
        let outcome = m.ingest(event("s2", Category::Conversation, 50, 30)).await.unwrap();
        match outcome {
            IngestOutcome::Recorded { quota_applied, .. } => assert!(!quota_applied),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.snapshot("s2").await.unwrap().total, 50);
        assert_eq!(m.quota_status(t(61)).used, 100);
    }

    #[tokio::test]
    async fn approved_strategic_compaction_runs_on_danger() {
        let config = TrackerConfig::default()
            .with_context_limits(2_000, 1_000)
            .with_strategic_keep_turns(1)
            .with_auto_soft(false);
        let m = UsageMonitor::new(config, Arc::new(MemoryStore::new()))
            .unwrap()
            .with_handler(FnEventHandler::new(|e| match e {
                TrackerEvent::ConfirmationRequested {
                    policy: CompactionPolicy::Strategic { .. },
                    ..
                } => Some(EventResponse::Approve),
                _ => None,
            }));

        for minute in 0..4 {
            let e = event("s1", Category::Conversation, 200, minute)
                .with_metadata(OperationMetadata::new().with_summary(format!("turn {minute}")));
            m.ingest(e).await.unwrap();
        }
        // 800 / 1000 = danger.
        let snap = m.snapshot("s1").await.unwrap();
        assert!(snap.total < 800, "old turns archived, total {}", snap.total);
        assert_eq!(m.session_state("s1").await.unwrap().archived_turns.len(), 3);
    }

    #[tokio::test]
    async fn unknown_session_errors_on_mutation() {
        let m = monitor(TrackerConfig::default());
        assert!(matches!(
            m.compact("ghost", CompactionPolicy::Soft).await,
            Err(TrackerError::UnknownSession(_))
        ));
        assert!(matches!(
            m.annotate("ghost", SessionNote::NextStep { text: "x".into() }).await,
            Err(TrackerError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn close_then_mutate_fails() {
        let m = monitor(TrackerConfig::default());
        m.ingest(event("s1", Category::Conversation, 100, 0)).await.unwrap();
        m.annotate("s1", SessionNote::Accomplishment { text: "done".into() })
            .await
            .unwrap();
        let handoff = m.close_session("s1", HandoffTrigger::Manual).await.unwrap();
        assert_eq!(handoff.accomplishments, vec!["done"]);

        let err = m.ingest(event("s1", Category::Conversation, 1, 1)).await.unwrap_err();
        assert!(matches!(err, TrackerError::SessionClosed(_)));
        assert!(matches!(
            m.close_session("s1", HandoffTrigger::Manual).await,
            Err(TrackerError::SessionClosed(_))
        ));
        assert_eq!(m.snapshot("s1").await.unwrap().phase, SessionPhase::Closed);
    }

    #[tokio::test]
    async fn checkpoint_and_restore_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let m = UsageMonitor::new(TrackerConfig::default(), store.clone())
            .unwrap()
            .with_handler(NoopHandler);
        m.ingest(event("s1", Category::FileRead, 700, 0)).await.unwrap();
        m.ingest(event("s2", Category::ToolResult, 300, 1)).await.unwrap();
        assert_eq!(m.checkpoint().await.unwrap(), 2);

        let restored = UsageMonitor::open(TrackerConfig::default(), store).await.unwrap();
        assert_eq!(restored.session_ids(), vec!["s1", "s2"]);
        assert_eq!(restored.snapshot("s1").await.unwrap().total, 700);
        assert_eq!(restored.quota_status(t(2)).used, 1_000);
    }

    #[test]
    fn session_note_json_shape() {
        let note: SessionNote =
            serde_json::from_str(r#"{"kind":"decision","decision":"a","rationale":"b"}"#).unwrap();
        assert_eq!(
            note,
            SessionNote::Decision {
                decision: "a".into(),
                rationale: "b".into()
            }
        );
    }
}
