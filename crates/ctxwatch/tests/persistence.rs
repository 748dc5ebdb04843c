//! Store failures, cancellation and restart behavior.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use chrono::{DateTime, TimeDelta, Utc};
use ctxwatch::context::ContextState;
use ctxwatch::memory::ProjectMemory;
use ctxwatch::prelude::*;
use ctxwatch::quota::QuotaWindow;
use ctxwatch::retry::RetryConfig;
use ctxwatch::store::StoreFuture;

fn t(seconds: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-01T09:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
        + TimeDelta::seconds(seconds)
}

#[derive(Clone, Copy, PartialEq)]
enum HandoffWrites {
    Hang,
    Fail,
}

/// Delegates to a [`MemoryStore`] except for handoff writes, which either
/// never complete or always fail.
struct BrokenHandoffStore {
    inner: MemoryStore,
    mode: HandoffWrites,
    attempts: AtomicUsize,
}

impl BrokenHandoffStore {
    fn new(mode: HandoffWrites) -> Self {
        Self {
            inner: MemoryStore::new(),
            mode,
            attempts: AtomicUsize::new(0),
        }
    }
}

impl StateStore for BrokenHandoffStore {
    fn save_quota<'a>(&'a self, windows: &'a [QuotaWindow]) -> StoreFuture<'a, ()> {
        self.inner.save_quota(windows)
    }
    fn load_quota(&self) -> StoreFuture<'_, Vec<QuotaWindow>> {
        self.inner.load_quota()
    }
    fn save_context<'a>(&'a self, state: &'a ContextState) -> StoreFuture<'a, ()> {
        self.inner.save_context(state)
    }
    fn load_contexts(&self) -> StoreFuture<'_, Vec<ContextState>> {
        self.inner.load_contexts()
    }
    fn save_memory<'a>(&'a self, memory: &'a ProjectMemory) -> StoreFuture<'a, ()> {
        self.inner.save_memory(memory)
    }
    fn load_memory<'a>(&'a self, project_key: &'a str) -> StoreFuture<'a, Option<ProjectMemory>> {
        self.inner.load_memory(project_key)
    }
    fn save_handoff<'a>(&'a self, _handoff: &'a Handoff) -> StoreFuture<'a, ()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            HandoffWrites::Hang => Box::pin(std::future::pending::<io::Result<()>>()),
            HandoffWrites::Fail => Box::pin(async { Err::<(), _>(io::Error::other("disk full")) }),
        }
    }
    fn list_handoffs<'a>(&'a self, project_key: &'a str) -> StoreFuture<'a, Vec<Handoff>> {
        self.inner.list_handoffs(project_key)
    }
}

/// Holds every handoff write until released.
struct GatedStore {
    inner: MemoryStore,
    entered: Notify,
    release: Notify,
}

impl StateStore for GatedStore {
    fn save_quota<'a>(&'a self, windows: &'a [QuotaWindow]) -> StoreFuture<'a, ()> {
        self.inner.save_quota(windows)
    }
    fn load_quota(&self) -> StoreFuture<'_, Vec<QuotaWindow>> {
        self.inner.load_quota()
    }
    fn save_context<'a>(&'a self, state: &'a ContextState) -> StoreFuture<'a, ()> {
        self.inner.save_context(state)
    }
    fn load_contexts(&self) -> StoreFuture<'_, Vec<ContextState>> {
        self.inner.load_contexts()
    }
    fn save_memory<'a>(&'a self, memory: &'a ProjectMemory) -> StoreFuture<'a, ()> {
        self.inner.save_memory(memory)
    }
    fn load_memory<'a>(&'a self, project_key: &'a str) -> StoreFuture<'a, Option<ProjectMemory>> {
        self.inner.load_memory(project_key)
    }
    fn save_handoff<'a>(&'a self, handoff: &'a Handoff) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.save_handoff(handoff).await
        })
    }
    fn list_handoffs<'a>(&'a self, project_key: &'a str) -> StoreFuture<'a, Vec<Handoff>> {
        self.inner.list_handoffs(project_key)
    }
}

async fn seeded(monitor: &UsageMonitor) {
    let events = [
        (Category::SystemPrompt, 5_000, None),
        (Category::FileRead, 3_000, Some("src/lib.rs")),
        (Category::ToolResult, 9_000, None),
        (Category::Conversation, 400, None),
        (Category::Conversation, 300, None),
    ];
    for (i, (category, tokens, path)) in events.into_iter().enumerate() {
        let metadata = path
            .map(OperationMetadata::for_file)
            .unwrap_or_default();
        let e = UsageEvent::new("s1", "/work/app", category, tokens, t(i as i64))
            .with_metadata(metadata);
        monitor.ingest(e).await.unwrap();
    }
}

#[tokio::test]
async fn cancelled_compaction_leaves_session_untouched() {
    let store = Arc::new(BrokenHandoffStore::new(HandoffWrites::Hang));
    let monitor = UsageMonitor::new(TrackerConfig::default(), store.clone())
        .unwrap()
        .with_handler(NoopHandler);
    seeded(&monitor).await;
    let before = monitor.session_state("s1").await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        monitor.compact("s1", CompactionPolicy::Emergency),
    )
    .await;
    assert!(result.is_err(), "compaction should still be waiting on the store");
    assert_eq!(store.attempts.load(Ordering::SeqCst), 1);

    let after = monitor.session_state("s1").await.unwrap();
    assert_eq!(after.total(), before.total());
    assert_eq!(after.operations, before.operations);
    assert_eq!(after.revision, before.revision);
    assert_eq!(after.phase, SessionPhase::Active);

    // The session lock was released; further work proceeds.
    let e = UsageEvent::new("s1", "/work/app", Category::Conversation, 10, t(60));
    assert!(monitor.ingest(e).await.unwrap().is_recorded());
}

#[tokio::test]
async fn edit_started_during_handoff_write_protects_its_file() {
    let store = Arc::new(GatedStore {
        inner: MemoryStore::new(),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let monitor = Arc::new(
        UsageMonitor::new(TrackerConfig::default(), store.clone())
            .unwrap()
            .with_handler(NoopHandler),
    );
    seeded(&monitor).await;
    let read_id = monitor
        .session_state("s1")
        .await
        .unwrap()
        .operations
        .iter()
        .find(|op| op.category == Category::FileRead)
        .map(|op| op.id)
        .unwrap();

    let compaction = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.compact("s1", CompactionPolicy::Emergency).await }
    });
    store.entered.notified().await;

    let edit = UsageEvent::new("s1", "/work/app", Category::GeneratedCode, 800, t(30))
        .with_metadata(OperationMetadata::for_file("src/lib.rs").in_progress());
    assert!(monitor.ingest(edit).await.unwrap().is_recorded());
    store.release.notify_one();

    let outcome = compaction.await.unwrap().unwrap();
    assert!(outcome.removed.iter().all(|r| r.id != read_id));
    let state = monitor.session_state("s1").await.unwrap();
    assert!(state.files.is_open("src/lib.rs"));
    assert!(state.operation(read_id).is_some(), "read of a file under edit was removed");
    assert!(state.operations.iter().all(|op| op.category != Category::ToolResult));
}

#[tokio::test]
async fn failed_handoff_write_reports_and_keeps_state() {
    let store = Arc::new(BrokenHandoffStore::new(HandoffWrites::Fail));
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = failures.clone();
    let config = TrackerConfig::default().with_persistence(RetryConfig::immediate(2));
    let monitor = UsageMonitor::new(config, store.clone())
        .unwrap()
        .with_handler(FnEventHandler::new(move |e| {
            if matches!(e, TrackerEvent::PersistenceFailed { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            None
        }));
    seeded(&monitor).await;
    let before = monitor.snapshot("s1").await.unwrap();

    let err = monitor
        .compact("s1", CompactionPolicy::Emergency)
        .await
        .unwrap_err();
    match err {
        TrackerError::PersistenceFailure {
            operation,
            attempts,
            ..
        } => {
            assert_eq!(operation, "save handoff");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.snapshot("s1").await.unwrap(), before);

    let err = monitor
        .close_session("s1", HandoffTrigger::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::PersistenceFailure { .. }));
    assert_eq!(
        monitor.snapshot("s1").await.unwrap().phase,
        SessionPhase::Active,
        "a failed close leaves the session open"
    );
}

#[tokio::test]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let monitor = UsageMonitor::new(TrackerConfig::default(), store)
        .unwrap()
        .with_handler(NoopHandler);
    seeded(&monitor).await;
    monitor
        .annotate(
            "s1",
            SessionNote::Accomplishment {
                text: "wired the store".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(monitor.checkpoint().await.unwrap(), 1);
    let before = monitor.session_state("s1").await.unwrap();
    drop(monitor);

    let reopened = UsageMonitor::open(TrackerConfig::default(), Arc::new(FileStore::new(dir.path())))
        .await
        .unwrap()
        .with_handler(NoopHandler);
    let after = reopened.session_state("s1").await.unwrap();
    assert_eq!(after.total(), before.total());
    assert_eq!(after.operations, before.operations);
    assert_eq!(after.notes.accomplishments, vec!["wired the store"]);
    assert!(after.files.recent_paths().any(|p| p == "src/lib.rs"));
    assert_eq!(reopened.quota_status(t(10)).used, 17_700);

    // Out-of-order events stay out of order after a restart.
    let stale = UsageEvent::new("s1", "/work/app", Category::Conversation, 5, t(1));
    assert!(!reopened.ingest(stale).await.unwrap().is_recorded());

    let handoff = reopened
        .close_session("s1", HandoffTrigger::Manual)
        .await
        .unwrap();
    let handoff_dir = dir
        .path()
        .join("projects")
        .join(&handoff.project_key)
        .join("handoffs");
    let files: Vec<_> = std::fs::read_dir(handoff_dir).unwrap().collect();
    assert_eq!(files.len(), 1);

    let boot = reopened.bootstrap("/work/app").await.unwrap();
    assert_eq!(boot.applied.len(), 1);
    assert_eq!(
        boot.memory.sessions[0].accomplishments,
        vec!["wired the store"]
    );
}
