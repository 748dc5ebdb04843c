//! Convenience re-exports for embedding the tracker.
//!
//! ```ignore
//! use ctxwatch::prelude::*;
//! ```
//!
//! Covers the monitor, its inputs and outputs, and the stores. Planning
//! internals (candidate detection, compaction plans) stay in their modules.

// ── Core ────────────────────────────────────────────────────────────
pub use crate::config::TrackerConfig;
pub use crate::error::{Result, TrackerError};
pub use crate::monitor::{IngestOutcome, SessionNote, UsageMonitor};

// ── Context and quota ───────────────────────────────────────────────
pub use crate::context::{
    AlertTier, Category, CompactionOutcome, CompactionPolicy, OperationMetadata, SessionPhase,
    UsageSnapshot,
};
pub use crate::quota::QuotaStatus;

// ── Events ──────────────────────────────────────────────────────────
pub use crate::events::{
    CompositeEventHandler, EventHandler, EventResponse, FnEventHandler, LoggingHandler,
    NoopHandler, TrackerEvent, UsageEvent,
};

// ── Handoffs and persistence ────────────────────────────────────────
pub use crate::handoff::{Bootstrap, Handoff, HandoffTrigger, RemovedOperation};
pub use crate::memory::ProjectMemory;
pub use crate::store::{FileStore, MemoryStore, StateStore};

pub use chrono::Utc;
