//! Per-session context accounting and compaction.
//!
//! - **[`tracker`]**: [`ContextTracker`] records token-consuming operations
//!   by category and reports a [`UsageSnapshot`] with the current alert tier.
//! - **[`budget`]**: maps totals onto tiers against the working ceiling.
//! - **[`candidates`]**: flags stale file reads, duplicate tool output and
//!   verbose operations.
//! - **[`compactor`]**: soft, strategic and emergency policies, planned
//!   purely and applied atomically.
//! - **[`file_tracker`]**: recent and open files; open files are protected
//!   from compaction and listed in the handoff.

pub mod budget;
pub mod candidates;
pub mod compactor;
pub mod file_tracker;
pub mod tracker;

pub use budget::{AlertTier, ContextBudget, DEFAULT_CHARS_PER_TOKEN, estimate_tokens};
pub use candidates::{CandidateReason, CompactionCandidate};
pub use compactor::{CompactionOutcome, CompactionPlan, CompactionPolicy};
pub use file_tracker::{FileAccessType, FileActivity};
pub use tracker::{
    ArchivedTurn, Category, ContextState, ContextTracker, Operation, OperationMetadata,
    OperationRef, SessionNotes, SessionPhase, UsageSnapshot,
};
