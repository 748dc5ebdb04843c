//! Input adapters that turn assistant artifacts into tracker input.
//!
//! Nothing in the core depends on these; they only produce
//! [`UsageEvent`](crate::events::UsageEvent)s and report totals.

pub mod context_report;
pub mod transcript;

pub use context_report::{ContextReport, parse_context_report};
pub use transcript::{TranscriptParser, read_transcript};
