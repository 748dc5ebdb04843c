//! Token accounting for AI coding sessions.
//!
//! `ctxwatch` tracks two independent budgets:
//!
//! - a **rolling quota**: tokens consumed across all sessions inside a
//!   fixed-length window anchored at first use ([`quota`]);
//! - each session's **context window**: tokens held in the working context,
//!   broken down by category and mapped onto alert tiers ([`context`]).
//!
//! When a session's context fills up it is compacted (stale file reads and
//! duplicate tool output first, then archived history, then everything not
//! protected), and when it has to end a [`Handoff`](handoff::Handoff)
//! carries its accomplishments, decisions and open files into the project's
//! [`ProjectMemory`](memory::ProjectMemory) for the next session.
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use ctxwatch::prelude::*;
//!
//! let store = Arc::new(FileStore::new("/var/lib/ctxwatch"));
//! let monitor = UsageMonitor::open(TrackerConfig::default(), store).await?;
//!
//! let event = UsageEvent::new("s1", "/work/app", Category::FileRead, 4_200, Utc::now())
//!     .with_metadata(OperationMetadata::for_file("src/main.rs"));
//! monitor.ingest(event).await?;
//!
//! let snapshot = monitor.snapshot("s1").await;
//! let handoff = monitor.close_session("s1", HandoffTrigger::Manual).await?;
//! monitor.checkpoint().await?;
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`monitor`] | [`UsageMonitor`](monitor::UsageMonitor) facade: ingestion, queries, compaction, close, checkpoints |
//! | [`quota`] | Rolling quota windows shared by all sessions |
//! | [`context`] | Per-session accounting, alert tiers, compaction candidates and policies |
//! | [`handoff`] | Handoff synthesis, persistence and bootstrap |
//! | [`memory`] | Per-project memory and stack detection |
//! | [`store`] | [`StateStore`](store::StateStore) trait, file and in-memory stores |
//! | [`events`] | Usage event input, tracker event output, handlers |
//! | [`adapters`] | Transcript and context report parsers |

pub mod adapters;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod handoff;
pub mod memory;
pub mod monitor;
pub mod prelude;
pub mod quota;
pub mod retry;
pub mod store;

pub use config::TrackerConfig;
pub use error::{Result, TrackerError};
pub use monitor::{IngestOutcome, SessionNote, UsageMonitor};
