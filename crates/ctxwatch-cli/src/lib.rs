//! Command line front end for `ctxwatch`.
//!
//! ```sh
//! # Feed a session transcript and show usage
//! ctxwatch ingest --transcript ~/.claude/projects/app/session.jsonl
//! ctxwatch status
//!
//! # Reclaim context, then hand the session off
//! ctxwatch compact --session s1 --policy strategic --yes
//! ctxwatch close --session s1
//!
//! # Start the next session from the handoff
//! ctxwatch bootstrap /work/app
//! ```
//!
//! State lives under `--data-dir` (default: the platform data directory).

pub mod cli;
pub mod commands;
pub mod config;

pub use cli::{Cli, Command};
pub use commands::run;
pub use config::CliConfig;
