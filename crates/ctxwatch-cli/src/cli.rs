use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Overrides;

/// Track rolling token quota and per-session context usage.
#[derive(Parser, Debug)]
#[command(name = "ctxwatch", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Tracker config file (TOML)
    #[arg(long, global = true, env = "CTXWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding persisted state
    #[arg(long, global = true, env = "CTXWATCH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Override the quota limit per window
    #[arg(long, global = true)]
    pub quota_limit: Option<u64>,

    /// Override the context working ceiling
    #[arg(long, global = true)]
    pub working_ceiling: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            quota_limit: self.quota_limit,
            working_ceiling: self.working_ceiling,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Feed usage events (JSON lines) or an assistant transcript
    Ingest {
        file: PathBuf,
        /// Treat FILE as an assistant session transcript
        #[arg(long)]
        transcript: bool,
    },

    /// Show quota and context usage
    Status {
        /// Only this session
        #[arg(long)]
        session: Option<String>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Compact a session's context
    Compact {
        #[arg(long)]
        session: String,
        /// soft, strategic or emergency
        #[arg(long, default_value = "soft")]
        policy: String,
        /// Confirm strategic compaction
        #[arg(long)]
        yes: bool,
    },

    /// Close a session and print its handoff
    Close {
        #[arg(long)]
        session: String,
    },

    /// Mark a file as no longer being edited so its context can be compacted
    CloseFile {
        #[arg(long)]
        session: String,
        path: String,
    },

    /// Print the latest unconsumed handoff for a project
    Handoff { project: String },

    /// Fold pending handoffs into a project's memory and print it
    Bootstrap { project: String },
}
