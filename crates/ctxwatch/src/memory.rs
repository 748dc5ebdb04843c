//! Long-lived, project-scoped memory.
//!
//! A [`ProjectMemory`] accumulates what every session on a project learned:
//! the tech stack, a short architecture summary, one history entry per
//! consumed handoff and every recorded decision. Session history and
//! decisions are append-only; the tech stack only grows. The
//! [`HandoffManager`](crate::handoff::HandoffManager) is the only writer of
//! the session history.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fingerprint::project_key;
use crate::handoff::HandoffTrigger;

/// A decision and the reason it was made.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub decision: String,
    pub rationale: String,
}

impl Decision {
    pub fn new(decision: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            rationale: rationale.into(),
        }
    }
}

/// One finished session, as recorded from its handoff.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionHistoryEntry {
    pub handoff_id: String,
    pub session_id: String,
    pub ended_at: DateTime<Utc>,
    pub trigger: HandoffTrigger,
    pub accomplishments: Vec<String>,
    pub tokens_at_handoff: u64,
}

/// Files whose presence at the project root identifies part of the stack.
const STACK_MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("package.json", "node"),
    ("tsconfig.json", "typescript"),
    ("pyproject.toml", "python"),
    ("requirements.txt", "python"),
    ("go.mod", "go"),
    ("Gemfile", "ruby"),
    ("pom.xml", "java"),
];

/// Top-level directories listed in the generated architecture summary.
const MAX_LISTED_DIRS: usize = 8;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProjectMemory {
    pub project_path: String,
    pub project_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tech_stack: BTreeSet<String>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub sessions: Vec<SessionHistoryEntry>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    /// Ids of handoffs already folded into this memory.
    #[serde(default)]
    pub applied_handoffs: BTreeSet<String>,
}

impl ProjectMemory {
    pub fn new(project_path: impl Into<String>, now: DateTime<Utc>) -> Self {
        let project_path = project_path.into();
        Self {
            project_key: project_key(&project_path),
            project_path,
            created_at: now,
            updated_at: now,
            tech_stack: BTreeSet::new(),
            architecture: String::new(),
            sessions: Vec::new(),
            decisions: Vec::new(),
            applied_handoffs: BTreeSet::new(),
        }
    }

    /// First analysis of a project directory: detect the stack from marker
    /// files and summarize the top-level layout. A missing or unreadable
    /// directory yields an empty memory.
    pub fn analyze(project_path: &str, now: DateTime<Utc>) -> Self {
        let mut memory = Self::new(project_path, now);
        let root = Path::new(project_path);

        for (marker, tech) in STACK_MARKERS {
            if root.join(marker).is_file() {
                memory.tech_stack.insert((*tech).to_string());
            }
        }

        let mut dirs: Vec<String> = std::fs::read_dir(root)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .collect();
        dirs.sort();

        let stack = if memory.tech_stack.is_empty() {
            "Unrecognized".to_string()
        } else {
            memory.tech_stack.iter().cloned().collect::<Vec<_>>().join("/")
        };
        memory.architecture = if dirs.is_empty() {
            format!("{stack} project")
        } else {
            let listed: Vec<&str> = dirs.iter().take(MAX_LISTED_DIRS).map(String::as_str).collect();
            let more = dirs.len().saturating_sub(MAX_LISTED_DIRS);
            let suffix = if more > 0 { format!(" (+{more} more)") } else { String::new() };
            format!("{stack} project; top-level: {}{suffix}", listed.join(", "))
        };

        debug!(
            "Analyzed project {project_path}: stack [{stack}], {} top-level dirs",
            dirs.len()
        );
        memory
    }

    pub fn has_applied(&self, handoff_id: &str) -> bool {
        self.applied_handoffs.contains(handoff_id)
    }

    /// Plain-text summary for terminal output.
    pub fn summary(&self) -> String {
        let mut out = format!("Project: {} ({})\n", self.project_path, self.project_key);
        if !self.architecture.is_empty() {
            out.push_str(&format!("Architecture: {}\n", self.architecture));
        }
        if !self.tech_stack.is_empty() {
            let stack: Vec<&str> = self.tech_stack.iter().map(String::as_str).collect();
            out.push_str(&format!("Tech stack: {}\n", stack.join(", ")));
        }
        out.push_str(&format!("Sessions: {}\n", self.sessions.len()));
        if let Some(last) = self.sessions.last() {
            out.push_str(&format!(
                "Last session: {} ended {} ({})\n",
                last.session_id,
                last.ended_at.format("%Y-%m-%d %H:%M"),
                last.trigger
            ));
        }
        if !self.decisions.is_empty() {
            out.push_str("Decisions:\n");
            for d in &self.decisions {
                out.push_str(&format!("- {}: {}\n", d.decision, d.rationale));
            }
        }
        out
    }
}
