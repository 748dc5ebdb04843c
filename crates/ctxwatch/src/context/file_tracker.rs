//! Recently-touched and currently-edited files for one session.
//!
//! Compaction must never drop operations tied to a file the session is
//! still editing, and a handoff should tell the next session which files
//! were in play. [`FileActivity`] records file accesses from operation
//! metadata, keeps a bounded most-recent list, and tracks which files are
//! open for editing until they are explicitly closed.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

/// Default number of recent files kept for the preservation note.
pub const DEFAULT_MAX_PRESERVED: usize = 20;

/// The type of file access recorded by the tracker.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileAccessType {
    Read,
    Write,
    Search,
}

impl std::fmt::Display for FileAccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileAccessType::Read => write!(f, "read"),
            FileAccessType::Write => write!(f, "write"),
            FileAccessType::Search => write!(f, "search"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct FileAccess {
    path: String,
    /// Operation id that produced the access.
    operation: u64,
    access_type: FileAccessType,
}

/// Tracks recent file accesses and open edits.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileActivity {
    recent: VecDeque<FileAccess>,
    open: BTreeSet<String>,
    max_preserved: usize,
}

impl Default for FileActivity {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PRESERVED)
    }
}

impl FileActivity {
    /// Create a tracker that preserves up to `max_preserved` recent files.
    pub fn new(max_preserved: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(max_preserved),
            open: BTreeSet::new(),
            max_preserved,
        }
    }

    /// Record an access. Deduplicates by path: an already-tracked file moves
    /// to the end with the new operation and access type. A write marks the
    /// file open until [`close`](Self::close).
    pub fn record(&mut self, path: &str, access_type: FileAccessType, operation: u64) {
        if path.is_empty() {
            return;
        }
        self.recent.retain(|f| f.path != path);
        self.recent.push_back(FileAccess {
            path: path.to_string(),
            operation,
            access_type,
        });
        while self.recent.len() > self.max_preserved {
            self.recent.pop_front();
        }
        if access_type == FileAccessType::Write {
            self.open.insert(path.to_string());
        }
    }

    /// Mark a file as open for editing without recording an access.
    pub fn open(&mut self, path: &str) {
        self.open.insert(path.to_string());
    }

    /// The session finished editing `path`. Returns whether it was open.
    pub fn close(&mut self, path: &str) -> bool {
        self.open.remove(path)
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.open.contains(path)
    }

    /// Files currently open for editing, sorted.
    pub fn open_files(&self) -> impl Iterator<Item = &str> {
        self.open.iter().map(String::as_str)
    }

    /// Recently accessed paths, oldest first.
    pub fn recent_paths(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(|f| f.path.as_str())
    }

    /// Human-readable note listing recent and open files, for the handoff's
    /// preserved context. Empty when nothing was tracked.
    pub fn build_preservation_note(&self) -> String {
        if self.recent.is_empty() && self.open.is_empty() {
            return String::new();
        }

        let mut note = String::new();
        if !self.open.is_empty() {
            note.push_str("Files open for editing:\n");
            for path in &self.open {
                note.push_str(&format!("- {path}\n"));
            }
        }
        if !self.recent.is_empty() {
            note.push_str("Recently accessed files:\n");
            for access in &self.recent {
                note.push_str(&format!(
                    "- {} ({}, op {})\n",
                    access.path, access.access_type, access.operation
                ));
            }
        }
        note
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tracker_is_empty() {
        let files = FileActivity::new(5);
        assert_eq!(files.build_preservation_note(), "");
        assert_eq!(files.open_files().count(), 0);
    }

    #[test]
    fn write_marks_file_open_until_closed() {
        let mut files = FileActivity::new(5);
        files.record("src/lib.rs", FileAccessType::Write, 3);
        assert!(files.is_open("src/lib.rs"));
        assert!(files.close("src/lib.rs"));
        assert!(!files.is_open("src/lib.rs"));
        assert!(!files.close("src/lib.rs"));
    }

    #[test]
    fn read_does_not_open() {
        let mut files = FileActivity::new(5);
        files.record("README.md", FileAccessType::Read, 1);
        assert!(!files.is_open("README.md"));
    }

    #[test]
    fn deduplication_moves_to_end() {
        let mut files = FileActivity::new(5);
        files.record("a.rs", FileAccessType::Read, 1);
        files.record("b.rs", FileAccessType::Read, 2);
        files.record("a.rs", FileAccessType::Search, 3);

        let paths: Vec<&str> = files.recent_paths().collect();
        assert_eq!(paths, vec!["b.rs", "a.rs"]);
        let note = files.build_preservation_note();
        assert!(note.contains("- a.rs (search, op 3)"));
        assert_eq!(note.matches("a.rs").count(), 1);
    }

    #[test]
    fn max_capacity_evicts_oldest() {
        let mut files = FileActivity::new(3);
        for (i, p) in ["a.rs", "b.rs", "c.rs", "d.rs"].iter().enumerate() {
            files.record(p, FileAccessType::Read, i as u64);
        }
        let paths: Vec<&str> = files.recent_paths().collect();
        assert_eq!(paths, vec!["b.rs", "c.rs", "d.rs"]);
    }

    #[test]
    fn open_file_survives_eviction_from_recent_list() {
        let mut files = FileActivity::new(1);
        files.record("edit.rs", FileAccessType::Write, 1);
        files.record("other.rs", FileAccessType::Read, 2);
        assert!(files.is_open("edit.rs"));
        assert!(files.build_preservation_note().contains("Files open for editing"));
    }

    #[test]
    fn empty_path_ignored() {
        let mut files = FileActivity::new(3);
        files.record("", FileAccessType::Write, 1);
        assert_eq!(files.build_preservation_note(), "");
    }
}
