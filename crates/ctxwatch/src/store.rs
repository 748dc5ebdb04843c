//! Durable state: quota history, context checkpoints, project memory and
//! handoffs.
//!
//! [`StateStore`] is object safe (boxed futures) so the monitor can hold an
//! `Arc<dyn StateStore>`. Implementations speak `std::io::Result`; retries
//! and error mapping live in [`crate::retry`].
//!
//! [`FileStore`] layout under its root:
//!
//! ```text
//! quota.json
//! projects/<key>/memory.json
//! projects/<key>/sessions/<session>-<hash>.json
//! projects/<key>/handoffs/<millis>-<id>.json
//! ```
//!
//! Every write lands in a dotted temp file unique to that write and is
//! renamed into place, so readers never see a partial document even when two
//! writers race on the same path.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::context::ContextState;
use crate::fingerprint::{fnv1a, project_key};
use crate::handoff::Handoff;
use crate::memory::ProjectMemory;
use crate::quota::QuotaWindow;

/// Boxed future returned by [`StateStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Storage backend for tracker state.
pub trait StateStore: Send + Sync {
    fn save_quota<'a>(&'a self, windows: &'a [QuotaWindow]) -> StoreFuture<'a, ()>;
    fn load_quota(&self) -> StoreFuture<'_, Vec<QuotaWindow>>;

    fn save_context<'a>(&'a self, state: &'a ContextState) -> StoreFuture<'a, ()>;
    /// All checkpointed sessions, across projects.
    fn load_contexts(&self) -> StoreFuture<'_, Vec<ContextState>>;

    fn save_memory<'a>(&'a self, memory: &'a ProjectMemory) -> StoreFuture<'a, ()>;
    fn load_memory<'a>(&'a self, project_key: &'a str) -> StoreFuture<'a, Option<ProjectMemory>>;

    /// Write a handoff once. Saving an id that already exists is a no-op.
    fn save_handoff<'a>(&'a self, handoff: &'a Handoff) -> StoreFuture<'a, ()>;
    /// Handoffs for a project, oldest first.
    fn list_handoffs<'a>(&'a self, project_key: &'a str) -> StoreFuture<'a, Vec<Handoff>>;
}

// ── FileStore ──────────────────────────────────────────────────────

/// JSON files on disk.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, key: &str) -> PathBuf {
        self.root.join("projects").join(key)
    }

    fn quota_path(&self) -> PathBuf {
        self.root.join("quota.json")
    }

    fn memory_path(&self, key: &str) -> PathBuf {
        self.project_dir(key).join("memory.json")
    }

    fn session_path(&self, state: &ContextState) -> PathBuf {
        self.project_dir(&project_key(&state.project_path))
            .join("sessions")
            .join(session_file_name(&state.session_id))
    }

    fn handoff_dir(&self, key: &str) -> PathBuf {
        self.project_dir(key).join("handoffs")
    }

    fn handoff_path(&self, handoff: &Handoff) -> PathBuf {
        self.handoff_dir(&handoff.project_key).join(format!(
            "{:013}-{}.json",
            handoff.created_at.timestamp_millis().max(0),
            handoff.id
        ))
    }
}

/// `<sanitized id>-<hash of the raw id>.json`. The hash keeps ids that
/// sanitize alike (`a/b`, `a_b`) in separate files.
fn session_file_name(session_id: &str) -> String {
    format!("{}-{:016x}.json", sanitize(session_id), fnv1a(session_id.as_bytes()))
}

/// Keep session ids usable as file names.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Serialize to a dotted temp file next to `path`, then rename into place.
async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::other(format!("no parent directory for {}", path.display())))?;
    tokio::fs::create_dir_all(dir).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));
    let json = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    tokio::fs::write(&tmp_path, json).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Every non-hidden `*.json` file in `dir`, sorted by name. Missing
/// directories are empty.
async fn json_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

impl StateStore for FileStore {
    fn save_quota<'a>(&'a self, windows: &'a [QuotaWindow]) -> StoreFuture<'a, ()> {
        Box::pin(async move { write_json_atomic(&self.quota_path(), windows).await })
    }

    fn load_quota(&self) -> StoreFuture<'_, Vec<QuotaWindow>> {
        Box::pin(async move { Ok(read_json(&self.quota_path()).await?.unwrap_or_default()) })
    }

    fn save_context<'a>(&'a self, state: &'a ContextState) -> StoreFuture<'a, ()> {
        Box::pin(async move { write_json_atomic(&self.session_path(state), state).await })
    }

    fn load_contexts(&self) -> StoreFuture<'_, Vec<ContextState>> {
        Box::pin(async move {
            let mut states = Vec::new();
            let mut projects = match tokio::fs::read_dir(self.root.join("projects")).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(states),
                Err(e) => return Err(e),
            };
            while let Some(project) = projects.next_entry().await? {
                for path in json_files(&project.path().join("sessions")).await? {
                    if let Some(state) = read_json::<ContextState>(&path).await? {
                        states.push(state);
                    }
                }
            }
            Ok(states)
        })
    }

    fn save_memory<'a>(&'a self, memory: &'a ProjectMemory) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            write_json_atomic(&self.memory_path(&memory.project_key), memory).await
        })
    }

    fn load_memory<'a>(&'a self, project_key: &'a str) -> StoreFuture<'a, Option<ProjectMemory>> {
        Box::pin(async move { read_json(&self.memory_path(project_key)).await })
    }

    fn save_handoff<'a>(&'a self, handoff: &'a Handoff) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.handoff_path(handoff);
            if tokio::fs::try_exists(&path).await? {
                debug!("Handoff {} already written", handoff.id);
                return Ok(());
            }
            write_json_atomic(&path, handoff).await
        })
    }

    fn list_handoffs<'a>(&'a self, project_key: &'a str) -> StoreFuture<'a, Vec<Handoff>> {
        Box::pin(async move {
            let mut handoffs = Vec::new();
            for path in json_files(&self.handoff_dir(project_key)).await? {
                if let Some(handoff) = read_json::<Handoff>(&path).await? {
                    handoffs.push(handoff);
                }
            }
            handoffs.sort_by_key(|h| h.created_at);
            Ok(handoffs)
        })
    }
}

// ── MemoryStore ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryInner {
    quota: Vec<QuotaWindow>,
    contexts: HashMap<String, ContextState>,
    memories: HashMap<String, ProjectMemory>,
    handoffs: Vec<Handoff>,
}

/// In-process store for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryInner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }

    /// Number of handoffs written so far.
    pub fn handoff_count(&self) -> usize {
        self.with(|inner| inner.handoffs.len())
    }
}

impl StateStore for MemoryStore {
    fn save_quota<'a>(&'a self, windows: &'a [QuotaWindow]) -> StoreFuture<'a, ()> {
        let windows = windows.to_vec();
        Box::pin(async move {
            self.with(|inner| inner.quota = windows);
            Ok(())
        })
    }

    fn load_quota(&self) -> StoreFuture<'_, Vec<QuotaWindow>> {
        Box::pin(async move { Ok(self.with(|inner| inner.quota.clone())) })
    }

    fn save_context<'a>(&'a self, state: &'a ContextState) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with(|inner| {
                inner
                    .contexts
                    .insert(state.session_id.clone(), state.clone())
            });
            Ok(())
        })
    }

    fn load_contexts(&self) -> StoreFuture<'_, Vec<ContextState>> {
        Box::pin(async move { Ok(self.with(|inner| inner.contexts.values().cloned().collect())) })
    }

    fn save_memory<'a>(&'a self, memory: &'a ProjectMemory) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with(|inner| {
                inner
                    .memories
                    .insert(memory.project_key.clone(), memory.clone())
            });
            Ok(())
        })
    }

    fn load_memory<'a>(&'a self, project_key: &'a str) -> StoreFuture<'a, Option<ProjectMemory>> {
        Box::pin(async move { Ok(self.with(|inner| inner.memories.get(project_key).cloned())) })
    }

    fn save_handoff<'a>(&'a self, handoff: &'a Handoff) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with(|inner| {
                if !inner.handoffs.iter().any(|h| h.id == handoff.id) {
                    inner.handoffs.push(handoff.clone());
                }
            });
            Ok(())
        })
    }

    fn list_handoffs<'a>(&'a self, project_key: &'a str) -> StoreFuture<'a, Vec<Handoff>> {
        Box::pin(async move {
            let mut handoffs: Vec<Handoff> = self.with(|inner| {
                inner
                    .handoffs
                    .iter()
                    .filter(|h| h.project_key == project_key)
                    .cloned()
                    .collect()
            });
            handoffs.sort_by_key(|h| h.created_at);
            Ok(handoffs)
        })
    }
}
