//! Assistant session transcripts to [`UsageEvent`]s.
//!
//! A transcript is JSON lines, one message per line:
//!
//! ```text
//! {"type":"assistant","sessionId":"..","timestamp":"..","cwd":"/p",
//!  "message":{"content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":".."}}],
//!             "usage":{"output_tokens":120}}}
//! {"type":"user","sessionId":"..","timestamp":"..","cwd":"/p",
//!  "message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":".."}]}}
//! ```
//!
//! Mapping:
//! - assistant output tokens become a `conversation` operation;
//! - `Write`/`Edit` tool calls become `generated-code` operations on their file;
//! - a `Read` result becomes a `file-read` operation sized by its content;
//! - any other tool result becomes a `tool-result` operation with a payload hash;
//! - a plain user message becomes a `conversation` operation.
//!
//! Lines that don't parse are skipped.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::context::{Category, OperationMetadata, estimate_tokens};
use crate::events::UsageEvent;

/// Tool names whose calls produce file content.
const WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];
/// Tool names whose results are file contents.
const READ_TOOLS: &[&str] = &["Read", "NotebookRead"];
/// Characters of message text kept as an operation summary.
const SUMMARY_CHARS: usize = 120;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TranscriptLine {
    #[serde(rename = "type")]
    kind: Option<String>,
    session_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    cwd: Option<String>,
    message: Option<TranscriptMessage>,
}

#[derive(Deserialize, Debug)]
struct TranscriptMessage {
    content: Option<Value>,
    usage: Option<TranscriptUsage>,
}

#[derive(Deserialize, Debug)]
struct TranscriptUsage {
    output_tokens: Option<i64>,
}

/// A tool call waiting for its result.
#[derive(Debug, Clone)]
struct PendingTool {
    name: String,
    file_path: Option<String>,
}

/// Stateful transcript reader. Tool calls and their results arrive on
/// different lines, so pending calls are remembered across lines.
#[derive(Debug, Default)]
pub struct TranscriptParser {
    pending: HashMap<String, PendingTool>,
    skipped: usize,
}

impl TranscriptParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lines skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Parse a whole transcript.
    pub fn parse_str(&mut self, content: &str) -> Vec<UsageEvent> {
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .flat_map(|l| self.parse_line(l))
            .collect()
    }

    /// Events for one transcript line. Unusable lines yield nothing.
    pub fn parse_line(&mut self, line: &str) -> Vec<UsageEvent> {
        let parsed: TranscriptLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Skipping transcript line: {e}");
                self.skipped += 1;
                return Vec::new();
            }
        };
        let (Some(session_id), Some(timestamp), Some(message)) =
            (parsed.session_id, parsed.timestamp, parsed.message)
        else {
            trace!("Skipping transcript line without session, timestamp or message");
            self.skipped += 1;
            return Vec::new();
        };
        let project_path = parsed.cwd.unwrap_or_default();
        let event = |category: Category, tokens: i64, metadata: OperationMetadata| {
            UsageEvent::new(&session_id, &project_path, category, tokens, timestamp)
                .with_metadata(metadata)
        };

        let mut events = Vec::new();
        match parsed.kind.as_deref() {
            Some("assistant") => {
                let blocks = content_blocks(message.content.as_ref());
                for block in &blocks {
                    if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                        continue;
                    }
                    let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                    let input = block.get("input");
                    let file_path = input
                        .and_then(|i| i.get("file_path").or_else(|| i.get("notebook_path")))
                        .and_then(Value::as_str)
                        .map(String::from);
                    if let Some(id) = block.get("id").and_then(Value::as_str) {
                        self.pending.insert(
                            id.to_string(),
                            PendingTool {
                                name: name.to_string(),
                                file_path: file_path.clone(),
                            },
                        );
                    }
                    if let (true, Some(path)) = (WRITE_TOOLS.contains(&name), file_path) {
                        let body = input.map(Value::to_string).unwrap_or_default();
                        events.push(event(
                            Category::GeneratedCode,
                            estimate_tokens(&body) as i64,
                            OperationMetadata::for_file(path),
                        ));
                    }
                }
                let output = message.usage.and_then(|u| u.output_tokens).unwrap_or(0);
                if output > 0 {
                    let mut metadata = OperationMetadata::new();
                    if let Some(text) = first_text(&blocks) {
                        metadata = metadata.with_summary(truncate(&text, SUMMARY_CHARS));
                    }
                    events.push(event(Category::Conversation, output, metadata));
                }
            }
            Some("user") => match message.content {
                Some(Value::String(text)) => {
                    events.push(event(
                        Category::Conversation,
                        estimate_tokens(&text) as i64,
                        OperationMetadata::new().with_summary(truncate(&text, SUMMARY_CHARS)),
                    ));
                }
                content => {
                    for block in content_blocks(content.as_ref()) {
                        if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                            continue;
                        }
                        let payload = result_text(block.get("content"));
                        let pending = block
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .and_then(|id| self.pending.remove(id));
                        events.push(tool_result_event(pending, &payload, &event));
                    }
                }
            },
            other => {
                trace!("Ignoring transcript line of type {other:?}");
            }
        }
        events
    }
}

fn tool_result_event(
    pending: Option<PendingTool>,
    payload: &str,
    event: &impl Fn(Category, i64, OperationMetadata) -> UsageEvent,
) -> UsageEvent {
    let tokens = estimate_tokens(payload) as i64;
    match pending {
        Some(PendingTool {
            name,
            file_path: Some(path),
        }) if READ_TOOLS.contains(&name.as_str()) => event(
            Category::FileRead,
            tokens,
            OperationMetadata::for_file(path).with_payload(payload),
        ),
        Some(PendingTool { name, .. }) => event(
            Category::ToolResult,
            tokens,
            OperationMetadata::new()
                .with_payload(payload)
                .with_summary(name),
        ),
        None => event(
            Category::ToolResult,
            tokens,
            OperationMetadata::new().with_payload(payload),
        ),
    }
}

/// Parse a transcript file.
pub async fn read_transcript(path: &Path) -> std::io::Result<Vec<UsageEvent>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut parser = TranscriptParser::new();
    let events = parser.parse_str(&content);
    debug!(
        "Read {} events from {} ({} lines skipped)",
        events.len(),
        path.display(),
        parser.skipped()
    );
    Ok(events)
}

fn content_blocks(content: Option<&Value>) -> Vec<Value> {
    match content {
        Some(Value::Array(blocks)) => blocks.clone(),
        _ => Vec::new(),
    }
}

fn first_text(blocks: &[Value]) -> Option<String> {
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .find_map(|b| b.get("text").and_then(Value::as_str))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Tool result content is a string or a list of text blocks.
fn result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max_chars {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCRIPT: &str = r#"
{"type":"user","sessionId":"s1","timestamp":"2025-03-01T09:00:00Z","cwd":"/work/app","message":{"role":"user","content":"Fix the parser bug"}}
{"type":"assistant","sessionId":"s1","timestamp":"2025-03-01T09:00:05Z","cwd":"/work/app","message":{"content":[{"type":"text","text":"Reading the parser."},{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"src/parser.rs"}}],"usage":{"input_tokens":900,"output_tokens":40}}}
{"type":"user","sessionId":"s1","timestamp":"2025-03-01T09:00:06Z","cwd":"/work/app","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"fn parse() {}\nfn lex() {}"}]}}
not json at all
{"type":"assistant","sessionId":"s1","timestamp":"2025-03-01T09:00:09Z","cwd":"/work/app","message":{"content":[{"type":"tool_use","id":"t2","name":"Edit","input":{"file_path":"src/parser.rs","old_string":"a","new_string":"b"}},{"type":"tool_use","id":"t3","name":"Bash","input":{"command":"cargo test"}}],"usage":{"output_tokens":0}}}
{"type":"user","sessionId":"s1","timestamp":"2025-03-01T09:00:12Z","cwd":"/work/app","message":{"content":[{"type":"tool_result","tool_use_id":"t3","content":[{"type":"text","text":"test result: ok"}]}]}}
{"type":"summary","summary":"Parser fix"}
"#;

    #[test]
    fn maps_transcript_to_events() {
        let mut parser = TranscriptParser::new();
        let events = parser.parse_str(TRANSCRIPT);
        let categories: Vec<Category> = events.iter().map(|e| e.category).collect();
        assert_eq!(
            categories,
            vec![
                Category::Conversation,
                Category::Conversation,
                Category::FileRead,
                Category::GeneratedCode,
                Category::ToolResult,
            ]
        );
        assert!(events.iter().all(|e| e.session_id == "s1" && e.project_path == "/work/app"));

        assert_eq!(events[1].estimated_tokens, 40);
        assert_eq!(events[1].metadata.summary.as_deref(), Some("Reading the parser."));
        assert_eq!(events[2].metadata.file_path.as_deref(), Some("src/parser.rs"));
        assert!(events[2].metadata.payload_hash.is_some());
        assert_eq!(events[3].metadata.file_path.as_deref(), Some("src/parser.rs"));
        assert_eq!(events[4].metadata.summary.as_deref(), Some("Bash"));
    }

    #[test]
    fn counts_skipped_lines() {
        let mut parser = TranscriptParser::new();
        parser.parse_str(TRANSCRIPT);
        // The garbage line and the summary line (no session or timestamp).
        assert_eq!(parser.skipped(), 2);
    }

    #[test]
    fn result_without_call_is_tool_output() {
        let mut parser = TranscriptParser::new();
        let line = r#"{"type":"user","sessionId":"s1","timestamp":"2025-03-01T09:00:00Z","message":{"content":[{"type":"tool_result","tool_use_id":"zz","content":"orphan"}]}}"#;
        let events = parser.parse_line(line);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, Category::ToolResult);
        assert_eq!(events[0].project_path, "");
    }

    #[test]
    fn truncates_long_summaries() {
        let long = "x".repeat(200);
        let t = truncate(&long, 10);
        assert_eq!(t, format!("{}...", "x".repeat(10)));
        assert_eq!(truncate("first\nsecond", 50), "first");
    }

    #[tokio::test]
    async fn reads_transcript_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        tokio::fs::write(&path, TRANSCRIPT).await.unwrap();
        let events = read_transcript(&path).await.unwrap();
        assert_eq!(events.len(), 5);
    }
}
