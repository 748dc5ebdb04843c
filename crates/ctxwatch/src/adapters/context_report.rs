//! Best-effort parser for the assistant's free-text context report.
//!
//! The report lists one bucket per line, e.g.
//!
//! ```text
//! claude-sonnet · 62k/200k tokens (31%)
//! System prompt: 3.1k tokens (1.6%)
//! System tools: 11.4k tokens (5.7%)
//! Memory files: 2.2k tokens (1.1%)
//! Messages: 45.2k tokens (22.6%)
//! Free space: 138k (69.0%)
//! ```
//!
//! Known buckets are folded into [`Category`] totals; everything else is
//! ignored. Useful to reconcile estimated totals with what the assistant
//! reports.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::trace;

use crate::context::Category;

/// Totals parsed from one context report.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct ContextReport {
    /// Tokens in use according to the header line, if present.
    pub used: Option<u64>,
    /// Context limit according to the header line, if present.
    pub limit: Option<u64>,
    pub by_category: BTreeMap<Category, u64>,
}

impl ContextReport {
    /// Sum of the categorized buckets.
    pub fn categorized_total(&self) -> u64 {
        self.by_category.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_none() && self.by_category.is_empty()
    }
}

/// Bucket labels and the category each one counts toward.
const BUCKETS: &[(&str, Category)] = &[
    ("system prompt", Category::SystemPrompt),
    ("system tools", Category::SystemPrompt),
    ("mcp tools", Category::SystemPrompt),
    ("custom agents", Category::SystemPrompt),
    ("memory files", Category::SystemPrompt),
    ("messages", Category::Conversation),
];

pub fn parse_context_report(text: &str) -> ContextReport {
    let mut report = ContextReport::default();
    for line in text.lines() {
        let line = line.trim().trim_start_matches(|c: char| !c.is_alphanumeric());
        if line.is_empty() {
            continue;
        }
        if let Some((used, limit)) = parse_header(line) {
            report.used = Some(used);
            report.limit = Some(limit);
            continue;
        }
        let Some((label, rest)) = line.split_once(':') else {
            continue;
        };
        let label = label.trim().to_ascii_lowercase();
        let Some(&(_, category)) = BUCKETS.iter().find(|(name, _)| *name == label) else {
            trace!("Ignoring context report line: {line}");
            continue;
        };
        if let Some(tokens) = rest.split_whitespace().next().and_then(parse_count) {
            *report.by_category.entry(category).or_default() += tokens;
        }
    }
    report
}

/// `62k/200k tokens (31%)` anywhere in the line.
fn parse_header(line: &str) -> Option<(u64, u64)> {
    let words: Vec<&str> = line.split_whitespace().collect();
    words.windows(2).find_map(|pair| {
        if pair[1] != "tokens" {
            return None;
        }
        let (used, limit) = pair[0].split_once('/')?;
        Some((parse_count(used)?, parse_count(limit)?))
    })
}

/// `850`, `3.1k`, `1.2m`, `12,400`.
fn parse_count(word: &str) -> Option<u64> {
    let word = word.trim().replace(',', "").to_ascii_lowercase();
    let (number, scale) = match word.strip_suffix('k') {
        Some(n) => (n.to_string(), 1_000.0),
        None => match word.strip_suffix('m') {
            Some(n) => (n.to_string(), 1_000_000.0),
            None => (word, 1.0),
        },
    };
    let value: f64 = number.parse().ok()?;
    (value >= 0.0).then(|| (value * scale).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "
  ⛁ ⛀ ⛁   claude-sonnet · 62k/200k tokens (31%)
  ⛁ System prompt: 3.1k tokens (1.6%)
  ⛁ System tools: 11.4k tokens (5.7%)
  ⛁ Memory files: 2.2k tokens (1.1%)
  ⛁ Messages: 45.2k tokens (22.6%)
  ⛶ Free space: 138k (69.0%)
  Some unrelated footer
";

    #[test]
    fn parses_buckets_and_header() {
        let report = parse_context_report(REPORT);
        assert_eq!(report.used, Some(62_000));
        assert_eq!(report.limit, Some(200_000));
        assert_eq!(report.by_category[&Category::SystemPrompt], 3_100 + 11_400 + 2_200);
        assert_eq!(report.by_category[&Category::Conversation], 45_200);
        assert_eq!(report.by_category.len(), 2);
        assert_eq!(report.categorized_total(), 61_900);
    }

    #[test]
    fn counts_with_suffixes() {
        assert_eq!(parse_count("850"), Some(850));
        assert_eq!(parse_count("3.1k"), Some(3_100));
        assert_eq!(parse_count("1.2M"), Some(1_200_000));
        assert_eq!(parse_count("12,400"), Some(12_400));
        assert_eq!(parse_count("lots"), None);
    }

    #[test]
    fn garbage_yields_empty_report() {
        assert!(parse_context_report("nothing to see\n: here").is_empty());
    }
}
