//! Heuristics for picking a subtask's answer out of noisy executor chatter.
//!
//! Kept apart from the capture pipeline so the tables can change without
//! touching extraction order.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Phrases that carry no answer, compared after [`normalize`].
const BOILERPLATE_EXACT: &[&str] = &[
    "task completed",
    "task completed successfully",
    "task failed",
    "task cancelled",
    "task canceled",
    "action completed",
    "performing action",
    "thinking",
    "done",
    "completed",
    "success",
    "navigating",
    "navigation complete",
    "navigation completed",
    "page loaded",
    "loading",
    "processing",
    "planning next steps",
    "waiting for page to load",
];

static BOILERPLATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^action:\s*",
        r"(?i)^(starting|completed|finished) subtask \d+\b",
        r"(?i)^worker \d+ (is )?ready\b",
        r"(?i)^navigat(ing|ed) to\b",
        r"(?i)^(task|subtask|step) (completed|failed|cancell?ed)\b",
        r"(?i)^subtask \d+ (failed|cancell?ed)\b",
        r"(?i)^waiting for\b",
        r"(?i)^(clicked|clicking|scrolled|scrolling|typed|typing)( on| into)? (element|index)\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static FENCED_JSON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)^```(?:json)?\s*(.*?)\s*```$").ok());

fn normalize(text: &str) -> String {
    text.trim()
        .trim_end_matches(['.', '!', '…'])
        .trim()
        .to_lowercase()
}

/// Generic progress or status text that is never a useful answer.
pub fn is_boilerplate(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    let normalized = normalize(trimmed);
    BOILERPLATE_EXACT.contains(&normalized.as_str())
        || BOILERPLATE_PATTERNS.iter().any(|re| re.is_match(trimmed))
}

/// Parse a message as JSON, bare or inside a ```json fence. Only objects
/// and arrays count.
pub fn parse_json_message(text: &str) -> Option<(String, Value)> {
    let trimmed = text.trim();
    let body = FENCED_JSON
        .as_ref()
        .and_then(|re| re.captures(trimmed))
        .and_then(|caps| caps.get(1))
        .map_or(trimmed, |m| m.as_str());

    let value: Value = serde_json::from_str(body).ok()?;
    if value.is_object() || value.is_array() {
        Some((body.to_string(), value))
    } else {
        None
    }
}

/// Executor bookkeeping blob rather than an answer.
pub fn is_job_summary(value: &Value) -> bool {
    ["type", "kind"].iter().any(|key| {
        value
            .get(key)
            .and_then(Value::as_str)
            .is_some_and(|t| t.eq_ignore_ascii_case("job_summary"))
    })
}

/// Reduce a subtask's captured text to one output string.
///
/// Order: the latest "done" text, then the newest JSON message that is not
/// a job summary, then the newest non-boilerplate message, then the last
/// message verbatim.
pub fn extract_output(done_texts: &[String], messages: &[String]) -> String {
    if let Some(done) = done_texts.iter().rev().find(|t| !t.trim().is_empty()) {
        return done.trim().to_string();
    }

    let newest_json = messages.iter().rev().find_map(|m| {
        parse_json_message(m)
            .filter(|(_, value)| !is_job_summary(value))
            .map(|(body, _)| body)
    });
    if let Some(json) = newest_json {
        return json;
    }

    if let Some(message) = messages.iter().rev().find(|m| !is_boilerplate(m)) {
        return message.trim().to_string();
    }

    messages.last().cloned().unwrap_or_default()
}
