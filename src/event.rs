//! Event normalization for agent output streams.
//!
//! Supervised agent processes emit one self-describing JSON record per
//! stdout line. [`normalize`] converts a single raw line into a canonical
//! [`EventKind`] without ever failing: unparsable lines become
//! [`EventKind::Malformed`] carrying the raw text, so one bad line can
//! never interrupt the stream.
//!
//! The function is pure and stateless, which lets the same code drive
//! both live display and offline replay of a raw log file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::role::Role;
use crate::util::truncate_for_display;

/// Free-text segments shorter than this are streaming deltas/noise and
/// produce no event.
pub const MIN_THINKING_LEN: usize = 24;

/// Maximum characters of a command/path shown in a tool event label.
pub const MAX_LABEL_LEN: usize = 80;

/// Classification of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Shell,
    Read,
    Write,
    Edit,
    Other,
}

impl ToolKind {
    fn classify(tool_name: &str) -> Self {
        match tool_name {
            "Bash" | "Shell" => ToolKind::Shell,
            "Read" | "Glob" | "Grep" => ToolKind::Read,
            "Write" => ToolKind::Write,
            "Edit" | "MultiEdit" | "NotebookEdit" => ToolKind::Edit,
            _ => ToolKind::Other,
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolKind::Shell => write!(f, "shell"),
            ToolKind::Read => write!(f, "read"),
            ToolKind::Write => write!(f, "write"),
            ToolKind::Edit => write!(f, "edit"),
            ToolKind::Other => write!(f, "other"),
        }
    }
}

/// Canonical stream unit kinds.
///
/// A closed tagged union: every consumer matches all known kinds plus
/// the `Malformed` fallback instead of probing optional fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    /// Session start announcement carrying the resume handle.
    Init { session_id: String },
    /// A free-text reasoning segment above the noise threshold.
    Thinking { text: String },
    /// A tool invocation has started.
    ToolCallStarted { kind: ToolKind, label: String },
    /// A tool invocation has finished.
    ToolCallCompleted { ok: bool, summary: String },
    /// Terminal record for the whole run.
    Result {
        ok: bool,
        duration_ms: Option<u64>,
        text: String,
    },
    /// A line the normalizer could not interpret; carries the raw text.
    Malformed { raw: String },
}

impl EventKind {
    pub fn is_malformed(&self) -> bool {
        matches!(self, EventKind::Malformed { .. })
    }
}

/// A normalized event attributed to a role, append-only and ordered per
/// agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub role: Role,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(role: Role, kind: EventKind) -> Self {
        Self {
            role,
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Normalize one raw stream line into at most one event.
///
/// Returns `None` for lines that parse but carry only filtered noise
/// (sub-threshold text deltas, untyped records we deliberately skip).
/// Anything unparsable returns `Some(Malformed)`. Never panics.
pub fn normalize(raw_line: &str) -> Option<EventKind> {
    let trimmed = raw_line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => {
            return Some(EventKind::Malformed {
                raw: trimmed.to_string(),
            })
        }
    };

    let record_type = match value.get("type").and_then(Value::as_str) {
        Some(t) => t,
        None => {
            return Some(EventKind::Malformed {
                raw: trimmed.to_string(),
            })
        }
    };

    match record_type {
        "system" => normalize_system(&value),
        "assistant" => normalize_assistant(&value),
        "user" => normalize_tool_result(&value),
        "result" => Some(normalize_result(&value)),
        // Recognized framing we have no use for (progress pings etc.)
        _ => None,
    }
}

fn normalize_system(value: &Value) -> Option<EventKind> {
    if value.get("subtype").and_then(Value::as_str) != Some("init") {
        return None;
    }
    let session_id = value.get("session_id").and_then(Value::as_str)?;
    Some(EventKind::Init {
        session_id: session_id.to_string(),
    })
}

fn normalize_assistant(value: &Value) -> Option<EventKind> {
    let content = value.get("message")?.get("content")?.as_array()?;

    // A tool invocation takes priority over accompanying text.
    for block in content {
        if block.get("type").and_then(Value::as_str) == Some("tool_use") {
            let name = block.get("name").and_then(Value::as_str).unwrap_or("");
            let kind = ToolKind::classify(name);
            let label = tool_label(kind, block.get("input"));
            return Some(EventKind::ToolCallStarted { kind, label });
        }
    }

    for block in content {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            let text = block.get("text").and_then(Value::as_str).unwrap_or("");
            if text.trim().len() >= MIN_THINKING_LEN {
                return Some(EventKind::Thinking {
                    text: text.trim().to_string(),
                });
            }
        }
    }

    None
}

/// Best display label for a tool call: the command for shell tools, the
/// file path for file tools, truncated either way.
fn tool_label(kind: ToolKind, input: Option<&Value>) -> String {
    let raw = input
        .and_then(|i| {
            let key = match kind {
                ToolKind::Shell => "command",
                _ => "file_path",
            };
            i.get(key)
                .or_else(|| i.get("path"))
                .or_else(|| i.get("pattern"))
                .and_then(Value::as_str)
        })
        .unwrap_or("");
    truncate_for_display(raw, MAX_LABEL_LEN)
}

fn normalize_tool_result(value: &Value) -> Option<EventKind> {
    let content = value.get("message")?.get("content")?.as_array()?;

    for block in content {
        if block.get("type").and_then(Value::as_str) == Some("tool_result") {
            let is_error = block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let summary = tool_result_summary(block.get("content"));
            return Some(EventKind::ToolCallCompleted {
                ok: !is_error,
                summary,
            });
        }
    }

    None
}

/// Tool result content is either a plain string or an array of text
/// blocks; take the first line either way.
fn tool_result_summary(content: Option<&Value>) -> String {
    let text = match content {
        Some(Value::String(s)) => s.as_str(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .find_map(|b| b.get("text").and_then(Value::as_str))
            .unwrap_or(""),
        _ => "",
    };
    let first_line = text.lines().next().unwrap_or("");
    truncate_for_display(first_line, MAX_LABEL_LEN)
}

fn normalize_result(value: &Value) -> EventKind {
    let ok = match value.get("subtype").and_then(Value::as_str) {
        Some("success") => true,
        Some(_) => false,
        None => value.get("error").is_none(),
    };
    let duration_ms = value.get("duration_ms").and_then(Value::as_u64);
    let text = value
        .get("result")
        .or_else(|| value.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    EventKind::Result {
        ok,
        duration_ms,
        text,
    }
}
