//! Stream parsers: vendor JSONL frames in, normalized events out.
//!
//! A parser is a pure transformer over one stdout line. It keeps only the
//! per-run bookkeeping its vendor schema needs (tool-use id maps, seen
//! message ids) and never performs I/O.
//!
//! Besides events, a parsed line can carry [`StreamSignal`]s: metric hints
//! the runner folds into [`crate::types::ExecutionMetrics`] without turning
//! them into events of their own.

pub mod claude;
pub mod codex;
pub mod opencode;

use serde_json::{Map, Value};

use crate::event::EventData;
use crate::types::RunId;

pub use claude::ClaudeStreamParser;
pub use codex::{CodexStreamParser, ModelPricing};
pub use opencode::OpenCodeStreamParser;

/// Errors a parser may report for a single line. None of them abort a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("stream frame is not a JSON object with a string \"type\": {0}")]
    Schema(String),
}

/// Token usage reported by the CLI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageReport {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    /// Reported or estimated cost for this report.
    pub cost_usd: Option<f64>,
    /// `true` when the figures are run totals that replace the running sum.
    pub cumulative: bool,
}

/// Metric hints extracted alongside events.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSignal {
    /// A new agent turn began.
    TurnStarted,
    /// Authoritative turn count reported by the CLI.
    TurnCount(u64),
    Usage(UsageReport),
    /// Assistant text that did not become a message event (e.g. deltas).
    AssistantText(String),
    /// The agent signalled that it finished its work.
    Terminal,
    SessionId(String),
    /// Adapter-specific structured summary (e.g. the final result frame).
    Details(Value),
}

/// Output of parsing one line. Empty means "skip silently".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLine {
    pub events: Vec<EventData>,
    pub signals: Vec<StreamSignal>,
}

impl ParsedLine {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.signals.is_empty()
    }

    pub(crate) fn event(&mut self, data: EventData) {
        self.events.push(data);
    }

    pub(crate) fn signal(&mut self, signal: StreamSignal) {
        self.signals.push(signal);
    }
}

/// Transformer for one CLI family's stdout stream.
///
/// One instance is created per run.
pub trait StreamParser: Send {
    fn parse(&mut self, run_id: RunId, line: &str) -> Result<ParsedLine, ParseError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn StreamParser) {}
};

// ---------------------------------------------------------------------------
// JSON helpers shared by the vendor parsers
// ---------------------------------------------------------------------------

/// Decode a line into a JSON object.
///
/// - blank or non-JSON input: `Ok(None)` (skip silently)
/// - JSON that is not an object: `Err(ParseError::Schema)`
pub(crate) fn decode_object(line: &str) -> Result<Option<Map<String, Value>>, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return Ok(None);
    };
    match value {
        Value::Object(obj) => Ok(Some(obj)),
        _ => Err(schema_error(trimmed)),
    }
}

/// Decode a line into a JSON object carrying a string `type`.
///
/// Like [`decode_object`], but an object without a `type` is also a
/// schema error.
pub(crate) fn decode_frame(line: &str) -> Result<Option<(String, Map<String, Value>)>, ParseError> {
    let Some(obj) = decode_object(line)? else {
        return Ok(None);
    };
    match obj.get("type").and_then(Value::as_str) {
        Some(kind) => Ok(Some((kind.to_string(), obj))),
        None => Err(schema_error(line.trim())),
    }
}

pub(crate) fn schema_error(line: &str) -> ParseError {
    ParseError::Schema(truncate(line, 120))
}

pub(crate) fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

/// Missing, null or negative counts read as zero.
pub(crate) fn u64_field(v: &Value, key: &str) -> u64 {
    v.get(key).and_then(Value::as_u64).unwrap_or(0)
}

pub(crate) fn f64_field(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

/// Tool inputs are reported as objects; anything else is wrapped.
pub(crate) fn input_map(v: Option<&Value>) -> Map<String, Value> {
    match v {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    }
}

/// Flatten tool output that may be a string, an array of text blocks, or
/// arbitrary JSON into plain text.
pub(crate) fn flatten_text(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                other => str_field(other, "text").map(str::to_string),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
