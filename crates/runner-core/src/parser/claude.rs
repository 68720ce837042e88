//! Claude Code `--output-format stream-json` normalizer.

use std::collections::{HashMap, HashSet};

use serde_json::{Value, json};
use tracing::debug;

use super::{
    ParseError, ParsedLine, StreamParser, StreamSignal, UsageReport, decode_frame, f64_field,
    flatten_text, input_map, str_field, u64_field,
};
use crate::event::{
    CostEventData, ErrorEventData, EventData, LogEventData, LogLevel, MessageEventData,
    StatusEventData, ToolCallEventData, ToolResultEventData,
};
use crate::types::RunId;

/// Per-run parser state for the Claude Code stream.
#[derive(Debug, Default)]
pub struct ClaudeStreamParser {
    /// `tool_use` id -> tool name, for resolving `tool_result` blocks.
    tool_names: HashMap<String, String>,
    /// Assistant `message.id`s already seen. Claude repeats the same
    /// message (and its usage) once per content block.
    seen_messages: HashSet<String>,
    model: Option<String>,
}

impl ClaudeStreamParser {
    pub fn new() -> Self {
        Self::default()
    }
}

fn usage_report(usage: &Value, cumulative: bool, cost_usd: Option<f64>) -> UsageReport {
    UsageReport {
        input_tokens: u64_field(usage, "input_tokens"),
        output_tokens: u64_field(usage, "output_tokens"),
        cache_read_tokens: u64_field(usage, "cache_read_input_tokens"),
        cache_creation_tokens: u64_field(usage, "cache_creation_input_tokens"),
        cost_usd,
        cumulative,
    }
}

impl StreamParser for ClaudeStreamParser {
    fn parse(&mut self, _run_id: RunId, line: &str) -> Result<ParsedLine, ParseError> {
        let Some((kind, obj)) = decode_frame(line)? else {
            return Ok(ParsedLine::default());
        };
        let v = Value::Object(obj);
        let mut out = ParsedLine::default();

        match kind.as_str() {
            // ----------------------------------------------------------------
            // system/init -- session metadata
            // ----------------------------------------------------------------
            "system" => {
                if str_field(&v, "subtype") != Some("init") {
                    return Ok(out);
                }
                let session_id = str_field(&v, "session_id").unwrap_or_default().to_string();
                if let Some(model) = str_field(&v, "model") {
                    self.model = Some(model.to_string());
                }
                let metadata = json!({
                    "session_id": session_id,
                    "tools": v.get("tools").cloned().unwrap_or_else(|| json!([])),
                    "mcp_servers": v.get("mcp_servers").cloned().unwrap_or_else(|| json!([])),
                });
                out.event(EventData::Log(
                    LogEventData::new(LogLevel::Info, "Claude Code session started")
                        .with_metadata(metadata),
                ));
                if !session_id.is_empty() {
                    out.signal(StreamSignal::SessionId(session_id));
                }
            }

            // ----------------------------------------------------------------
            // assistant -- text and tool_use content blocks plus usage
            // ----------------------------------------------------------------
            "assistant" => {
                let Some(message) = v.get("message") else {
                    return Ok(out);
                };
                if let Some(model) = str_field(message, "model") {
                    self.model = Some(model.to_string());
                }

                // A message without an id counts as its own turn.
                let first_sighting = match str_field(message, "id") {
                    Some(id) => self.seen_messages.insert(id.to_string()),
                    None => true,
                };
                if first_sighting {
                    out.signal(StreamSignal::TurnStarted);
                }

                let blocks = message
                    .get("content")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for block in blocks {
                    match str_field(block, "type").unwrap_or("") {
                        "text" => {
                            let text = str_field(block, "text").unwrap_or_default();
                            if text.is_empty() {
                                continue;
                            }
                            out.event(EventData::Message(MessageEventData::assistant(text)));
                            out.signal(StreamSignal::AssistantText(text.to_string()));
                            out.signal(StreamSignal::Terminal);
                        }
                        "tool_use" => {
                            let tool_name = str_field(block, "name").unwrap_or("unknown").to_string();
                            let call_id = str_field(block, "id").map(str::to_string);
                            if let Some(id) = &call_id {
                                self.tool_names.insert(id.clone(), tool_name.clone());
                            }
                            out.event(EventData::ToolCall(ToolCallEventData {
                                tool_name,
                                input: input_map(block.get("input")),
                                call_id,
                            }));
                        }
                        _ => {}
                    }
                }

                if first_sighting {
                    if let Some(usage) = message.get("usage") {
                        out.signal(StreamSignal::Usage(usage_report(usage, false, None)));
                    }
                }
            }

            // ----------------------------------------------------------------
            // user -- tool_result blocks
            // ----------------------------------------------------------------
            "user" => {
                let blocks = v
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for block in blocks {
                    if str_field(block, "type") != Some("tool_result") {
                        continue;
                    }
                    let call_id = str_field(block, "tool_use_id").map(str::to_string);
                    let tool_name = call_id
                        .as_deref()
                        .and_then(|id| self.tool_names.get(id))
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string());
                    out.event(EventData::ToolResult(ToolResultEventData {
                        tool_name,
                        output: flatten_text(block.get("content")),
                        is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                        call_id,
                    }));
                }
            }

            // ----------------------------------------------------------------
            // result -- final, authoritative totals
            // ----------------------------------------------------------------
            "result" => {
                let subtype = str_field(&v, "subtype").unwrap_or("success").to_string();
                let is_error = v.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                let total_cost_usd = f64_field(&v, "total_cost_usd");
                let usage = v.get("usage").cloned().unwrap_or(Value::Null);
                let report = usage_report(&usage, true, total_cost_usd);

                out.event(EventData::Cost(CostEventData {
                    input_tokens: report.input_tokens,
                    output_tokens: report.output_tokens,
                    cache_read_tokens: report.cache_read_tokens,
                    cache_creation_tokens: report.cache_creation_tokens,
                    total_cost_usd: total_cost_usd.unwrap_or(0.0),
                    model: self.model.clone(),
                }));
                out.signal(StreamSignal::Usage(report));
                if let Some(turns) = v.get("num_turns").and_then(Value::as_u64) {
                    out.signal(StreamSignal::TurnCount(turns));
                }
                if let Some(session_id) = str_field(&v, "session_id") {
                    out.signal(StreamSignal::SessionId(session_id.to_string()));
                }

                if is_error {
                    let message = str_field(&v, "result")
                        .or_else(|| str_field(&v, "error"))
                        .unwrap_or("Claude Code reported an error")
                        .to_string();
                    out.event(EventData::Error(ErrorEventData {
                        code: subtype,
                        message,
                    }));
                } else {
                    out.event(EventData::Status(StatusEventData {
                        status: "completed".to_string(),
                        message: Some(subtype),
                        metadata: None,
                    }));
                    out.signal(StreamSignal::Terminal);
                }
                out.signal(StreamSignal::Details(v));
            }

            other => {
                debug!(event_type = other, "ignoring unrecognised stream-json event type");
            }
        }

        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
