//! Codex `exec --json` normalizer.
//!
//! Codex has shipped two JSONL schemas:
//!
//! - the event-message schema, where each line is `{"id":…,"msg":{"type":…}}`
//!   (bare `{"type":…}` objects are accepted too), and
//! - the item schema (`thread.started`, `item.completed`, `turn.completed`…).
//!
//! Both are understood. Usage frames without a reported cost are priced
//! from [`ModelPricing`].

use std::collections::HashMap;

use serde_json::{Map, Value, json};
use tracing::debug;

use super::{
    ParseError, ParsedLine, StreamParser, StreamSignal, UsageReport, decode_object, f64_field,
    flatten_text, input_map, schema_error, str_field, u64_field,
};
use crate::event::{
    CostEventData, ErrorEventData, EventData, LogEventData, LogLevel, MessageEventData,
    MetricEventData, ToolCallEventData, ToolResultEventData,
};
use crate::types::RunId;

/// Model Codex uses when no `--model` is passed.
pub const DEFAULT_CODEX_MODEL: &str = "gpt-5-codex";

/// USD prices per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub cached_input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPricing {
    /// Published list prices for the models Codex commonly runs.
    pub fn for_model(model: &str) -> Option<Self> {
        let (input, cached, output) = match model {
            "gpt-5" | "gpt-5-codex" | "gpt-5.1" | "gpt-5.1-codex" => (1.25, 0.125, 10.0),
            "gpt-5-mini" | "gpt-5.1-codex-mini" | "codex-mini-latest" => (0.25, 0.025, 2.0),
            "gpt-5-nano" => (0.05, 0.005, 0.4),
            "o4-mini" => (1.10, 0.275, 4.40),
            "o3" => (2.0, 0.5, 8.0),
            "gpt-4.1" => (2.0, 0.5, 8.0),
            _ => return None,
        };
        Some(Self {
            input_per_mtok: input,
            cached_input_per_mtok: cached,
            output_per_mtok: output,
        })
    }

    /// Cost of one usage report. Cached input tokens are part of
    /// `input_tokens` and billed at the cached rate.
    pub fn estimate(&self, usage: &UsageReport) -> f64 {
        let cached = usage.cache_read_tokens.min(usage.input_tokens);
        let fresh = usage.input_tokens - cached;
        (fresh as f64 * self.input_per_mtok
            + cached as f64 * self.cached_input_per_mtok
            + usage.output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

/// Per-run parser state for the Codex stream.
#[derive(Debug)]
pub struct CodexStreamParser {
    model: String,
    pricing: Option<ModelPricing>,
    /// call id -> tool keyword, for naming results.
    tool_names: HashMap<String, String>,
    /// Streaming deltas since the last complete agent message.
    partial_text: String,
}

impl CodexStreamParser {
    /// `model` is the model passed to `codex --model`, if any.
    pub fn new(model: Option<&str>) -> Self {
        let model = model.unwrap_or(DEFAULT_CODEX_MODEL).to_string();
        let pricing = ModelPricing::for_model(&model);
        Self {
            model,
            pricing,
            tool_names: HashMap::new(),
            partial_text: String::new(),
        }
    }

    fn call(&mut self, out: &mut ParsedLine, tool_name: &str, call_id: Option<&str>, input: Map<String, Value>) {
        if let Some(id) = call_id {
            self.tool_names.insert(id.to_string(), tool_name.to_string());
        }
        out.event(EventData::ToolCall(ToolCallEventData {
            tool_name: tool_name.to_string(),
            input,
            call_id: call_id.map(str::to_string),
        }));
    }

    fn result(
        &mut self,
        out: &mut ParsedLine,
        fallback: &str,
        call_id: Option<&str>,
        output: String,
        is_error: bool,
    ) {
        let tool_name = call_id
            .and_then(|id| self.tool_names.remove(id))
            .unwrap_or_else(|| fallback.to_string());
        out.event(EventData::ToolResult(ToolResultEventData {
            tool_name,
            output,
            is_error,
            call_id: call_id.map(str::to_string),
        }));
    }

    /// Turn a usage object into a cost (or plain metric) event plus a signal.
    fn usage(&self, out: &mut ParsedLine, usage: &Value, reported_cost: Option<f64>, cumulative: bool) {
        let mut report = UsageReport {
            input_tokens: u64_field(usage, "input_tokens"),
            output_tokens: u64_field(usage, "output_tokens"),
            cache_read_tokens: u64_field(usage, "cached_input_tokens")
                .max(u64_field(usage, "cache_read_input_tokens")),
            cache_creation_tokens: u64_field(usage, "cache_creation_input_tokens"),
            cost_usd: None,
            cumulative,
        };
        let cost = reported_cost
            .or_else(|| f64_field(usage, "total_cost_usd"))
            .or_else(|| self.pricing.map(|p| p.estimate(&report)));
        report.cost_usd = cost;

        match report.cost_usd {
            Some(total_cost_usd) => out.event(EventData::Cost(CostEventData {
                input_tokens: report.input_tokens,
                output_tokens: report.output_tokens,
                cache_read_tokens: report.cache_read_tokens,
                cache_creation_tokens: report.cache_creation_tokens,
                total_cost_usd,
                model: Some(self.model.clone()),
            })),
            None => {
                let mut values = Map::new();
                values.insert("input_tokens".into(), report.input_tokens.into());
                values.insert("output_tokens".into(), report.output_tokens.into());
                values.insert("cache_read_tokens".into(), report.cache_read_tokens.into());
                values.insert("cumulative".into(), cumulative.into());
                values.insert("model".into(), self.model.clone().into());
                out.event(EventData::Metric(MetricEventData {
                    name: "token_usage".to_string(),
                    values,
                }));
            }
        }
        out.signal(StreamSignal::Usage(report));
    }

    fn assistant_message(out: &mut ParsedLine, text: &str) {
        if text.is_empty() {
            return;
        }
        out.event(EventData::Message(MessageEventData::assistant(text)));
        out.signal(StreamSignal::AssistantText(text.to_string()));
        out.signal(StreamSignal::Terminal);
    }

    fn error(out: &mut ParsedLine, code: &str, v: &Value) {
        let message = str_field(v, "message")
            .or_else(|| v.get("error").and_then(|e| str_field(e, "message")))
            .or_else(|| str_field(v, "error"))
            .unwrap_or("codex reported an error")
            .to_string();
        out.event(EventData::Error(ErrorEventData {
            code: str_field(v, "code").unwrap_or(code).to_string(),
            message,
        }));
    }

    // -----------------------------------------------------------------------
    // Event-message schema
    // -----------------------------------------------------------------------

    fn parse_msg(&mut self, kind: &str, v: &Value, out: &mut ParsedLine) {
        let call_id = str_field(v, "call_id");
        match kind {
            "agent_message" => {
                self.partial_text.clear();
                Self::assistant_message(out, str_field(v, "message").unwrap_or_default());
            }
            "agent_message_delta" => {
                if let Some(delta) = str_field(v, "delta") {
                    self.partial_text.push_str(delta);
                    out.signal(StreamSignal::AssistantText(self.partial_text.clone()));
                }
            }
            "task_started" => out.signal(StreamSignal::TurnStarted),
            "task_complete" => {
                if let Some(text) = str_field(v, "last_agent_message") {
                    out.signal(StreamSignal::AssistantText(text.to_string()));
                }
            }
            "function_call" => {
                let name = str_field(v, "name").unwrap_or("function_call");
                let input = match v.get("arguments") {
                    // Arguments arrive as a JSON-encoded string.
                    Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
                        Ok(parsed) => input_map(Some(&parsed)),
                        Err(_) => input_map(Some(&Value::String(raw.clone()))),
                    },
                    other => input_map(other),
                };
                self.call(out, name, call_id, input);
            }
            "exec_command_start" | "exec_command_begin" => {
                self.call(out, "exec", call_id, input_map(Some(v)));
            }
            "apply_patch_start" | "patch_apply_begin" | "file_change" => {
                self.call(out, "file_change", call_id, input_map(Some(v)));
            }
            "function_call_output" => {
                let output = flatten_text(v.get("output"));
                self.result(out, "function_call", call_id, output, false);
            }
            "exec_command_end" => {
                let output = match str_field(v, "aggregated_output") {
                    Some(s) => s.to_string(),
                    None => {
                        let stdout = str_field(v, "stdout").unwrap_or_default();
                        let stderr = str_field(v, "stderr").unwrap_or_default();
                        [stdout, stderr]
                            .into_iter()
                            .filter(|s| !s.is_empty())
                            .collect::<Vec<_>>()
                            .join("\n")
                    }
                };
                let failed = v.get("exit_code").and_then(Value::as_i64).unwrap_or(0) != 0;
                self.result(out, "exec", call_id, output, failed);
            }
            "patch_apply_end" => {
                let output = str_field(v, "stdout").unwrap_or_default().to_string();
                let failed = !v.get("success").and_then(Value::as_bool).unwrap_or(true);
                self.result(out, "file_change", call_id, output, failed);
            }
            "token_count" => {
                // Newer builds nest running totals under `info`.
                if let Some(total) = v.get("info").and_then(|i| i.get("total_token_usage")) {
                    self.usage(out, total, None, true);
                } else if let Some(usage) = v.get("usage") {
                    self.usage(out, usage, f64_field(v, "total_cost_usd"), false);
                } else if v.get("input_tokens").is_some() {
                    self.usage(out, v, None, false);
                }
            }
            "turn_complete" => {
                if let Some(usage) = v.get("usage") {
                    self.usage(out, usage, f64_field(v, "total_cost_usd"), false);
                }
            }
            "error" | "stream_error" => Self::error(out, "codex_error", v),
            other => {
                debug!(event_type = other, "ignoring unrecognised codex event type");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Item schema
    // -----------------------------------------------------------------------

    fn parse_item(&mut self, started: bool, item: &Value, out: &mut ParsedLine) {
        let id = str_field(item, "id");
        let failed = str_field(item, "status") == Some("failed");
        match str_field(item, "type").unwrap_or("") {
            "agent_message" if !started => {
                Self::assistant_message(out, str_field(item, "text").unwrap_or_default());
            }
            "command_execution" => {
                if started {
                    self.call(out, "exec", id, command_input(item));
                } else {
                    if id.is_none_or(|id| !self.tool_names.contains_key(id)) {
                        self.call(out, "exec", id, command_input(item));
                    }
                    let exit_failed = item.get("exit_code").and_then(Value::as_i64).unwrap_or(0) != 0;
                    let output = str_field(item, "aggregated_output").unwrap_or_default().to_string();
                    self.result(out, "exec", id, output, failed || exit_failed);
                }
            }
            "file_change" => {
                if started {
                    self.call(out, "file_change", id, changes_input(item));
                } else {
                    if id.is_none_or(|id| !self.tool_names.contains_key(id)) {
                        self.call(out, "file_change", id, changes_input(item));
                    }
                    let output = str_field(item, "status").unwrap_or("completed").to_string();
                    self.result(out, "file_change", id, output, failed);
                }
            }
            "mcp_tool_call" => {
                let server = str_field(item, "server").unwrap_or("mcp");
                let tool = str_field(item, "tool").unwrap_or("unknown");
                let name = format!("{server}.{tool}");
                if started {
                    self.call(out, &name, id, input_map(item.get("arguments")));
                } else {
                    if id.is_none_or(|id| !self.tool_names.contains_key(id)) {
                        self.call(out, &name, id, input_map(item.get("arguments")));
                    }
                    let output = item
                        .get("result")
                        .map(|r| flatten_text(r.get("content").or(Some(r))))
                        .unwrap_or_default();
                    self.result(out, &name, id, output, failed);
                }
            }
            "error" if !started => Self::error(out, "item_error", item),
            _ => {}
        }
    }
}

fn command_input(item: &Value) -> Map<String, Value> {
    let mut input = Map::new();
    if let Some(command) = item.get("command") {
        input.insert("command".to_string(), command.clone());
    }
    input
}

fn changes_input(item: &Value) -> Map<String, Value> {
    let mut input = Map::new();
    input.insert(
        "changes".to_string(),
        item.get("changes").cloned().unwrap_or_else(|| json!([])),
    );
    input
}

impl StreamParser for CodexStreamParser {
    fn parse(&mut self, _run_id: RunId, line: &str) -> Result<ParsedLine, ParseError> {
        let Some(obj) = decode_object(line)? else {
            return Ok(ParsedLine::default());
        };
        let mut out = ParsedLine::default();
        let v = Value::Object(obj);

        // Event-message envelope: {"id": "...", "msg": {"type": ...}}
        let Some(kind) = str_field(&v, "type") else {
            return match v.get("msg").and_then(|msg| str_field(msg, "type").map(|t| (t, msg))) {
                Some((inner, msg)) => {
                    let inner = inner.to_string();
                    self.parse_msg(&inner, msg, &mut out);
                    Ok(out)
                }
                None => Err(schema_error(line.trim())),
            };
        };
        let kind = kind.to_string();

        match kind.as_str() {
            "thread.started" => {
                let thread_id = str_field(&v, "thread_id").unwrap_or_default().to_string();
                out.event(EventData::Log(
                    LogEventData::new(LogLevel::Info, "Codex session started")
                        .with_metadata(json!({ "thread_id": thread_id, "model": self.model })),
                ));
                if !thread_id.is_empty() {
                    out.signal(StreamSignal::SessionId(thread_id));
                }
            }
            "turn.started" => out.signal(StreamSignal::TurnStarted),
            "turn.completed" => {
                if let Some(usage) = v.get("usage") {
                    self.usage(&mut out, usage, None, false);
                }
            }
            "turn.failed" => Self::error(&mut out, "turn_failed", &v),
            "item.started" | "item.completed" => {
                if let Some(item) = v.get("item") {
                    self.parse_item(kind == "item.started", item, &mut out);
                }
            }
            "item.updated" => {}
            _ => self.parse_msg(&kind, &v, &mut out),
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(p: &mut CodexStreamParser, line: &str) -> ParsedLine {
        p.parse(RunId::new(), line).unwrap()
    }

    #[test]
    fn agent_message_is_terminal() {
        let mut p = CodexStreamParser::new(None);
        let out = parse(&mut p, r#"{"type":"agent_message","message":"done"}"#);
        assert_eq!(
            out.events,
            vec![EventData::Message(MessageEventData::assistant("done"))]
        );
        assert!(out.signals.contains(&StreamSignal::Terminal));
    }

    #[test]
    fn msg_envelope_is_unwrapped() {
        let mut p = CodexStreamParser::new(None);
        let out = parse(
            &mut p,
            r#"{"id":"0","msg":{"type":"agent_message","message":"hello"}}"#,
        );
        assert!(matches!(&out.events[0], EventData::Message(m) if m.content == "hello"));
    }

    #[test]
    fn envelope_stream_reaches_completion() {
        let mut p = CodexStreamParser::new(None);
        let started = parse(&mut p, r#"{"id":"0","msg":{"type":"task_started"}}"#);
        assert!(started.signals.contains(&StreamSignal::TurnStarted));

        let call = parse(
            &mut p,
            r#"{"id":"1","msg":{"type":"exec_command_begin","call_id":"e1","command":["ls"]}}"#,
        );
        assert!(matches!(&call.events[0], EventData::ToolCall(c) if c.call_id.as_deref() == Some("e1")));

        let done = parse(
            &mut p,
            r#"{"id":"1","msg":{"type":"agent_message","message":"ok"}}"#,
        );
        assert!(matches!(&done.events[0], EventData::Message(m) if m.content == "ok"));
        assert!(done.signals.contains(&StreamSignal::Terminal));
    }

    #[test]
    fn envelope_without_inner_type_is_a_schema_error() {
        let mut p = CodexStreamParser::new(None);
        let err = p.parse(RunId::new(), r#"{"id":"0","msg":{"message":"x"}}"#);
        assert!(matches!(err, Err(ParseError::Schema(_))));
        let err = p.parse(RunId::new(), r#"{"id":"0"}"#);
        assert!(matches!(err, Err(ParseError::Schema(_))));
    }

    #[test]
    fn deltas_do_not_emit_events() {
        let mut p = CodexStreamParser::new(None);
        parse(&mut p, r#"{"type":"agent_message_delta","delta":"hel"}"#);
        let out = parse(&mut p, r#"{"type":"agent_message_delta","delta":"lo"}"#);
        assert!(out.events.is_empty());
        assert_eq!(out.signals, vec![StreamSignal::AssistantText("hello".into())]);
    }

    #[test]
    fn patch_frames_map_to_file_change() {
        let mut p = CodexStreamParser::new(None);
        let call = parse(
            &mut p,
            r#"{"type":"patch_apply_begin","call_id":"c1","changes":{"foo.txt":{"add":{"content":"hi"}}}}"#,
        );
        let result = parse(
            &mut p,
            r#"{"type":"patch_apply_end","call_id":"c1","stdout":"A foo.txt","success":true}"#,
        );
        let EventData::ToolCall(c) = &call.events[0] else { panic!() };
        assert_eq!(c.tool_name, "file_change");
        assert!(c.input.contains_key("changes"));
        let EventData::ToolResult(r) = &result.events[0] else { panic!() };
        assert_eq!(r.tool_name, "file_change");
        assert!(!r.is_error);
    }

    #[test]
    fn exec_end_failure_sets_is_error() {
        let mut p = CodexStreamParser::new(None);
        parse(&mut p, r#"{"type":"exec_command_begin","call_id":"e1","command":["ls"]}"#);
        let out = parse(
            &mut p,
            r#"{"type":"exec_command_end","call_id":"e1","stdout":"","stderr":"nope","exit_code":2}"#,
        );
        let EventData::ToolResult(r) = &out.events[0] else { panic!() };
        assert_eq!(r.tool_name, "exec");
        assert_eq!(r.output, "nope");
        assert!(r.is_error);
    }

    #[test]
    fn function_call_arguments_are_decoded() {
        let mut p = CodexStreamParser::new(None);
        let out = parse(
            &mut p,
            r#"{"type":"function_call","name":"shell","call_id":"f1","arguments":"{\"command\":[\"ls\"]}"}"#,
        );
        let EventData::ToolCall(c) = &out.events[0] else { panic!() };
        assert_eq!(c.tool_name, "shell");
        assert_eq!(c.input["command"][0], "ls");
    }

    #[test]
    fn usage_without_cost_is_estimated() {
        let mut p = CodexStreamParser::new(Some("gpt-5"));
        let out = parse(
            &mut p,
            r#"{"type":"turn.completed","usage":{"input_tokens":1000000,"cached_input_tokens":0,"output_tokens":100000}}"#,
        );
        let EventData::Cost(cost) = &out.events[0] else { panic!("{:?}", out.events) };
        assert!((cost.total_cost_usd - 2.25).abs() < 1e-9);
        assert_eq!(cost.model.as_deref(), Some("gpt-5"));
    }

    #[test]
    fn unknown_model_yields_metric_event() {
        let mut p = CodexStreamParser::new(Some("mystery-model"));
        let out = parse(
            &mut p,
            r#"{"type":"turn_complete","usage":{"input_tokens":5,"output_tokens":2}}"#,
        );
        let EventData::Metric(m) = &out.events[0] else { panic!() };
        assert_eq!(m.name, "token_usage");
        assert_eq!(m.values["input_tokens"], 5);
    }

    #[test]
    fn reported_cost_wins_over_estimate() {
        let mut p = CodexStreamParser::new(None);
        let out = parse(
            &mut p,
            r#"{"type":"turn_complete","total_cost_usd":0.5,"usage":{"input_tokens":5,"output_tokens":2}}"#,
        );
        let EventData::Cost(cost) = &out.events[0] else { panic!() };
        assert_eq!(cost.total_cost_usd, 0.5);
    }

    #[test]
    fn token_count_totals_are_cumulative() {
        let mut p = CodexStreamParser::new(None);
        let out = parse(
            &mut p,
            r#"{"type":"token_count","info":{"total_token_usage":{"input_tokens":40,"cached_input_tokens":10,"output_tokens":4}}}"#,
        );
        let usage = out.signals.iter().find_map(|s| match s {
            StreamSignal::Usage(u) => Some(u.clone()),
            _ => None,
        });
        let usage = usage.unwrap();
        assert!(usage.cumulative);
        assert_eq!(usage.cache_read_tokens, 10);
    }

    #[test]
    fn item_schema_command_round_trip() {
        let mut p = CodexStreamParser::new(None);
        let started = parse(
            &mut p,
            r#"{"type":"item.started","item":{"id":"item_1","type":"command_execution","command":"bash -lc ls","status":"in_progress"}}"#,
        );
        let done = parse(
            &mut p,
            r#"{"type":"item.completed","item":{"id":"item_1","type":"command_execution","command":"bash -lc ls","aggregated_output":"a\nb","exit_code":0,"status":"completed"}}"#,
        );
        assert_eq!(started.events.len(), 1);
        assert_eq!(done.events.len(), 1);
        let EventData::ToolResult(r) = &done.events[0] else { panic!() };
        assert_eq!(r.tool_name, "exec");
        assert_eq!(r.output, "a\nb");
    }

    #[test]
    fn completed_file_change_without_start_emits_call_and_result() {
        let mut p = CodexStreamParser::new(None);
        let out = parse(
            &mut p,
            r#"{"type":"item.completed","item":{"id":"item_2","type":"file_change","changes":[{"path":"foo.txt","kind":"add"}],"status":"completed"}}"#,
        );
        assert_eq!(out.events.len(), 2);
        assert!(matches!(&out.events[0], EventData::ToolCall(c) if c.tool_name == "file_change"));
        assert!(matches!(&out.events[1], EventData::ToolResult(r) if r.tool_name == "file_change"));
    }

    #[test]
    fn item_agent_message_and_failures() {
        let mut p = CodexStreamParser::new(None);
        let msg = parse(
            &mut p,
            r#"{"type":"item.completed","item":{"id":"item_3","type":"agent_message","text":"Created foo.txt"}}"#,
        );
        assert!(msg.signals.contains(&StreamSignal::Terminal));

        let failed = parse(&mut p, r#"{"type":"turn.failed","error":{"message":"quota"}}"#);
        assert!(matches!(&failed.events[0], EventData::Error(e) if e.code == "turn_failed" && e.message == "quota"));

        let err = parse(&mut p, r#"{"type":"error","message":"stream broke"}"#);
        assert!(matches!(&err.events[0], EventData::Error(e) if e.message == "stream broke"));
    }

    #[test]
    fn pricing_bills_cached_tokens_at_cached_rate() {
        let pricing = ModelPricing::for_model("gpt-5").unwrap();
        let usage = UsageReport {
            input_tokens: 2_000_000,
            cache_read_tokens: 1_000_000,
            ..Default::default()
        };
        assert!((pricing.estimate(&usage) - 1.375).abs() < 1e-9);
    }
}
