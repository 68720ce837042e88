//! OpenCode `run --format json` normalizer.
//!
//! Every frame carries its payload in a nested `part` object.

use serde_json::{Value, json};
use tracing::debug;

use super::{
    ParseError, ParsedLine, StreamParser, StreamSignal, UsageReport, decode_frame, f64_field,
    flatten_text, input_map, str_field, u64_field,
};
use crate::event::{
    CostEventData, ErrorEventData, EventData, LogEventData, LogLevel, MessageEventData,
    ToolCallEventData, ToolResultEventData,
};
use crate::types::RunId;

#[derive(Debug, Default)]
pub struct OpenCodeStreamParser {
    model: Option<String>,
}

impl OpenCodeStreamParser {
    pub fn new(model: Option<&str>) -> Self {
        Self {
            model: model.map(str::to_string),
        }
    }
}

impl StreamParser for OpenCodeStreamParser {
    fn parse(&mut self, _run_id: RunId, line: &str) -> Result<ParsedLine, ParseError> {
        let Some((kind, obj)) = decode_frame(line)? else {
            return Ok(ParsedLine::default());
        };
        let v = Value::Object(obj);
        let part = v.get("part").cloned().unwrap_or(Value::Null);
        let mut out = ParsedLine::default();

        match kind.as_str() {
            "step_start" => {
                let mut log = LogEventData::new(LogLevel::Info, "OpenCode step started");
                if let Some(session_id) = str_field(&v, "sessionID") {
                    log = log.with_metadata(json!({ "session_id": session_id }));
                    out.signal(StreamSignal::SessionId(session_id.to_string()));
                }
                out.event(EventData::Log(log));
                out.signal(StreamSignal::TurnStarted);
            }

            "tool_use" => {
                let tool_name = str_field(&part, "tool").unwrap_or("unknown").to_string();
                let call_id = str_field(&part, "callID").map(str::to_string);
                let state = part.get("state").cloned().unwrap_or(Value::Null);
                out.event(EventData::ToolCall(ToolCallEventData {
                    tool_name: tool_name.clone(),
                    input: input_map(state.get("input")),
                    call_id: call_id.clone(),
                }));

                // A finished tool only yields a result when there is
                // something to report.
                let status = str_field(&state, "status").unwrap_or("");
                let output = flatten_text(state.get("output"));
                let is_error = status == "error";
                let output = if is_error && output.is_empty() {
                    flatten_text(state.get("error"))
                } else {
                    output
                };
                if (status == "completed" && !output.is_empty()) || is_error {
                    out.event(EventData::ToolResult(ToolResultEventData {
                        tool_name,
                        output,
                        is_error,
                        call_id,
                    }));
                }
            }

            "text" => {
                let text = str_field(&part, "text").unwrap_or_default();
                if !text.is_empty() {
                    out.event(EventData::Message(MessageEventData::assistant(text)));
                    out.signal(StreamSignal::AssistantText(text.to_string()));
                }
            }

            "step_finish" => {
                let tokens = part.get("tokens").cloned().unwrap_or(Value::Null);
                let cache = tokens.get("cache").cloned().unwrap_or(Value::Null);
                let cost = f64_field(&part, "cost").unwrap_or(0.0);
                let report = UsageReport {
                    input_tokens: u64_field(&tokens, "input"),
                    output_tokens: u64_field(&tokens, "output"),
                    cache_read_tokens: u64_field(&cache, "read"),
                    cache_creation_tokens: u64_field(&cache, "write"),
                    cost_usd: Some(cost),
                    cumulative: false,
                };
                out.event(EventData::Cost(CostEventData {
                    input_tokens: report.input_tokens,
                    output_tokens: report.output_tokens,
                    cache_read_tokens: report.cache_read_tokens,
                    cache_creation_tokens: report.cache_creation_tokens,
                    total_cost_usd: cost,
                    model: self.model.clone(),
                }));
                out.signal(StreamSignal::Usage(report));
                if str_field(&part, "reason") == Some("stop") {
                    out.signal(StreamSignal::Terminal);
                }
            }

            "error" => {
                let error = v.get("error").cloned().unwrap_or(Value::Null);
                let code = str_field(&error, "name")
                    .or_else(|| str_field(&v, "code"))
                    .unwrap_or("opencode_error")
                    .to_string();
                let message = error
                    .get("data")
                    .and_then(|d| str_field(d, "message"))
                    .or_else(|| str_field(&error, "message"))
                    .or_else(|| str_field(&v, "message"))
                    .or_else(|| error.as_str())
                    .unwrap_or("opencode reported an error")
                    .to_string();
                out.event(EventData::Error(ErrorEventData { code, message }));
            }

            other => {
                debug!(event_type = other, "ignoring unrecognised opencode event type");
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(p: &mut OpenCodeStreamParser, line: &str) -> ParsedLine {
        p.parse(RunId::new(), line).unwrap()
    }

    #[test]
    fn step_start_counts_a_turn() {
        let mut p = OpenCodeStreamParser::default();
        let out = parse(
            &mut p,
            r#"{"type":"step_start","timestamp":1,"sessionID":"s","part":{"type":"step-start"}}"#,
        );
        assert!(matches!(&out.events[0], EventData::Log(l) if l.message == "OpenCode step started"));
        assert!(out.signals.contains(&StreamSignal::TurnStarted));
    }

    #[test]
    fn completed_tool_with_output_emits_result() {
        let mut p = OpenCodeStreamParser::default();
        let out = parse(
            &mut p,
            r#"{"type":"tool_use","part":{"type":"tool","callID":"c2","tool":"bash","state":{"status":"completed","input":{"command":"ls"},"output":"a.txt"}}}"#,
        );
        assert_eq!(out.events.len(), 2);
        let EventData::ToolResult(r) = &out.events[1] else { panic!() };
        assert_eq!(r.tool_name, "bash");
        assert_eq!(r.output, "a.txt");
    }

    #[test]
    fn completed_tool_without_output_emits_call_only() {
        let mut p = OpenCodeStreamParser::default();
        let out = parse(
            &mut p,
            r#"{"type":"tool_use","part":{"type":"tool","callID":"c1","tool":"write","state":{"status":"completed","input":{"content":"hello","filePath":"/tmp/x.txt"},"output":""}}}"#,
        );
        assert_eq!(out.events.len(), 1);
        let EventData::ToolCall(c) = &out.events[0] else { panic!() };
        assert_eq!(c.tool_name, "write");
        assert_eq!(c.input["filePath"], "/tmp/x.txt");
    }

    #[test]
    fn failed_tool_emits_error_result() {
        let mut p = OpenCodeStreamParser::default();
        let out = parse(
            &mut p,
            r#"{"type":"tool_use","part":{"tool":"read","state":{"status":"error","input":{},"error":"no such file"}}}"#,
        );
        let EventData::ToolResult(r) = &out.events[1] else { panic!() };
        assert!(r.is_error);
        assert_eq!(r.output, "no such file");
    }

    #[test]
    fn step_finish_maps_tokens() {
        let mut p = OpenCodeStreamParser::new(Some("anthropic/claude-sonnet-4"));
        let out = parse(
            &mut p,
            r#"{"type":"step_finish","part":{"reason":"tool-calls","cost":0.00197528,"tokens":{"input":3562,"output":401,"cache":{"read":6144,"write":0}}}}"#,
        );
        let EventData::Cost(c) = &out.events[0] else { panic!() };
        assert_eq!(c.input_tokens, 3562);
        assert_eq!(c.output_tokens, 401);
        assert_eq!(c.cache_read_tokens, 6144);
        assert!((c.total_cost_usd - 0.00197528).abs() < 1e-12);
        assert!(!out.signals.contains(&StreamSignal::Terminal));
    }

    #[test]
    fn step_finish_stop_is_terminal() {
        let mut p = OpenCodeStreamParser::default();
        let out = parse(
            &mut p,
            r#"{"type":"step_finish","part":{"reason":"stop","cost":0.0,"tokens":{"input":0,"output":0,"cache":{"read":0,"write":0}}}}"#,
        );
        assert!(out.signals.contains(&StreamSignal::Terminal));
    }

    #[test]
    fn error_frame_extracts_message() {
        let mut p = OpenCodeStreamParser::default();
        let out = parse(
            &mut p,
            r#"{"type":"error","error":{"name":"ProviderAuthError","data":{"message":"missing key"}}}"#,
        );
        assert_eq!(
            out.events,
            vec![EventData::Error(ErrorEventData {
                code: "ProviderAuthError".into(),
                message: "missing key".into(),
            })]
        );
    }

    #[test]
    fn schema_errors_surface() {
        let mut p = OpenCodeStreamParser::default();
        assert!(p.parse(RunId::new(), r#"{"part":{}}"#).is_err());
        assert!(parse(&mut p, "").is_empty());
    }
}
