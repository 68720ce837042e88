//! Per-run bookkeeping between a parser and the event sink.

use std::collections::VecDeque;

use serde_json::json;
use tracing::debug;

use crate::event::{EventData, LogEventData, LogLevel, RunEmitter};
use crate::parser::{StreamParser, StreamSignal, UsageReport};
use crate::types::{ExecutionMetrics, RunId, RunSummary};

/// How many stderr lines are kept for error messages.
pub const STDERR_TAIL_LINES: usize = 20;

/// Owns everything that is mutated while a run's output is consumed: the
/// parser, the emitter and the metric accumulator.
///
/// Exactly one task drives a tracker, so none of its state is shared.
pub struct RunTracker {
    parser: Box<dyn StreamParser>,
    emitter: RunEmitter,
    metrics: ExecutionMetrics,
    summary: RunSummary,
    terminal_seen: bool,
    last_error: Option<String>,
    stderr_tail: VecDeque<String>,
    decode_error_reported: bool,
}

/// Everything the tracker learned, handed back once the streams are drained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerOutcome {
    pub metrics: ExecutionMetrics,
    pub summary: RunSummary,
    pub terminal_seen: bool,
    /// `"code: message"` of the last error event.
    pub last_error: Option<String>,
    pub stderr_tail: Vec<String>,
    pub events_emitted: u64,
}

impl RunTracker {
    pub fn new(parser: Box<dyn StreamParser>, emitter: RunEmitter) -> Self {
        Self {
            parser,
            emitter,
            metrics: ExecutionMetrics::default(),
            summary: RunSummary::default(),
            terminal_seen: false,
            last_error: None,
            stderr_tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
            decode_error_reported: false,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.emitter.run_id()
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    pub fn terminal_seen(&self) -> bool {
        self.terminal_seen
    }

    /// Feed one stdout line through the parser.
    pub fn ingest_stdout(&mut self, line: &str) {
        let run_id = self.run_id();
        let parsed = match self.parser.parse(run_id, line) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(run_id = %run_id, error = %e, "skipping unrecognised stream frame");
                if !self.decode_error_reported {
                    self.decode_error_reported = true;
                    self.emit(EventData::Log(LogEventData::new(
                        LogLevel::Debug,
                        format!("ignored unrecognised stream frame: {e}"),
                    )));
                }
                return;
            }
        };

        for data in parsed.events {
            self.emit(data);
        }
        for signal in parsed.signals {
            self.apply(signal);
        }
    }

    /// Record one stderr line as a debug log event and in the tail.
    pub fn ingest_stderr(&mut self, line: &str) {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return;
        }
        if self.stderr_tail.len() == STDERR_TAIL_LINES {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line.to_string());
        self.emit(EventData::Log(
            LogEventData::new(LogLevel::Debug, line).with_metadata(json!({ "stream": "stderr" })),
        ));
    }

    /// Publish a payload, updating the metrics it implies.
    pub fn emit(&mut self, data: EventData) {
        match &data {
            EventData::ToolCall(_) => self.metrics.tool_call_count += 1,
            EventData::Error(e) => self.last_error = Some(format!("{}: {}", e.code, e.message)),
            _ => {}
        }
        self.emitter.emit(data);
    }

    /// Fold a parser signal into the metrics and summary.
    pub fn apply(&mut self, signal: StreamSignal) {
        match signal {
            StreamSignal::TurnStarted => self.metrics.turns += 1,
            StreamSignal::TurnCount(n) => self.metrics.turns = self.metrics.turns.max(n),
            StreamSignal::Usage(report) => self.add_usage(&report),
            StreamSignal::AssistantText(text) => self.summary.last_assistant_text = Some(text),
            StreamSignal::Terminal => self.terminal_seen = true,
            StreamSignal::SessionId(id) => self.summary.session_id = Some(id),
            StreamSignal::Details(details) => self.summary.details = Some(details),
        }
    }

    fn add_usage(&mut self, report: &UsageReport) {
        let m = &mut self.metrics;
        if report.cumulative {
            // Run totals are authoritative, even below the running sum.
            m.input_tokens = report.input_tokens;
            m.output_tokens = report.output_tokens;
            m.cache_read_tokens = report.cache_read_tokens;
            m.cache_creation_tokens = report.cache_creation_tokens;
            if let Some(cost) = report.cost_usd {
                m.cost_usd = cost;
            }
        } else {
            m.input_tokens += report.input_tokens;
            m.output_tokens += report.output_tokens;
            m.cache_read_tokens += report.cache_read_tokens;
            m.cache_creation_tokens += report.cache_creation_tokens;
            m.cost_usd += report.cost_usd.unwrap_or(0.0);
        }
    }

    /// Close the sink and return what was accumulated.
    pub fn finish(mut self) -> TrackerOutcome {
        self.emitter.close();
        TrackerOutcome {
            metrics: self.metrics,
            summary: self.summary,
            terminal_seen: self.terminal_seen,
            last_error: self.last_error,
            stderr_tail: self.stderr_tail.into_iter().collect(),
            events_emitted: self.emitter.emitted(),
        }
    }
}

impl std::fmt::Debug for RunTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunTracker")
            .field("emitter", &self.emitter)
            .field("metrics", &self.metrics)
            .field("terminal_seen", &self.terminal_seen)
            .finish()
    }
}
