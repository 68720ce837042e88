//! In-process runners for tests and for orchestrators without real CLIs.
//!
//! [`MockRunner`] replays a script of events and parser signals through
//! the same tracker and emitter as the CLI runners, so sequence numbers,
//! metrics and sink closing behave identically. [`StubRunner`] occupies a
//! registry slot for a runner that cannot run here.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::process::{CANCELLED_MESSAGE, CliExecutor, TIMED_OUT_MESSAGE};
use super::tracker::RunTracker;
use super::{Runner, RunnerError};
use crate::event::{EventData, MessageEventData, RunEmitter, StatusEventData};
use crate::parser::{ParseError, ParsedLine, StreamParser, StreamSignal};
use crate::types::{
    Availability, Capabilities, ExecuteRequest, ExecuteResult, RunId, RunnerType,
};

/// One scripted action of a [`MockRunner`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockStep {
    /// Publish an event.
    Event(EventData),
    /// Feed a signal to the metric tracker, as a parser would.
    Signal(StreamSignal),
    /// Wait, honouring cancellation.
    Sleep(Duration),
}

/// The mock never reads a stream; its tracker gets a parser that yields
/// nothing.
struct NoStream;

impl StreamParser for NoStream {
    fn parse(&mut self, _run_id: RunId, _line: &str) -> Result<ParsedLine, ParseError> {
        Ok(ParsedLine::default())
    }
}

/// Scripted runner of type [`RunnerType::Mock`].
pub struct MockRunner {
    steps: Vec<MockStep>,
    exit_code: i32,
    executor: CliExecutor,
}

impl MockRunner {
    pub fn new(steps: Vec<MockStep>) -> Self {
        Self {
            steps,
            exit_code: 0,
            executor: CliExecutor::new(RunnerType::Mock, Duration::ZERO),
        }
    }

    /// A run that answers `text` once and completes.
    pub fn scripted_success(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(vec![
            MockStep::Signal(StreamSignal::TurnStarted),
            MockStep::Event(EventData::Message(MessageEventData::assistant(text.clone()))),
            MockStep::Signal(StreamSignal::AssistantText(text)),
            MockStep::Signal(StreamSignal::Terminal),
        ])
    }

    /// Report `code` as the exit code of every run.
    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn steps(&self) -> &[MockStep] {
        &self.steps
    }
}

impl std::fmt::Debug for MockRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRunner")
            .field("steps", &self.steps.len())
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn runner_type(&self) -> RunnerType {
        RunnerType::Mock
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            messages: true,
            tool_events: true,
            cost_tracking: true,
            streaming: true,
            cancellation: true,
            max_turns: None,
            models: vec!["mock".to_string()],
        }
    }

    async fn is_available(&self) -> Availability {
        Availability::available("in-process mock")
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<ExecuteResult, RunnerError> {
        self.executor.validate(&request)?;
        let token = cancel.child_token();
        let _active = self.executor.register(request.run_id, token.clone())?;

        let started = Instant::now();
        let deadline = request.profile.timeout.map(|t| started + t);
        let mut tracker = RunTracker::new(
            Box::new(NoStream),
            RunEmitter::new(request.run_id, request.sink),
        );

        let mut stopped: Option<&'static str> = None;
        for step in &self.steps {
            if token.is_cancelled() {
                stopped = Some("cancelled");
                break;
            }
            match step {
                MockStep::Event(data) => tracker.emit(data.clone()),
                MockStep::Signal(signal) => tracker.apply(signal.clone()),
                MockStep::Sleep(d) => {
                    let expired = async {
                        match deadline {
                            Some(at) => sleep_until(at).await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        _ = sleep(*d) => {}
                        _ = token.cancelled() => {
                            stopped = Some("cancelled");
                            break;
                        }
                        _ = expired => {
                            stopped = Some("timed_out");
                            break;
                        }
                    }
                }
            }
        }

        if let Some(status) = stopped {
            tracker.emit(EventData::Status(StatusEventData {
                status: status.to_string(),
                message: None,
                metadata: None,
            }));
        }
        let outcome = tracker.finish();
        let duration = started.elapsed();

        let success = stopped.is_none() && self.exit_code == 0 && outcome.terminal_seen;
        let error_message = match stopped {
            Some("timed_out") => Some(format!(
                "{TIMED_OUT_MESSAGE} after {:?}",
                request.profile.timeout.unwrap_or_default()
            )),
            Some(_) => Some(CANCELLED_MESSAGE.to_string()),
            None if success => None,
            None if self.exit_code != 0 => Some(match &outcome.last_error {
                Some(e) => format!("mock process exited with code {}: {e}", self.exit_code),
                None => format!("mock process exited with code {}", self.exit_code),
            }),
            None => Some("mock run ended without a completion event".to_string()),
        };
        info!(run_id = %request.run_id, success, events = outcome.events_emitted, "mock run finished");

        Ok(ExecuteResult {
            run_id: request.run_id,
            success,
            exit_code: Some(self.exit_code),
            duration,
            summary: outcome.summary,
            error_message,
            metrics: outcome.metrics,
            cancelled: stopped.is_some(),
            events_emitted: outcome.events_emitted,
        })
    }

    async fn stop(&self, run_id: RunId) -> Result<(), RunnerError> {
        self.executor.stop(run_id)
    }
}

/// Placeholder for a runner type that cannot run in this environment.
#[derive(Debug, Clone)]
pub struct StubRunner {
    runner_type: RunnerType,
    reason: String,
}

impl StubRunner {
    pub fn new(runner_type: RunnerType, reason: impl Into<String>) -> Self {
        Self {
            runner_type,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Runner for StubRunner {
    fn runner_type(&self) -> RunnerType {
        self.runner_type
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn is_available(&self) -> Availability {
        Availability::unavailable(self.reason.clone())
    }

    async fn execute(
        &self,
        _request: ExecuteRequest,
        _cancel: CancellationToken,
    ) -> Result<ExecuteResult, RunnerError> {
        Err(RunnerError::Config(format!(
            "runner '{}' is unavailable: {}",
            self.runner_type, self.reason
        )))
    }

    async fn stop(&self, run_id: RunId) -> Result<(), RunnerError> {
        Err(RunnerError::NotFound(run_id))
    }
}
