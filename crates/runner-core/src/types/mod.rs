//! Shared domain types for agent runs.
//!
//! These are the values that cross the boundary between an orchestrator and
//! a [`crate::runner::Runner`]: what to run ([`ExecuteRequest`]), what came
//! out ([`ExecuteResult`], [`ExecutionMetrics`]) and how an adapter
//! describes itself ([`Capabilities`], [`Availability`]).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::event::sink::EventSink;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// Stable identity of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Generate a fresh random run id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (e.g. one allocated by the orchestrator).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// RunnerType
// ---------------------------------------------------------------------------

/// Adapter family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerType {
    ClaudeCode,
    Codex,
    #[serde(rename = "opencode")]
    OpenCode,
    Mock,
}

impl RunnerType {
    /// Every known runner type, in a stable order.
    pub const ALL: [RunnerType; 4] = [
        RunnerType::ClaudeCode,
        RunnerType::Codex,
        RunnerType::OpenCode,
        RunnerType::Mock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::Codex => "codex",
            Self::OpenCode => "opencode",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for RunnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerType {
    type Err = RunnerTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude-code" => Ok(Self::ClaudeCode),
            "codex" => Ok(Self::Codex),
            "opencode" => Ok(Self::OpenCode),
            "mock" => Ok(Self::Mock),
            other => Err(RunnerTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunnerType`] string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerTypeParseError(pub String);

impl fmt::Display for RunnerTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid runner type: {:?} (expected claude-code, codex, opencode, or mock)",
            self.0
        )
    }
}

impl std::error::Error for RunnerTypeParseError {}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Per-run knobs chosen by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunProfile {
    /// Profile label, carried into logs only.
    pub name: Option<String>,
    /// Model override passed to the CLI (`--model`).
    pub model: Option<String>,
    /// Turn limit, for CLIs that accept one.
    pub max_turns: Option<u32>,
    /// Tool allow-list, for CLIs that accept one.
    pub allowed_tools: Vec<String>,
    /// Extra arguments appended verbatim to the command line.
    pub extra_args: Vec<String>,
    /// Wall-clock limit for the whole run. Expiry cancels the run.
    pub timeout: Option<Duration>,
}

/// Optional task framing attached to the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub title: String,
    pub description: Option<String>,
}

impl TaskContext {
    /// Render the task as a block of instructions.
    pub fn render(&self) -> String {
        match &self.description {
            Some(description) if !description.trim().is_empty() => {
                format!("You are working on task: {}\n\n{}", self.title, description)
            }
            _ => format!("You are working on task: {}", self.title),
        }
    }
}

/// Inputs to one run.
#[derive(Clone)]
pub struct ExecuteRequest {
    pub run_id: RunId,
    pub runner_type: RunnerType,
    pub prompt: String,
    /// Absolute path to an existing directory; the child runs there.
    pub working_dir: PathBuf,
    /// Merged over the inherited environment of the current process.
    pub env: HashMap<String, String>,
    pub profile: RunProfile,
    pub task: Option<TaskContext>,
    /// Receives every event of the run; closed exactly once when it ends.
    pub sink: Arc<dyn EventSink>,
}

impl ExecuteRequest {
    /// Build a request with a fresh run id and default profile.
    pub fn new(
        runner_type: RunnerType,
        prompt: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            runner_type,
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            env: HashMap::new(),
            profile: RunProfile::default(),
            task: None,
            sink,
        }
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_profile(mut self, profile: RunProfile) -> Self {
        self.profile = profile;
        self
    }

    #[must_use]
    pub fn with_task(mut self, task: TaskContext) -> Self {
        self.task = Some(task);
        self
    }
}

impl fmt::Debug for ExecuteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteRequest")
            .field("run_id", &self.run_id)
            .field("runner_type", &self.runner_type)
            .field("prompt_len", &self.prompt.len())
            .field("working_dir", &self.working_dir)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("profile", &self.profile)
            .field("task", &self.task)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Counters accumulated over one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub turns: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub tool_call_count: u64,
    /// Reported or estimated cost in USD.
    pub cost_usd: f64,
}

impl ExecutionMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Structured summary of what the agent produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// The last assistant message observed on the stream.
    pub last_assistant_text: Option<String>,
    /// Vendor session identifier, when the CLI reports one.
    pub session_id: Option<String>,
    /// Adapter-specific structured blob (e.g. the Claude `result` frame).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecuteResult {
    pub run_id: RunId,
    pub success: bool,
    /// Raw exit code; `None` when the process never started or its status
    /// was unavailable. Signal deaths surface as `-signo`.
    pub exit_code: Option<i32>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
    pub summary: RunSummary,
    pub error_message: Option<String>,
    pub metrics: ExecutionMetrics,
    /// The run ended because of cancellation, `stop`, or a profile timeout.
    pub cancelled: bool,
    pub events_emitted: u64,
}

fn serialize_duration_ms<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

// ---------------------------------------------------------------------------
// Self-description
// ---------------------------------------------------------------------------

/// Constant self-description of an adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub messages: bool,
    pub tool_events: bool,
    pub cost_tracking: bool,
    pub streaming: bool,
    pub cancellation: bool,
    pub max_turns: Option<u32>,
    pub models: Vec<String>,
}

/// Answer of an availability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub available: bool,
    /// Human-readable explanation (version string or what is missing).
    pub reason: String,
}

impl Availability {
    pub fn available(reason: impl Into<String>) -> Self {
        Self {
            available: true,
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: reason.into(),
        }
    }
}
