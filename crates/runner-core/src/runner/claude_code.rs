//! Claude Code runner.
//!
//! Spawns `claude -p --output-format stream-json --verbose` with the prompt
//! on stdin and normalizes its JSONL output with [`ClaudeStreamParser`].

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::probe;
use super::process::{CliExecutor, CliInvocation};
use super::{Runner, RunnerError};
use crate::config::CliSettings;
use crate::parser::ClaudeStreamParser;
use crate::types::{
    Availability, Capabilities, ExecuteRequest, ExecuteResult, RunId, RunnerType,
};

/// Model aliases the Claude Code CLI accepts.
pub const CLAUDE_MODELS: &[&str] = &["sonnet", "opus", "haiku"];

/// Runner for [Claude Code](https://docs.anthropic.com/en/docs/claude-code).
pub struct ClaudeCodeRunner {
    settings: CliSettings,
    executor: CliExecutor,
}

impl ClaudeCodeRunner {
    pub fn new(settings: CliSettings) -> Self {
        let executor = CliExecutor::new(RunnerType::ClaudeCode, settings.grace);
        Self { settings, executor }
    }

    /// Runner using `path` as the `claude` binary and default settings
    /// otherwise.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self::new(CliSettings::new(path))
    }

    pub fn settings(&self) -> &CliSettings {
        &self.settings
    }

    /// Assemble the command line for `request`.
    pub fn invocation(&self, request: &ExecuteRequest) -> CliInvocation {
        let profile = &request.profile;
        let mut inv = CliInvocation::new(&self.settings.binary).args([
            "-p",
            "--output-format",
            "stream-json",
            "--verbose",
        ]);

        if let Some(model) = profile.model.as_ref().or(self.settings.default_model.as_ref()) {
            inv = inv.arg("--model").arg(model);
        }
        if let Some(turns) = profile.max_turns.or(self.settings.max_turns) {
            inv = inv.arg("--max-turns").arg(turns.to_string());
        }
        if !profile.allowed_tools.is_empty() {
            inv = inv.arg("--allowedTools").arg(profile.allowed_tools.join(","));
        }
        if let Some(task) = &request.task {
            inv = inv.arg("--append-system-prompt").arg(task.render());
        }
        inv.args(self.settings.extra_args.iter().cloned())
            .args(profile.extra_args.iter().cloned())
            .stdin(request.prompt.clone())
    }
}

impl std::fmt::Debug for ClaudeCodeRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeCodeRunner")
            .field("binary", &self.settings.binary)
            .finish()
    }
}

impl Default for ClaudeCodeRunner {
    fn default() -> Self {
        Self::new(CliSettings::new("claude"))
    }
}

#[async_trait]
impl Runner for ClaudeCodeRunner {
    fn runner_type(&self) -> RunnerType {
        RunnerType::ClaudeCode
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            messages: true,
            tool_events: true,
            cost_tracking: true,
            streaming: true,
            cancellation: true,
            max_turns: self.settings.max_turns,
            models: CLAUDE_MODELS.iter().map(|m| m.to_string()).collect(),
        }
    }

    async fn is_available(&self) -> Availability {
        probe::probe_cli(&self.settings.binary, probe::env_claude_credentials).await
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<ExecuteResult, RunnerError> {
        let invocation = self.invocation(&request);
        self.executor
            .execute(request, invocation, Box::new(ClaudeStreamParser::new()), cancel)
            .await
    }

    async fn stop(&self, run_id: RunId) -> Result<(), RunnerError> {
        self.executor.stop(run_id)
    }
}
