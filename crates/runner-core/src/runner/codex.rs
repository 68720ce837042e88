//! Codex CLI runner (`codex exec --json`).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::probe;
use super::process::{CliExecutor, CliInvocation};
use super::{Runner, RunnerError};
use crate::config::CliSettings;
use crate::parser::CodexStreamParser;
use crate::types::{
    Availability, Capabilities, ExecuteRequest, ExecuteResult, RunId, RunnerType,
};

pub const CODEX_MODELS: &[&str] = &["gpt-5-codex", "gpt-5", "gpt-5-mini", "o4-mini"];

/// Prefix the rendered task, if any, to the prompt.
pub(crate) fn framed_prompt(request: &ExecuteRequest) -> String {
    match &request.task {
        Some(task) => format!("{}\n\n{}", task.render(), request.prompt),
        None => request.prompt.clone(),
    }
}

pub struct CodexRunner {
    settings: CliSettings,
    executor: CliExecutor,
}

impl CodexRunner {
    pub fn new(settings: CliSettings) -> Self {
        let executor = CliExecutor::new(RunnerType::Codex, settings.grace);
        Self { settings, executor }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self::new(CliSettings::new(path))
    }

    fn model<'a>(&'a self, request: &'a ExecuteRequest) -> Option<&'a str> {
        request
            .profile
            .model
            .as_deref()
            .or(self.settings.default_model.as_deref())
    }

    /// Assemble the command line for `request`. The trailing `-` makes
    /// Codex read the prompt from stdin.
    pub fn invocation(&self, request: &ExecuteRequest) -> CliInvocation {
        let mut inv = CliInvocation::new(&self.settings.binary)
            .args(["exec", "--json", "--sandbox", "workspace-write", "--cd"])
            .arg(request.working_dir.to_string_lossy());
        if let Some(model) = self.model(request) {
            inv = inv.arg("--model").arg(model);
        }
        inv.args(self.settings.extra_args.iter().cloned())
            .args(request.profile.extra_args.iter().cloned())
            .arg("-")
            .stdin(framed_prompt(request))
    }
}

impl std::fmt::Debug for CodexRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodexRunner")
            .field("binary", &self.settings.binary)
            .finish()
    }
}

impl Default for CodexRunner {
    fn default() -> Self {
        Self::new(CliSettings::new("codex"))
    }
}

#[async_trait]
impl Runner for CodexRunner {
    fn runner_type(&self) -> RunnerType {
        RunnerType::Codex
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            messages: true,
            tool_events: true,
            cost_tracking: true,
            streaming: true,
            cancellation: true,
            max_turns: None,
            models: CODEX_MODELS.iter().map(|m| m.to_string()).collect(),
        }
    }

    async fn is_available(&self) -> Availability {
        probe::probe_cli(&self.settings.binary, probe::env_codex_credentials).await
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<ExecuteResult, RunnerError> {
        let invocation = self.invocation(&request);
        let parser = CodexStreamParser::new(self.model(&request));
        self.executor
            .execute(request, invocation, Box::new(parser), cancel)
            .await
    }

    async fn stop(&self, run_id: RunId) -> Result<(), RunnerError> {
        self.executor.stop(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MemorySink;
    use crate::types::{RunProfile, TaskContext};
    use std::sync::Arc;

    fn request() -> ExecuteRequest {
        ExecuteRequest::new(
            RunnerType::Codex,
            "Create file foo.txt",
            "/work/repo",
            Arc::new(MemorySink::new()),
        )
    }

    #[test]
    fn command_line_reads_prompt_from_stdin() {
        let inv = CodexRunner::default().invocation(&request());
        assert_eq!(
            inv.args,
            vec!["exec", "--json", "--sandbox", "workspace-write", "--cd", "/work/repo", "-"]
        );
        assert_eq!(inv.stdin.as_deref(), Some("Create file foo.txt"));
    }

    #[test]
    fn model_flag_precedes_stdin_marker() {
        let req = request().with_profile(RunProfile {
            model: Some("o4-mini".into()),
            ..RunProfile::default()
        });
        let args = CodexRunner::default().invocation(&req).args;
        let n = args.len();
        assert_eq!(&args[n - 3..], ["--model", "o4-mini", "-"]);
    }

    #[test]
    fn task_is_prefixed_to_prompt() {
        let req = request().with_task(TaskContext {
            title: "T1".into(),
            description: Some("Write foo".into()),
        });
        let stdin = CodexRunner::default().invocation(&req).stdin.unwrap();
        assert_eq!(
            stdin,
            "You are working on task: T1\n\nWrite foo\n\nCreate file foo.txt"
        );
    }
}
