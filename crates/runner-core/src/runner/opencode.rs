//! OpenCode runner (`opencode run --format json`).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::codex::framed_prompt;
use super::probe;
use super::process::{CliExecutor, CliInvocation};
use super::{Runner, RunnerError};
use crate::config::CliSettings;
use crate::parser::OpenCodeStreamParser;
use crate::types::{
    Availability, Capabilities, ExecuteRequest, ExecuteResult, RunId, RunnerType,
};

pub struct OpenCodeRunner {
    settings: CliSettings,
    executor: CliExecutor,
}

impl OpenCodeRunner {
    pub fn new(settings: CliSettings) -> Self {
        let executor = CliExecutor::new(RunnerType::OpenCode, settings.grace);
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

    pub fn invocation(&self, request: &ExecuteRequest) -> CliInvocation {
        let mut inv =
            CliInvocation::new(&self.settings.binary).args(["run", "--format", "json"]);
        // OpenCode models are `provider/model`.
        if let Some(model) = self.model(request) {
            inv = inv.arg("--model").arg(model);
        }
        inv.args(self.settings.extra_args.iter().cloned())
            .args(request.profile.extra_args.iter().cloned())
            .stdin(framed_prompt(request))
    }
}

impl std::fmt::Debug for OpenCodeRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenCodeRunner")
            .field("binary", &self.settings.binary)
            .finish()
    }
}

impl Default for OpenCodeRunner {
    fn default() -> Self {
        Self::new(CliSettings::new("opencode"))
    }
}

#[async_trait]
impl Runner for OpenCodeRunner {
    fn runner_type(&self) -> RunnerType {
        RunnerType::OpenCode
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            messages: true,
            tool_events: true,
            cost_tracking: true,
            streaming: true,
            cancellation: true,
            max_turns: None,
            models: Vec::new(),
        }
    }

    async fn is_available(&self) -> Availability {
        // OpenCode resolves provider credentials itself.
        probe::probe_cli(&self.settings.binary, || Ok("managed by opencode".to_string())).await
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<ExecuteResult, RunnerError> {
        let invocation = self.invocation(&request);
        let parser = OpenCodeStreamParser::new(self.model(&request));
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
    use crate::types::RunProfile;
    use std::sync::Arc;

    #[test]
    fn command_line_shape() {
        let runner = OpenCodeRunner::new(
            CliSettings::new("resource-opencode").with_model("anthropic/claude-sonnet-4"),
        );
        let req = ExecuteRequest::new(
            RunnerType::OpenCode,
            "write hello",
            "/tmp",
            Arc::new(MemorySink::new()),
        )
        .with_profile(RunProfile {
            extra_args: vec!["--print-logs".into()],
            ..RunProfile::default()
        });
        let inv = runner.invocation(&req);
        assert_eq!(inv.program, "resource-opencode");
        assert_eq!(
            inv.args,
            vec![
                "run",
                "--format",
                "json",
                "--model",
                "anthropic/claude-sonnet-4",
                "--print-logs"
            ]
        );
        assert_eq!(inv.stdin.as_deref(), Some("write hello"));
    }
}
