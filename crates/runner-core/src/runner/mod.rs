//! Runner adapters for agent CLIs.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!     |
//!     v
//! RunnerRegistry --get(RunnerType::Codex)--> Arc<dyn Runner>
//!     |                                          |
//!     |   execute(request, cancel) --------------+
//!     |        |
//!     |        v
//!     |   CliExecutor: spawn (own process group), stdout/stderr readers
//!     |        |
//!     |        v
//!     |   RunTracker: StreamParser -> RunEmitter -> EventSink
//!     |        |
//!     |        v
//!     |   ExecuteResult { success, exit_code, metrics, summary, ... }
//!     |
//!     |   stop(run_id)   -- same path as cancelling the token
//! ```

pub mod claude_code;
pub mod codex;
pub mod mock;
pub mod opencode;
pub mod probe;
pub mod process;
pub mod tracker;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::{Availability, Capabilities, ExecuteRequest, ExecuteResult, RunId, RunnerType};

pub use claude_code::ClaudeCodeRunner;
pub use codex::CodexRunner;
pub use mock::{MockRunner, MockStep, StubRunner};
pub use opencode::OpenCodeRunner;
pub use process::{CANCELLED_MESSAGE, CliExecutor, CliInvocation, TIMED_OUT_MESSAGE};
pub use tracker::{RunTracker, TrackerOutcome};

/// Upper bound for a single availability probe.
pub const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors returned synchronously from [`Runner::execute`] and
/// [`Runner::stop`]. Everything that happens after the child started is
/// reported through [`ExecuteResult`] instead.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The request or the runner configuration is unusable. No process
    /// was started.
    #[error("invalid run configuration: {0}")]
    Config(String),

    /// The operating system refused to start the CLI.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no active run with id {0}")]
    NotFound(RunId),
}

/// Adapter interface for one agent CLI family.
///
/// # Object Safety
///
/// Object-safe so runners can be stored as `Arc<dyn Runner>` in the
/// [`crate::registry::RunnerRegistry`].
#[async_trait]
pub trait Runner: Send + Sync {
    fn runner_type(&self) -> RunnerType;

    /// Constant self-description.
    fn capabilities(&self) -> Capabilities;

    /// Probe for the backing binary and credentials. Completes within
    /// [`AVAILABILITY_TIMEOUT`].
    async fn is_available(&self) -> Availability;

    /// Run one agent session to completion.
    ///
    /// Events stream through `request.sink` while the call is in flight.
    /// Cancelling `cancel` has the same effect as [`Runner::stop`].
    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<ExecuteResult, RunnerError>;

    /// Request cooperative cancellation of an in-flight run.
    async fn stop(&self, run_id: RunId) -> Result<(), RunnerError>;
}

// Compile-time assertion: Runner must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Runner) {}
};
