//! Process and stream management core for AI coding-agent CLIs.
//!
//! Spawns Claude Code, Codex and OpenCode as child processes, normalizes
//! their JSON-lines output into one [`event::RunEvent`] stream, tracks
//! per-run metrics, and supervises long-lived companion processes.

pub mod config;
pub mod event;
pub mod parser;
pub mod process;
pub mod registry;
pub mod runner;
pub mod supervisor;
pub mod types;

pub use config::{CliSettings, ConfigError, RunnerSettings};
pub use event::{EventData, EventSink, EventType, RunEvent};
pub use registry::{RegistryError, RunnerRegistry};
pub use runner::{Runner, RunnerError};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError, SupervisorState};
pub use types::{
    Availability, Capabilities, ExecuteRequest, ExecuteResult, ExecutionMetrics, RunId,
    RunnerType,
};
