//! CLI execution engine shared by every CLI-backed runner.
//!
//! One `execute` call owns one child process. The child gets its own
//! process group, stdout and stderr are read by two reader tasks that
//! forward whole lines over a bounded channel, and the `execute` future
//! itself is the single dispatcher that feeds those lines to the
//! [`RunTracker`]. The dispatcher also watches for cancellation (caller
//! token, [`CliExecutor::stop`], profile timeout) and for child exit.

use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RunnerError;
use super::tracker::{RunTracker, TrackerOutcome};
use crate::event::{EventData, RunEmitter, StatusEventData};
use crate::parser::StreamParser;
use crate::process::{ExitInfo, Signal, isolate_process_group, signal_group};
use crate::types::{ExecuteRequest, ExecuteResult, RunId, RunnerType};

/// Prefix of `error_message` for runs ended by cancellation or `stop`.
pub const CANCELLED_MESSAGE: &str = "run cancelled";
/// Prefix of `error_message` for runs ended by the profile timeout.
pub const TIMED_OUT_MESSAGE: &str = "run timed out";

/// Time between SIGTERM and SIGKILL unless configured otherwise.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Reader buffer size; tool calls can carry whole files on one line.
pub const READ_BUFFER_BYTES: usize = 1024 * 1024;

/// How long pipes may stay open after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const LINE_CHANNEL_CAPACITY: usize = 256;

/// How many stderr lines are quoted in a failure message.
const STDERR_DETAIL_LINES: usize = 5;

/// A fully assembled command line for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, which is then closed. `None` leaves
    /// stdin attached to `/dev/null`.
    pub stdin: Option<String>,
    /// Adapter-provided environment, applied before the request's own.
    pub env: HashMap<String, String>,
}

impl CliInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

enum StreamLine {
    Stdout(String),
    Stderr(String),
}

#[derive(Debug, Clone, Copy)]
enum StopReason {
    Cancelled,
    TimedOut(Duration),
}

/// Runs CLI invocations for one runner type and tracks which runs are in
/// flight so they can be stopped by id.
pub struct CliExecutor {
    runner_type: RunnerType,
    grace: Duration,
    active: Mutex<HashMap<RunId, CancellationToken>>,
}

/// Removes a run from the active table when `execute` returns.
pub(crate) struct ActiveRun<'a> {
    table: &'a Mutex<HashMap<RunId, CancellationToken>>,
    run_id: RunId,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

impl CliExecutor {
    pub fn new(runner_type: RunnerType, grace: Duration) -> Self {
        Self {
            runner_type,
            grace,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn runner_type(&self) -> RunnerType {
        self.runner_type
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Number of runs currently executing.
    pub fn active_runs(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Cancel an in-flight run. Same effect as cancelling its token.
    pub fn stop(&self, run_id: RunId) -> Result<(), RunnerError> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let token = active.get(&run_id).ok_or(RunnerError::NotFound(run_id))?;
        info!(run_id = %run_id, runner = %self.runner_type, "stop requested");
        token.cancel();
        Ok(())
    }

    /// Reject requests that must not spawn anything.
    pub fn validate(&self, request: &ExecuteRequest) -> Result<(), RunnerError> {
        if request.runner_type != self.runner_type {
            return Err(RunnerError::Config(format!(
                "request targets runner '{}' but was sent to '{}'",
                request.runner_type, self.runner_type
            )));
        }
        if request.prompt.trim().is_empty() {
            return Err(RunnerError::Config("prompt must not be empty".to_string()));
        }
        let dir = &request.working_dir;
        if !dir.is_absolute() {
            return Err(RunnerError::Config(format!(
                "working directory must be absolute: {}",
                dir.display()
            )));
        }
        match std::fs::metadata(dir) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(RunnerError::Config(format!(
                "working directory is not a directory: {}",
                dir.display()
            ))),
            Err(e) => Err(RunnerError::Config(format!(
                "working directory {} is not accessible: {e}",
                dir.display()
            ))),
        }
    }

    /// Record `run_id` as in flight until the returned guard drops.
    pub(crate) fn register(
        &self,
        run_id: RunId,
        token: CancellationToken,
    ) -> Result<ActiveRun<'_>, RunnerError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(&run_id) {
            return Err(RunnerError::Config(format!("run {run_id} is already executing")));
        }
        active.insert(run_id, token);
        Ok(ActiveRun {
            table: &self.active,
            run_id,
        })
    }

    /// Spawn `invocation` for `request` and drive it to completion.
    pub async fn execute(
        &self,
        request: ExecuteRequest,
        invocation: CliInvocation,
        parser: Box<dyn StreamParser>,
        cancel: CancellationToken,
    ) -> Result<ExecuteResult, RunnerError> {
        self.validate(&request)?;
        let ExecuteRequest {
            run_id,
            working_dir,
            env,
            profile,
            sink,
            ..
        } = request;

        let token = cancel.child_token();
        let _active = self.register(run_id, token.clone())?;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&working_dir)
            .envs(&invocation.env)
            .envs(&env)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate_process_group(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RunnerError::Config(format!(
                    "binary '{}' not found -- is it installed and on PATH?",
                    invocation.program
                )));
            }
            Err(source) => {
                return Err(RunnerError::Spawn {
                    program: invocation.program,
                    source,
                });
            }
        };
        let started = Instant::now();
        let pid = child.id();
        info!(
            run_id = %run_id,
            runner = %self.runner_type,
            pid = pid.unwrap_or_default(),
            program = %invocation.program,
            "spawned agent process"
        );

        let stdin_task = match (child.stdin.take(), invocation.stdin) {
            (Some(mut pipe), Some(input)) => Some(tokio::spawn(async move {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    debug!(error = %e, "failed to write prompt to agent stdin");
                }
                // Dropping the pipe closes the child's stdin.
            })),
            _ => None,
        };

        let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone(), StreamLine::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx.clone(), StreamLine::Stderr));
        }
        drop(tx);

        let mut tracker = RunTracker::new(parser, RunEmitter::new(run_id, sink));

        let timeout_at = profile.timeout.map(|t| started + t);
        let mut stop_reason: Option<StopReason> = None;
        let mut kill_at: Option<Instant> = None;
        let mut drain_at: Option<Instant> = None;
        let mut exit: Option<io::Result<ExitStatus>> = None;
        let mut exited_at: Option<Instant> = None;
        let mut lines_open = true;

        while lines_open || exit.is_none() {
            tokio::select! {
                line = rx.recv(), if lines_open => match line {
                    Some(StreamLine::Stdout(line)) => tracker.ingest_stdout(&line),
                    Some(StreamLine::Stderr(line)) => tracker.ingest_stderr(&line),
                    None => lines_open = false,
                },
                status = child.wait(), if exit.is_none() => {
                    let now = Instant::now();
                    exited_at = Some(now);
                    // Grandchildren must not outlive the run.
                    if let Some(pgid) = pid {
                        signal_group(pgid, Signal::Kill).ok();
                    }
                    drain_at = Some(now + DRAIN_TIMEOUT);
                    exit = Some(status);
                }
                _ = token.cancelled(), if stop_reason.is_none() && exit.is_none() => {
                    info!(run_id = %run_id, "cancelling agent process");
                    stop_reason = Some(StopReason::Cancelled);
                    kill_at = Some(self.terminate(&mut child, pid));
                }
                _ = sleep_opt(timeout_at), if stop_reason.is_none() && exit.is_none() => {
                    let limit = profile.timeout.unwrap_or_default();
                    warn!(run_id = %run_id, timeout_ms = limit.as_millis() as u64, "agent run timed out");
                    stop_reason = Some(StopReason::TimedOut(limit));
                    kill_at = Some(self.terminate(&mut child, pid));
                }
                _ = sleep_opt(kill_at), if exit.is_none() => {
                    warn!(run_id = %run_id, "agent ignored SIGTERM, sending SIGKILL");
                    force_kill(&mut child, pid);
                    kill_at = None;
                }
                _ = sleep_opt(drain_at), if lines_open => {
                    // Something outside the group inherited the pipes.
                    warn!(run_id = %run_id, "output pipes still open after exit, abandoning readers");
                    for reader in &readers {
                        reader.abort();
                    }
                    drain_at = None;
                }
            }
        }

        for reader in readers {
            reader.await.ok();
        }
        if let Some(task) = stdin_task {
            task.abort();
            task.await.ok();
        }

        if let Some(reason) = stop_reason {
            let status = match reason {
                StopReason::Cancelled => "cancelled",
                StopReason::TimedOut(_) => "timed_out",
            };
            tracker.emit(EventData::Status(StatusEventData {
                status: status.to_string(),
                message: None,
                metadata: None,
            }));
        }
        let outcome = tracker.finish();

        let duration = exited_at.unwrap_or_else(Instant::now).duration_since(started);
        let (exit_info, wait_error) = match exit {
            Some(Ok(status)) => (Some(ExitInfo::from_status(status)), None),
            Some(Err(e)) => (None, Some(e)),
            None => (None, None),
        };
        let success = stop_reason.is_none()
            && exit_info.is_some_and(|info| info.success())
            && outcome.terminal_seen;
        let error_message = (!success).then(|| {
            failure_message(stop_reason, exit_info, wait_error.as_ref(), &outcome)
        });

        info!(
            run_id = %run_id,
            runner = %self.runner_type,
            success,
            exit = %exit_info.map(|i| i.describe()).unwrap_or_else(|| "unknown".to_string()),
            duration_ms = duration.as_millis() as u64,
            events = outcome.events_emitted,
            "agent process finished"
        );

        Ok(ExecuteResult {
            run_id,
            success,
            exit_code: exit_info.and_then(|i| i.code),
            duration,
            summary: outcome.summary,
            error_message,
            metrics: outcome.metrics,
            cancelled: stop_reason.is_some(),
            events_emitted: outcome.events_emitted,
        })
    }

    /// Send SIGTERM to the run's group and return the SIGKILL deadline.
    fn terminate(&self, child: &mut Child, pid: Option<u32>) -> Instant {
        match pid {
            Some(pgid) => {
                if let Err(e) = signal_group(pgid, Signal::Term) {
                    warn!(pid = pgid, error = %e, "SIGTERM failed, killing directly");
                    child.start_kill().ok();
                }
            }
            None => {
                child.start_kill().ok();
            }
        }
        Instant::now() + self.grace
    }
}

impl std::fmt::Debug for CliExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliExecutor")
            .field("runner_type", &self.runner_type)
            .field("grace", &self.grace)
            .field("active_runs", &self.active_runs())
            .finish()
    }
}

fn force_kill(child: &mut Child, pid: Option<u32>) {
    let signalled = pid.is_some_and(|pgid| signal_group(pgid, Signal::Kill).is_ok());
    if !signalled {
        child.start_kill().ok();
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn spawn_reader<R>(pipe: R, tx: mpsc::Sender<StreamLine>, wrap: fn(String) -> StreamLine) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(wrap(line)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "error reading agent output");
                    break;
                }
            }
        }
    })
}

fn failure_message(
    stop_reason: Option<StopReason>,
    exit_info: Option<ExitInfo>,
    wait_error: Option<&io::Error>,
    outcome: &TrackerOutcome,
) -> String {
    match stop_reason {
        Some(StopReason::Cancelled) => return CANCELLED_MESSAGE.to_string(),
        Some(StopReason::TimedOut(limit)) => return format!("{TIMED_OUT_MESSAGE} after {limit:?}"),
        None => {}
    }

    let mut message = match (wait_error, exit_info) {
        (Some(e), _) => format!("failed to wait for agent process: {e}"),
        (None, Some(info)) if !info.success() => format!("agent process {}", info.describe()),
        _ => "agent process exited without a completion event".to_string(),
    };

    let stderr_detail = || {
        let tail = &outcome.stderr_tail;
        let from = tail.len().saturating_sub(STDERR_DETAIL_LINES);
        let joined = tail[from..].join("\n");
        (!joined.is_empty()).then_some(joined)
    };
    if let Some(detail) = outcome.last_error.clone().or_else(stderr_detail) {
        message.push_str(": ");
        message.push_str(&detail);
    }
    message
}
