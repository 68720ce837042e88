//! Companion-process supervisor.
//!
//! Keeps one long-lived helper process (for example a browser automation
//! sidecar) alive: spawn, health-gate, restart on crash with exponential
//! backoff, and give up once the restart budget for the sliding window is
//! spent.
//!
//! ```text
//! stopped       -> starting        start()
//! starting      -> running         health check passed
//! starting      -> stopped         health check failed / timed out
//! running       -> restarting      process exited
//! restarting    -> starting        backoff elapsed
//! restarting    -> unrecoverable   restart budget exhausted
//! unrecoverable -> starting        restart()
//! *             -> stopping        stop()
//! stopping      -> stopped         process gone
//! ```
//!
//! One monitor task per start owns the child from spawn to exit. State and
//! restart history live behind one mutex, subscribers behind another, and
//! subscribers are only notified after the state lock is released.

pub mod config;
pub mod health;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::process::{ExitInfo, isolate_process_group, terminate_gracefully};

pub use config::{ProcessSpec, SupervisorConfig};
pub use health::{AlwaysHealthy, HealthChecker, TcpHealthCheck};

/// Buffer of each subscription; a full buffer drops the event for that
/// subscriber only.
pub const SUBSCRIPTION_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Unrecoverable,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Restarting => "restarting",
            Self::Unrecoverable => "unrecoverable",
        }
    }

    /// Whether `from -> to` is an edge of the supervisor state graph.
    pub fn is_valid_transition(from: SupervisorState, to: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (from, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Restarting)
                | (Restarting, Starting)
                | (Restarting, Unrecoverable)
                | (Unrecoverable, Starting)
                | (Starting | Running | Restarting | Unrecoverable, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub previous: SupervisorState,
    pub current: SupervisorState,
    /// Restarts inside the window at the time of the transition.
    pub restart_count: usize,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor is already running")]
    AlreadyRunning,

    #[error("supervisor has been shut down")]
    ShutDown,

    #[error("supervised process is unrecoverable; call restart()")]
    Unrecoverable,

    #[error("invalid state transition: {from} -> {to}")]
    InvalidState {
        from: SupervisorState,
        to: SupervisorState,
    },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("health check failed: {0}")]
    HealthCheck(String),
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Receiver of [`StateChange`]s. Yields `None` once unsubscribed or after
/// the supervisor's final stop.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<StateChange>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<StateChange> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StateChange> {
        self.receiver.try_recv().ok()
    }

    pub fn into_stream(self) -> tokio_stream::wrappers::ReceiverStream<StateChange> {
        tokio_stream::wrappers::ReceiverStream::new(self.receiver)
    }
}

#[derive(Default)]
struct Subscribers {
    senders: HashMap<u64, mpsc::Sender<StateChange>>,
    closed: bool,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Session {
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
}

struct Core {
    state: SupervisorState,
    restarts: VecDeque<Instant>,
    session: Option<Session>,
    shut_down: bool,
    pid: Option<u32>,
}

struct Inner {
    spec: ProcessSpec,
    config: SupervisorConfig,
    health: Arc<dyn HealthChecker>,
    core: Mutex<Core>,
    subscribers: Mutex<Subscribers>,
    next_subscriber: AtomicU64,
}

/// Keeps a [`ProcessSpec`] running according to a [`SupervisorConfig`].
pub struct Supervisor {
    inner: Arc<Inner>,
}

enum Gate {
    Healthy,
    Failed(String),
    Cancelled,
}

impl Supervisor {
    pub fn new(spec: ProcessSpec, config: SupervisorConfig, health: Arc<dyn HealthChecker>) -> Self {
        Self {
            inner: Arc::new(Inner {
                spec,
                config,
                health,
                core: Mutex::new(Core {
                    state: SupervisorState::Stopped,
                    restarts: VecDeque::new(),
                    session: None,
                    shut_down: false,
                    pid: None,
                }),
                subscribers: Mutex::new(Subscribers::default()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.core().state
    }

    /// Restarts recorded inside the sliding window.
    pub fn restart_count(&self) -> usize {
        let core = self.inner.core();
        count_in_window(&core.restarts, self.inner.config.restart_window)
    }

    /// PID of the current process, if one is alive.
    pub fn pid(&self) -> Option<u32> {
        self.inner.core().pid
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn calculate_backoff(&self, restart: u32) -> Duration {
        self.inner.config.calculate_backoff(restart)
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut subs = self.inner.subscribers();
        // After the final stop the sender is dropped at once.
        if !subs.closed {
            subs.senders.insert(id, tx);
        }
        Subscription { id, receiver }
    }

    /// Close and forget a subscription.
    pub fn unsubscribe(&self, id: u64) {
        self.inner.subscribers().senders.remove(&id);
    }

    /// Spawn the process and wait until it passes its health check.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let from = {
            let core = self.inner.core();
            if core.shut_down {
                return Err(SupervisorError::ShutDown);
            }
            match core.state {
                SupervisorState::Stopped => SupervisorState::Stopped,
                SupervisorState::Unrecoverable => return Err(SupervisorError::Unrecoverable),
                _ => return Err(SupervisorError::AlreadyRunning),
            }
        };
        self.launch(from).await
    }

    /// Clear the restart budget and start again. Works from any state
    /// short of the final stop; a live process is stopped first.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let session = {
            let mut core = self.inner.core();
            if core.shut_down {
                return Err(SupervisorError::ShutDown);
            }
            core.session.take()
        };
        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(e) = session.monitor.await {
                warn!(error = %e, "supervisor monitor task failed");
            }
        }

        let from = {
            let mut core = self.inner.core();
            core.restarts.clear();
            core.state
        };
        info!(program = %self.inner.spec.program, "manual restart");
        self.launch(from).await
    }

    /// Stop the process and shut the supervisor down for good.
    ///
    /// A second call is a no-op. Every subscription is closed afterwards.
    pub async fn stop(&self) {
        let session = {
            let mut core = self.inner.core();
            if core.shut_down && core.session.is_none() {
                return;
            }
            core.shut_down = true;
            core.session.take()
        };
        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(e) = session.monitor.await {
                warn!(error = %e, "supervisor monitor task failed");
            }
        }
        // Unrecoverable has no monitor left to walk it down.
        if self
            .inner
            .transition(SupervisorState::Unrecoverable, SupervisorState::Stopping, None)
        {
            self.inner
                .transition(SupervisorState::Stopping, SupervisorState::Stopped, None);
        }

        let mut subs = self.inner.subscribers();
        subs.closed = true;
        subs.senders.clear();
    }

    /// Move `from -> starting`, hand the work to a fresh monitor task and
    /// wait for its first health verdict.
    async fn launch(&self, from: SupervisorState) -> Result<(), SupervisorError> {
        let to = SupervisorState::Starting;
        if !SupervisorState::is_valid_transition(from, to) {
            return Err(SupervisorError::InvalidState { from, to });
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let first = {
            let mut core = self.inner.core();
            // A monitor that already returned leaves its session behind.
            if core.session.as_ref().is_some_and(|s| s.monitor.is_finished()) {
                core.session = None;
            }
            if core.state != from || core.session.is_some() {
                return Err(SupervisorError::AlreadyRunning);
            }
            core.state = to;
            let first = self.inner.change(&core, from, to, None);
            let cancel = CancellationToken::new();
            let monitor = tokio::spawn(Inner::monitor(
                self.inner.clone(),
                cancel.clone(),
                ready_tx,
                first.clone(),
            ));
            core.session = Some(Session { cancel, monitor });
            first
        };
        debug!(previous = %first.previous, "launch handed to monitor");

        ready_rx.await.unwrap_or_else(|_| {
            Err(SupervisorError::HealthCheck(
                "monitor ended before startup completed".to_string(),
            ))
        })
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // The monitor would otherwise keep the process alive detached.
        if let Some(session) = &self.inner.core().session {
            session.cancel.cancel();
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("program", &self.inner.spec.program)
            .field("state", &self.state())
            .field("restart_count", &self.restart_count())
            .finish()
    }
}

fn count_in_window(restarts: &VecDeque<Instant>, window: Duration) -> usize {
    match Instant::now().checked_sub(window) {
        Some(cutoff) => restarts.iter().filter(|at| **at >= cutoff).count(),
        None => restarts.len(),
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn change(
        &self,
        core: &Core,
        previous: SupervisorState,
        current: SupervisorState,
        error: Option<String>,
    ) -> StateChange {
        StateChange {
            previous,
            current,
            restart_count: count_in_window(&core.restarts, self.config.restart_window),
            error,
            at: Utc::now(),
        }
    }

    /// Apply `from -> to` if the supervisor is still in `from`, then notify.
    fn transition(&self, from: SupervisorState, to: SupervisorState, error: Option<String>) -> bool {
        if !SupervisorState::is_valid_transition(from, to) {
            warn!(%from, %to, "refusing invalid supervisor transition");
            return false;
        }
        let change = {
            let mut core = self.core();
            if core.state != from {
                debug!(expected = %from, actual = %core.state, %to, "stale supervisor transition skipped");
                return false;
            }
            core.state = to;
            self.change(&core, from, to, error)
        };
        self.notify(change);
        true
    }

    fn notify(&self, change: StateChange) {
        info!(
            program = %self.spec.program,
            from = %change.previous,
            to = %change.current,
            restarts = change.restart_count,
            error = change.error.as_deref().unwrap_or(""),
            "supervisor state changed"
        );
        let mut subs = self.subscribers();
        subs.senders.retain(|id, tx| match tx.try_send(change.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber = id, "subscriber lagging, dropping state change");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Push a restart timestamp, prune the window and return the count.
    fn record_restart(&self) -> usize {
        let mut core = self.core();
        let now = Instant::now();
        core.restarts.push_back(now);
        if let Some(cutoff) = now.checked_sub(self.config.restart_window) {
            while core.restarts.front().is_some_and(|at| *at < cutoff) {
                core.restarts.pop_front();
            }
        }
        core.restarts.len()
    }

    fn set_pid(&self, pid: Option<u32>) {
        self.core().pid = pid;
    }

    fn spawn(&self) -> Result<Child, SupervisorError> {
        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }
        isolate_process_group(&mut cmd);
        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.spec.program.clone(),
            source,
        })?;
        info!(program = %self.spec.program, pid = child.id().unwrap_or_default(), "spawned supervised process");
        self.set_pid(child.id());
        Ok(child)
    }

    /// Poll the health check until it passes, the process dies, the startup
    /// timeout elapses, or the session is cancelled.
    async fn health_gate(&self, child: &mut Child, cancel: &CancellationToken) -> Gate {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        let mut last_error = String::from("no health check completed");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Gate::Cancelled,
                status = child.wait() => {
                    return Gate::Failed(exit_description("process exited during startup", status));
                }
                result = tokio::time::timeout_at(deadline, self.health.check()) => match result {
                    Ok(Ok(())) => return Gate::Healthy,
                    Ok(Err(e)) => last_error = format!("{e:#}"),
                    Err(_) => break,
                },
            }
            tokio::select! {
                _ = cancel.cancelled() => return Gate::Cancelled,
                status = child.wait() => {
                    return Gate::Failed(exit_description("process exited during startup", status));
                }
                _ = tokio::time::sleep(self.config.health_interval) => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        Gate::Failed(format!(
            "not healthy within {:?}: {last_error}",
            self.config.startup_timeout
        ))
    }

    /// SIGTERM, wait `graceful_stop`, SIGKILL; then settle in `stopped`.
    async fn shut_child(&self, child: &mut Child, from: SupervisorState) {
        self.transition(from, SupervisorState::Stopping, None);
        if let Err(e) = terminate_gracefully(child, self.config.graceful_stop).await {
            warn!(program = %self.spec.program, error = %e, "failed to stop supervised process");
        }
        self.set_pid(None);
        self.transition(SupervisorState::Stopping, SupervisorState::Stopped, None);
    }

    async fn monitor(
        self: Arc<Self>,
        cancel: CancellationToken,
        ready: oneshot::Sender<Result<(), SupervisorError>>,
        first: StateChange,
    ) {
        // Sent from here so it precedes everything the monitor reports.
        self.notify(first);
        let mut ready = Some(ready);
        let mut report = |result: Result<(), SupervisorError>| {
            if let Some(tx) = ready.take() {
                tx.send(result).ok();
            }
        };

        loop {
            // ---- starting ---------------------------------------------------
            let mut child = match self.spawn() {
                Ok(child) => child,
                Err(e) => {
                    self.transition(
                        SupervisorState::Starting,
                        SupervisorState::Stopped,
                        Some(e.to_string()),
                    );
                    report(Err(e));
                    return;
                }
            };
            match self.health_gate(&mut child, &cancel).await {
                Gate::Healthy => {
                    self.transition(SupervisorState::Starting, SupervisorState::Running, None);
                    report(Ok(()));
                }
                Gate::Failed(reason) => {
                    warn!(program = %self.spec.program, %reason, "supervised process failed to start");
                    terminate_gracefully(&mut child, self.config.graceful_stop).await.ok();
                    self.set_pid(None);
                    self.transition(
                        SupervisorState::Starting,
                        SupervisorState::Stopped,
                        Some(reason.clone()),
                    );
                    report(Err(SupervisorError::HealthCheck(reason)));
                    return;
                }
                Gate::Cancelled => {
                    self.shut_child(&mut child, SupervisorState::Starting).await;
                    report(Err(SupervisorError::ShutDown));
                    return;
                }
            }

            // ---- running ----------------------------------------------------
            let status = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    self.shut_child(&mut child, SupervisorState::Running).await;
                    return;
                }
            };
            self.set_pid(None);
            let description = exit_description("process exited", status);
            let restarts = self.record_restart();
            warn!(program = %self.spec.program, restarts, "{description}");
            self.transition(
                SupervisorState::Running,
                SupervisorState::Restarting,
                Some(description),
            );

            // ---- restarting -------------------------------------------------
            if restarts > self.config.max_restarts as usize {
                self.transition(
                    SupervisorState::Restarting,
                    SupervisorState::Unrecoverable,
                    Some(format!(
                        "restart budget exhausted: {restarts} restarts within {:?}",
                        self.config.restart_window
                    )),
                );
                return;
            }
            let delay = self
                .config
                .calculate_backoff(u32::try_from(restarts).unwrap_or(u32::MAX));
            debug!(delay_ms = delay.as_millis() as u64, "backing off before respawn");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    self.transition(SupervisorState::Restarting, SupervisorState::Stopping, None);
                    self.transition(SupervisorState::Stopping, SupervisorState::Stopped, None);
                    return;
                }
            }
            self.transition(SupervisorState::Restarting, SupervisorState::Starting, None);
        }
    }
}

fn exit_description(prefix: &str, status: std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) => format!("{prefix}: {}", ExitInfo::from_status(status).describe()),
        Err(e) => format!("{prefix}: wait failed: {e}"),
    }
}
