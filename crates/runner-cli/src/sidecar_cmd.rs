//! `agent-runner sidecar`: supervise a companion server in the foreground.
//!
//! State changes are printed to stdout as JSON lines until Ctrl-C or until
//! the supervisor gives up.

use std::sync::Arc;

use anyhow::{Context, Result, bail};

use runner_core::supervisor::{
    AlwaysHealthy, HealthChecker, ProcessSpec, Supervisor, SupervisorConfig, SupervisorState,
    TcpHealthCheck,
};

use crate::config::RunnerConfig;

#[derive(Debug, Clone, Default)]
pub struct SidecarOptions {
    pub command: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Apply flags over the resolved sidecar config. A `--command` flag
/// enables the sidecar even when the config leaves it disabled.
pub fn sidecar_config(config: &RunnerConfig, options: &SidecarOptions) -> Result<SupervisorConfig> {
    let mut sidecar = config.sidecar.clone();
    if let Some(command) = &options.command {
        sidecar.command = Some(command.clone());
        sidecar.enabled = true;
    }
    if let Some(host) = &options.host {
        sidecar.host = host.clone();
    }
    if options.port.is_some() {
        sidecar.port = options.port;
    }

    if !sidecar.enabled {
        bail!("sidecar is disabled; set SIDECAR_ENABLED=true or pass --command");
    }
    if sidecar.command.is_none() {
        bail!("no sidecar command; set SIDECAR_COMMAND or pass --command");
    }
    Ok(sidecar)
}

/// Health check matching the config: TCP when a port is known.
pub fn health_checker(config: &SupervisorConfig) -> Arc<dyn HealthChecker> {
    match config.port {
        Some(port) => Arc::new(TcpHealthCheck::new(&config.host, port)),
        None => Arc::new(AlwaysHealthy),
    }
}

/// Run the sidecar until interrupted. Returns the process exit code.
pub async fn run_sidecar(config: &RunnerConfig, options: SidecarOptions) -> Result<i32> {
    let sidecar = sidecar_config(config, &options)?;
    let command = sidecar.command.clone().unwrap_or_default();
    let health = health_checker(&sidecar);

    let supervisor = Supervisor::new(ProcessSpec::shell(&command), sidecar, health);
    let mut changes = supervisor.subscribe();

    tracing::info!(%command, "starting sidecar");
    if let Err(e) = supervisor.start().await {
        while let Some(change) = changes.try_recv() {
            print_change(&change)?;
        }
        supervisor.stop().await;
        return Err(e).context("sidecar failed to start");
    }

    let code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupt received, stopping sidecar");
                break 0;
            }
            change = changes.recv() => match change {
                Some(change) => {
                    print_change(&change)?;
                    if change.current == SupervisorState::Unrecoverable {
                        eprintln!("sidecar crashed too often; giving up");
                        break 1;
                    }
                }
                None => break 0,
            },
        }
    };

    supervisor.stop().await;
    while let Some(change) = changes.recv().await {
        print_change(&change)?;
    }
    Ok(code)
}

fn print_change(change: &runner_core::supervisor::StateChange) -> Result<()> {
    println!("{}", serde_json::to_string(change).context("failed to serialize state change")?);
    Ok(())
}
