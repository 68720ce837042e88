//! Supervisor tuning and the command it keeps alive.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ConfigError, parse_bool_var, parse_millis_var, parse_var};

/// Restart policy and timing for a [`super::Supervisor`].
///
/// Loaded from `SIDECAR_*` variables by [`SupervisorConfig::from_env`];
/// every variable is optional.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Whether the sidecar should be started at all (`SIDECAR_ENABLED`).
    pub enabled: bool,
    /// Unexpected exits tolerated inside `restart_window`.
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// How long a fresh process has to pass its health check.
    pub startup_timeout: Duration,
    /// SIGTERM -> SIGKILL grace on stop.
    pub graceful_stop: Duration,
    /// Pause between health probes during startup.
    pub health_interval: Duration,
    /// Shell command to supervise (`SIDECAR_COMMAND`).
    pub command: Option<String>,
    pub host: String,
    /// Port probed by the TCP health check (`SIDECAR_PORT`).
    pub port: Option<u16>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_restarts: 5,
            restart_window: Duration::from_secs(5 * 60),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            startup_timeout: Duration::from_secs(10),
            graceful_stop: Duration::from_secs(5),
            health_interval: Duration::from_millis(500),
            command: None,
            host: "127.0.0.1".to_string(),
            port: None,
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(enabled) = parse_bool_var(&lookup, "SIDECAR_ENABLED")? {
            config.enabled = enabled;
        }
        if let Some(max) = parse_var(&lookup, "SIDECAR_MAX_RESTARTS")? {
            config.max_restarts = max;
        }
        for (var, slot) in [
            ("SIDECAR_RESTART_WINDOW_MS", &mut config.restart_window),
            ("SIDECAR_INITIAL_BACKOFF_MS", &mut config.initial_backoff),
            ("SIDECAR_MAX_BACKOFF_MS", &mut config.max_backoff),
            ("SIDECAR_STARTUP_TIMEOUT_MS", &mut config.startup_timeout),
            ("SIDECAR_GRACEFUL_STOP_MS", &mut config.graceful_stop),
        ] {
            if let Some(value) = parse_millis_var(&lookup, var)? {
                *slot = value;
            }
        }
        if let Some(multiplier) = parse_var::<f64, F>(&lookup, "SIDECAR_BACKOFF_MULTIPLIER")? {
            if !(multiplier.is_finite() && multiplier > 0.0) {
                return Err(ConfigError::invalid(
                    "SIDECAR_BACKOFF_MULTIPLIER",
                    &multiplier.to_string(),
                    "must be a positive number",
                ));
            }
            config.backoff_multiplier = multiplier;
        }
        config.command = lookup("SIDECAR_COMMAND")
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if let Some(host) = lookup("SIDECAR_HOST").filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        config.port = parse_var(&lookup, "SIDECAR_PORT")?;
        Ok(config)
    }

    /// Delay before respawn attempt `restart` (1-based):
    /// `min(max_backoff, initial_backoff * multiplier^(restart - 1))`.
    pub fn calculate_backoff(&self, restart: u32) -> Duration {
        let exponent = i32::try_from(restart.saturating_sub(1)).unwrap_or(i32::MAX);
        let nanos = self.initial_backoff.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let cap = self.max_backoff.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= cap {
            return self.max_backoff;
        }
        Duration::from_nanos(nanos as u64)
    }
}

/// The command line of the supervised process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Run `command` through `sh -c`.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(command)
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |var| {
            pairs
                .iter()
                .find(|(k, _)| *k == var)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = SupervisorConfig {
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(1),
            ..SupervisorConfig::default()
        };
        let schedule: Vec<Duration> = (1..=6).map(|n| config.calculate_backoff(n)).collect();
        assert_eq!(
            schedule,
            [100, 200, 400, 800, 1000, 1000].map(Duration::from_millis)
        );
    }

    #[test]
    fn backoff_for_zero_is_the_initial_delay() {
        let config = SupervisorConfig::default();
        assert_eq!(config.calculate_backoff(0), Duration::from_secs(1));
        assert_eq!(config.calculate_backoff(1000), config.max_backoff);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = SupervisorConfig::from_lookup(lookup(&[
            ("SIDECAR_ENABLED", "true"),
            ("SIDECAR_MAX_RESTARTS", "2"),
            ("SIDECAR_INITIAL_BACKOFF_MS", "10"),
            ("SIDECAR_BACKOFF_MULTIPLIER", "1.5"),
            ("SIDECAR_COMMAND", "node sidecar.js"),
            ("SIDECAR_PORT", "9222"),
        ]))
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.max_restarts, 2);
        assert_eq!(config.initial_backoff, Duration::from_millis(10));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.command.as_deref(), Some("node sidecar.js"));
        assert_eq!(config.port, Some(9222));
        assert_eq!(config.graceful_stop, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for pairs in [
            &[("SIDECAR_MAX_RESTARTS", "-1")][..],
            &[("SIDECAR_BACKOFF_MULTIPLIER", "0")][..],
            &[("SIDECAR_STARTUP_TIMEOUT_MS", "10s")][..],
            &[("SIDECAR_ENABLED", "sometimes")][..],
        ] {
            let var = pairs[0].0;
            let err = SupervisorConfig::from_lookup(lookup(pairs)).unwrap_err();
            assert!(err.to_string().contains(var), "{err}");
        }
    }

    #[test]
    fn shell_spec_wraps_command() {
        let spec = ProcessSpec::shell("exit 1");
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-c", "exit 1"]);
    }
}
