//! Runner settings resolved from the environment.
//!
//! | Variable                        | Default    |
//! |---------------------------------|------------|
//! | `AGENT_RUNNER_CLAUDE_BIN`       | `claude`   |
//! | `AGENT_RUNNER_CODEX_BIN`        | `codex`    |
//! | `AGENT_RUNNER_OPENCODE_BIN`     | `opencode` |
//! | `AGENT_RUNNER_CLAUDE_MODEL` etc.| unset      |
//! | `AGENT_RUNNER_CLAUDE_MAX_TURNS` | unset      |
//! | `AGENT_RUNNER_GRACE_MS`         | `5000`     |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runner::process::DEFAULT_GRACE;

/// A configuration value could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(var: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var: var.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Read and parse an optional variable through `lookup`.
///
/// Unset and blank values are `Ok(None)`.
pub fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::invalid(var, &raw, e.to_string()))
}

/// Parse a boolean the way shells spell them.
pub fn parse_bool_var<F>(lookup: &F, var: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::invalid(var, &raw, "expected a boolean")),
    }
}

/// Parse a millisecond duration.
pub fn parse_millis_var<F>(lookup: &F, var: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_var::<u64, F>(lookup, var)?.map(Duration::from_millis))
}

fn string_var<F: Fn(&str) -> Option<String>>(lookup: &F, var: &str) -> Option<String> {
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Per-runner settings
// ---------------------------------------------------------------------------

/// Settings for one CLI-backed runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliSettings {
    /// Binary name (looked up on `PATH`) or path.
    pub binary: String,
    /// Model used when the run profile does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Turn limit used when the run profile does not set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Arguments appended to every invocation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    /// SIGTERM -> SIGKILL grace period.
    #[serde(with = "duration_ms", rename = "grace_ms")]
    pub grace: Duration,
}

impl CliSettings {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            default_model: None,
            max_turns: None,
            extra_args: Vec::new(),
            grace: DEFAULT_GRACE,
        }
    }

    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

/// Settings for every CLI runner the registry knows how to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSettings {
    pub claude: CliSettings,
    pub codex: CliSettings,
    pub opencode: CliSettings,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            claude: CliSettings::new("claude"),
            codex: CliSettings::new("codex"),
            opencode: CliSettings::new("opencode"),
        }
    }
}

impl RunnerSettings {
    /// Resolve settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let grace = parse_millis_var(&lookup, "AGENT_RUNNER_GRACE_MS")?;

        for (prefix, cli) in [
            ("CLAUDE", &mut settings.claude),
            ("CODEX", &mut settings.codex),
            ("OPENCODE", &mut settings.opencode),
        ] {
            if let Some(binary) = string_var(&lookup, &format!("AGENT_RUNNER_{prefix}_BIN")) {
                cli.binary = binary;
            }
            cli.default_model = string_var(&lookup, &format!("AGENT_RUNNER_{prefix}_MODEL"));
            cli.max_turns = parse_var(&lookup, &format!("AGENT_RUNNER_{prefix}_MAX_TURNS"))?;
            if let Some(grace) = grace {
                cli.grace = grace;
            }
        }
        Ok(settings)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
