//! Configuration file management for agent-runner.
//!
//! Provides a TOML config file at `~/.config/agent-runner/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.
//!
//! File values are fed through the same variable lookup the core uses for
//! the environment, behind the real environment, so every setting has one
//! parser and one precedence rule.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use runner_core::config::RunnerSettings;
use runner_core::supervisor::SupervisorConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub claude: RunnerSection,
    pub codex: RunnerSection,
    pub opencode: RunnerSection,
    pub sidecar: SidecarSection,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    /// Binary name or path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Shell command line of the supervised process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graceful_stop_ms: Option<u64>,
}

impl ConfigFile {
    /// The file written by `agent-runner init`: every runner's default
    /// binary spelled out so it is easy to edit.
    pub fn starter() -> Self {
        let defaults = RunnerSettings::default();
        let section = |binary: &str| RunnerSection {
            binary: Some(binary.to_string()),
            ..RunnerSection::default()
        };
        Self {
            claude: section(&defaults.claude.binary),
            codex: section(&defaults.codex.binary),
            opencode: section(&defaults.opencode.binary),
            sidecar: SidecarSection::default(),
        }
    }

    /// Flatten the file into the variable names the core reads.
    pub fn to_vars(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        let mut put = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                vars.insert(name.to_string(), value);
            }
        };

        for (prefix, section) in [
            ("CLAUDE", &self.claude),
            ("CODEX", &self.codex),
            ("OPENCODE", &self.opencode),
        ] {
            put(&format!("AGENT_RUNNER_{prefix}_BIN"), section.binary.clone());
            put(&format!("AGENT_RUNNER_{prefix}_MODEL"), section.model.clone());
            put(
                &format!("AGENT_RUNNER_{prefix}_MAX_TURNS"),
                section.max_turns.map(|n| n.to_string()),
            );
        }

        let s = &self.sidecar;
        put("SIDECAR_ENABLED", s.enabled.map(|b| b.to_string()));
        put("SIDECAR_COMMAND", s.command.clone());
        put("SIDECAR_HOST", s.host.clone());
        put("SIDECAR_PORT", s.port.map(|p| p.to_string()));
        put("SIDECAR_MAX_RESTARTS", s.max_restarts.map(|n| n.to_string()));
        put("SIDECAR_RESTART_WINDOW_MS", s.restart_window_ms.map(|n| n.to_string()));
        put("SIDECAR_INITIAL_BACKOFF_MS", s.initial_backoff_ms.map(|n| n.to_string()));
        put("SIDECAR_MAX_BACKOFF_MS", s.max_backoff_ms.map(|n| n.to_string()));
        put("SIDECAR_BACKOFF_MULTIPLIER", s.backoff_multiplier.map(|n| n.to_string()));
        put("SIDECAR_STARTUP_TIMEOUT_MS", s.startup_timeout_ms.map(|n| n.to_string()));
        put("SIDECAR_GRACEFUL_STOP_MS", s.graceful_stop_ms.map(|n| n.to_string()));
        vars
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the agent-runner config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/agent-runner` or
/// `~/.config/agent-runner`, also on macOS.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("agent-runner");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("agent-runner")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load the config file. A missing file is `Ok(None)`; an unreadable or
/// malformed one is an error.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(path)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, before per-command flags are applied.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub runners: RunnerSettings,
    pub sidecar: SupervisorConfig,
}

impl RunnerConfig {
    /// Resolve from the process environment and the config file.
    pub fn resolve() -> Result<Self> {
        let file = load_config()?;
        Self::from_sources(|var| std::env::var(var).ok(), file.as_ref())
    }

    /// Resolve with `env` taking precedence over `file`.
    pub fn from_sources<F>(env: F, file: Option<&ConfigFile>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file_vars = file.map(ConfigFile::to_vars).unwrap_or_default();
        let lookup = |var: &str| env(var).or_else(|| file_vars.get(var).cloned());

        let runners = RunnerSettings::from_lookup(lookup).context("invalid runner settings")?;
        let sidecar = SupervisorConfig::from_lookup(lookup).context("invalid sidecar settings")?;
        Ok(Self { runners, sidecar })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = RunnerConfig::from_sources(env_of(&[]), None).unwrap();
        assert_eq!(config.runners, RunnerSettings::default());
        assert_eq!(config.sidecar.max_restarts, 5);
        assert!(config.sidecar.command.is_none());
    }

    #[test]
    fn file_values_apply_when_env_is_silent() {
        let file = ConfigFile {
            codex: RunnerSection {
                binary: Some("/opt/codex".into()),
                model: Some("o4-mini".into()),
                max_turns: None,
            },
            sidecar: SidecarSection {
                command: Some("node server.js".into()),
                port: Some(4096),
                initial_backoff_ms: Some(250),
                ..SidecarSection::default()
            },
            ..ConfigFile::default()
        };
        let config = RunnerConfig::from_sources(env_of(&[]), Some(&file)).unwrap();
        assert_eq!(config.runners.codex.binary, "/opt/codex");
        assert_eq!(config.runners.codex.default_model.as_deref(), Some("o4-mini"));
        assert_eq!(config.runners.claude.binary, "claude");
        assert_eq!(config.sidecar.command.as_deref(), Some("node server.js"));
        assert_eq!(config.sidecar.port, Some(4096));
        assert_eq!(config.sidecar.initial_backoff, Duration::from_millis(250));
    }

    #[test]
    fn env_overrides_config_file() {
        let file = ConfigFile {
            claude: RunnerSection {
                binary: Some("/from/file".into()),
                ..RunnerSection::default()
            },
            sidecar: SidecarSection {
                port: Some(1),
                ..SidecarSection::default()
            },
            ..ConfigFile::default()
        };
        let env = env_of(&[
            ("AGENT_RUNNER_CLAUDE_BIN", "/from/env"),
            ("SIDECAR_PORT", "2"),
        ]);
        let config = RunnerConfig::from_sources(env, Some(&file)).unwrap();
        assert_eq!(config.runners.claude.binary, "/from/env");
        assert_eq!(config.sidecar.port, Some(2));
    }

    #[test]
    fn invalid_file_value_names_the_setting() {
        let file = ConfigFile {
            sidecar: SidecarSection {
                backoff_multiplier: Some(-1.0),
                ..SidecarSection::default()
            },
            ..ConfigFile::default()
        };
        let err = RunnerConfig::from_sources(env_of(&[]), Some(&file)).unwrap_err();
        assert!(format!("{err:#}").contains("SIDECAR_BACKOFF_MULTIPLIER"), "{err:#}");
    }

    #[test]
    fn starter_file_parses_back() {
        let starter = ConfigFile::starter();
        let text = toml::to_string_pretty(&starter).unwrap();
        assert!(text.contains("[claude]"));
        assert!(text.contains("binary = \"codex\""));
        let parsed: ConfigFile = toml::from_str(&text).unwrap();
        assert_eq!(parsed, starter);
    }

    #[test]
    fn partial_file_parses_with_defaults() {
        let parsed: ConfigFile = toml::from_str("[sidecar]\nport = 8080\n").unwrap();
        assert_eq!(parsed.sidecar.port, Some(8080));
        assert_eq!(parsed.claude, RunnerSection::default());
    }

    #[cfg(unix)]
    #[test]
    fn save_and_load_under_xdg_config_home() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };

        let missing = load_config();
        let path = save_config(&ConfigFile::starter());
        let loaded = load_config();

        // Restore env before asserting, to avoid poisoning the mutex on failure.
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        assert!(missing.unwrap().is_none());
        let path = path.unwrap();
        assert_eq!(path, tmp.path().join("agent-runner").join("config.toml"));
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(loaded.unwrap(), Some(ConfigFile::starter()));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("agent-runner");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.toml"), "[sidecar\nport = ").unwrap();

        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
        let result = load_config();
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("failed to parse config file"), "{msg}");
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("agent-runner/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
