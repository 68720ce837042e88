//! Availability probes: is the CLI installed, and can it authenticate?

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use super::AVAILABILITY_TIMEOUT;
use crate::types::Availability;

/// Budget for `<binary> --version`, leaving headroom inside the overall
/// availability timeout.
const VERSION_TIMEOUT: Duration = Duration::from_millis(2500);

/// Resolve `binary` on `PATH` (or check it directly when it is a path).
pub fn locate(binary: &str) -> Result<PathBuf, String> {
    which::which(binary).map_err(|e| format!("'{binary}' not found on PATH ({e})"))
}

/// Run `<binary> --version` and return the first line of its output.
pub async fn version(path: &Path) -> Result<String, String> {
    let mut cmd = Command::new(path);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(VERSION_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(format!("failed to run {} --version: {e}", path.display())),
        Err(_) => return Err(format!("{} --version timed out", path.display())),
    };
    if !output.status.success() {
        return Err(format!(
            "{} --version exited with {}",
            path.display(),
            output.status
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("unknown version")
        .to_string())
}

/// Full probe: binary present, `--version` answers, credentials found.
///
/// Never takes longer than [`AVAILABILITY_TIMEOUT`].
pub async fn probe_cli<C>(binary: &str, credentials: C) -> Availability
where
    C: FnOnce() -> Result<String, String>,
{
    let probe = async move {
        let path = match locate(binary) {
            Ok(path) => path,
            Err(reason) => return Availability::unavailable(reason),
        };
        let version = match version(&path).await {
            Ok(version) => version,
            Err(reason) => return Availability::unavailable(reason),
        };
        match credentials() {
            Ok(source) => Availability::available(format!("{version} (credentials: {source})")),
            Err(reason) => Availability::unavailable(format!("{version} installed but {reason}")),
        }
    };
    match tokio::time::timeout(AVAILABILITY_TIMEOUT, probe).await {
        Ok(availability) => availability,
        Err(_) => {
            debug!(binary, "availability probe timed out");
            Availability::unavailable(format!("probing '{binary}' timed out"))
        }
    }
}

// ---------------------------------------------------------------------------
// Credential checks
// ---------------------------------------------------------------------------

fn non_empty<F: Fn(&str) -> Option<String>>(lookup: &F, var: &str) -> bool {
    lookup(var).is_some_and(|v| !v.trim().is_empty())
}

/// Claude Code authenticates with an API key, an OAuth token, or a prior
/// `claude login` (state under `~/.claude`).
pub fn claude_credentials<F>(lookup: F, home: Option<&Path>) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    for var in ["ANTHROPIC_API_KEY", "CLAUDE_CODE_OAUTH_TOKEN"] {
        if non_empty(&lookup, var) {
            return Ok(var.to_string());
        }
    }
    if let Some(dir) = home.map(|h| h.join(".claude")).filter(|d| d.is_dir()) {
        return Ok(dir.display().to_string());
    }
    Err("no Anthropic credentials (set ANTHROPIC_API_KEY or run `claude login`)".to_string())
}

/// Codex authenticates with an API key or `codex login` (`auth.json` under
/// `$CODEX_HOME`, default `~/.codex`).
pub fn codex_credentials<F>(lookup: F, home: Option<&Path>) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    for var in ["OPENAI_API_KEY", "CODEX_API_KEY"] {
        if non_empty(&lookup, var) {
            return Ok(var.to_string());
        }
    }
    let codex_home = lookup("CODEX_HOME")
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .or_else(|| home.map(|h| h.join(".codex")));
    if let Some(auth) = codex_home.map(|d| d.join("auth.json")).filter(|p| p.is_file()) {
        return Ok(auth.display().to_string());
    }
    Err("no OpenAI credentials (set OPENAI_API_KEY or run `codex login`)".to_string())
}

/// Process-environment variants used by the runners.
pub(crate) fn env_claude_credentials() -> Result<String, String> {
    claude_credentials(|v| std::env::var(v).ok(), dirs::home_dir().as_deref())
}

pub(crate) fn env_codex_credentials() -> Result<String, String> {
    codex_credentials(|v| std::env::var(v).ok(), dirs::home_dir().as_deref())
}
