//! `agent-runner run`: one agent session, events as JSON lines on stdout.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use runner_core::event::JsonLinesSink;
use runner_core::registry::RunnerRegistry;
use runner_core::runner::{MockRunner, Runner};
use runner_core::types::{ExecuteRequest, ExecuteResult, RunId, RunProfile, RunnerType, TaskContext};

use crate::config::RunnerConfig;

/// Exit code after an interrupted run, as a shell reports SIGINT.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Everything `run` accepts on the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub runner: Option<RunnerType>,
    /// Prompt text; `-` or absent reads stdin.
    pub prompt: Option<String>,
    pub prompt_file: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub binary: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub allowed_tools: Vec<String>,
    pub extra_args: Vec<String>,
    pub env: Vec<String>,
    pub task_title: Option<String>,
    pub task_description: Option<String>,
    pub run_id: Option<String>,
}

/// Execute the `run` command and return the process exit code.
pub async fn run_agent(config: RunnerConfig, options: RunOptions) -> Result<i32> {
    let runner_type = options
        .runner
        .context("no runner given; pass --runner (claude-code, codex, opencode or mock)")?;
    let runner = build_runner(&config, runner_type, options.binary.as_deref())?;

    let prompt = read_prompt(&options)?;
    let working_dir = resolve_working_dir(options.cwd.as_deref())?;
    let env = parse_env_pairs(&options.env)?;

    let sink = Arc::new(JsonLinesSink::new(std::io::stdout()));
    let mut request = ExecuteRequest::new(runner_type, prompt, working_dir, sink)
        .with_profile(RunProfile {
            name: None,
            model: options.model.clone(),
            max_turns: options.max_turns,
            allowed_tools: options.allowed_tools.clone(),
            extra_args: options.extra_args.clone(),
            timeout: options.timeout_secs.map(Duration::from_secs),
        });
    for (key, value) in env {
        request = request.with_env(key, value);
    }
    if let Some(id) = &options.run_id {
        let run_id: RunId = id.parse().with_context(|| format!("invalid run id: {id}"))?;
        request = request.with_run_id(run_id);
    }
    if let Some(title) = &options.task_title {
        request = request.with_task(TaskContext {
            title: title.clone(),
            description: options.task_description.clone(),
        });
    }

    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    let watcher = tokio::spawn(watch_interrupts(cancel.clone(), interrupted.clone()));

    tracing::info!(runner = %runner_type, run_id = %request.run_id, "starting run");
    let outcome = runner.execute(request, cancel).await;
    watcher.abort();

    let result = outcome.context("run could not be started")?;
    print_result(&result)?;

    if interrupted.load(Ordering::SeqCst) {
        return Ok(EXIT_INTERRUPTED);
    }
    Ok(exit_code_for(&result))
}

/// First Ctrl-C cancels the run; a second one exits immediately.
async fn watch_interrupts(cancel: CancellationToken, interrupted: Arc<AtomicBool>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    interrupted.store(true, Ordering::SeqCst);
    eprintln!("interrupt received, stopping the agent (press Ctrl-C again to force)");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("forced exit");
        std::process::exit(EXIT_INTERRUPTED);
    }
}

pub fn exit_code_for(result: &ExecuteResult) -> i32 {
    if result.success { 0 } else { 1 }
}

fn print_result(result: &ExecuteResult) -> Result<()> {
    let json = serde_json::to_string(result).context("failed to serialize run result")?;
    println!("{json}");
    Ok(())
}

/// The runner for `runner_type`, with `binary` overriding the configured
/// one.
pub fn build_runner(
    config: &RunnerConfig,
    runner_type: RunnerType,
    binary: Option<&str>,
) -> Result<Arc<dyn Runner>> {
    let mut settings = config.runners.clone();
    let slot = match runner_type {
        RunnerType::Mock => return Ok(Arc::new(MockRunner::scripted_success("mock run complete"))),
        RunnerType::ClaudeCode => &mut settings.claude,
        RunnerType::Codex => &mut settings.codex,
        RunnerType::OpenCode => &mut settings.opencode,
    };
    if let Some(binary) = binary {
        slot.binary = binary.to_string();
    }
    RunnerRegistry::with_defaults(&settings)
        .get(runner_type)
        .map_err(Into::into)
}

fn read_prompt(options: &RunOptions) -> Result<String> {
    let prompt = match (&options.prompt_file, options.prompt.as_deref()) {
        (Some(path), _) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt file {}", path.display()))?,
        (None, Some(text)) if text != "-" => text.to_string(),
        (None, _) => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read prompt from stdin")?;
            buf
        }
    };
    if prompt.trim().is_empty() {
        bail!("prompt is empty");
    }
    Ok(prompt)
}

/// Absolute form of `cwd`, defaulting to the current directory.
pub fn resolve_working_dir(cwd: Option<&Path>) -> Result<PathBuf> {
    let dir = match cwd {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let absolute = std::fs::canonicalize(&dir)
        .with_context(|| format!("working directory {} does not exist", dir.display()))?;
    if !absolute.is_dir() {
        bail!("{} is not a directory", absolute.display());
    }
    Ok(absolute)
}

/// Parse repeated `KEY=VALUE` flags.
pub fn parse_env_pairs(pairs: &[String]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("invalid --env value {pair:?}; expected KEY=VALUE"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunnerConfig {
        RunnerConfig::from_sources(|_| None, None).unwrap()
    }

    #[test]
    fn env_pairs_split_on_first_equals() {
        let pairs = parse_env_pairs(&["A=1".into(), "B=x=y".into(), "C=".into()]).unwrap();
        assert_eq!(pairs["A"], "1");
        assert_eq!(pairs["B"], "x=y");
        assert_eq!(pairs["C"], "");
        assert!(parse_env_pairs(&["NOEQUALS".into()]).is_err());
        assert!(parse_env_pairs(&["=v".into()]).is_err());
    }

    #[test]
    fn working_dir_is_made_absolute() {
        let tmp = tempfile::tempdir().unwrap();
        let resolved = resolve_working_dir(Some(tmp.path())).unwrap();
        assert!(resolved.is_absolute());

        let missing = tmp.path().join("nope");
        assert!(resolve_working_dir(Some(&missing)).is_err());

        let file = tmp.path().join("f");
        std::fs::write(&file, "").unwrap();
        assert!(resolve_working_dir(Some(&file)).is_err());
    }

    #[test]
    fn prompt_file_wins_over_inline_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("prompt.md");
        std::fs::write(&file, "from file").unwrap();
        let options = RunOptions {
            prompt: Some("inline".into()),
            prompt_file: Some(file),
            ..RunOptions::default()
        };
        assert_eq!(read_prompt(&options).unwrap(), "from file");

        let blank = RunOptions {
            prompt: Some("   ".into()),
            ..RunOptions::default()
        };
        assert!(read_prompt(&blank).is_err());
    }

    #[tokio::test]
    async fn binary_flag_overrides_configured_runner() {
        let runner = build_runner(&config(), RunnerType::Codex, Some("/nonexistent/codex")).unwrap();
        assert_eq!(runner.runner_type(), RunnerType::Codex);
        let availability = runner.is_available().await;
        assert!(!availability.available);
        assert!(availability.reason.contains("/nonexistent/codex"), "{}", availability.reason);
    }

    #[tokio::test]
    async fn mock_runner_is_always_buildable() {
        let runner = build_runner(&config(), RunnerType::Mock, None).unwrap();
        assert!(runner.is_available().await.available);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_against_fake_cli_exits_zero() {
        let fake = runner_test_utils::FakeCli::jsonl(
            "opencode",
            runner_test_utils::OPENCODE_WRITE_RUN,
        );
        let workdir = tempfile::tempdir().unwrap();
        let options = RunOptions {
            runner: Some(RunnerType::OpenCode),
            prompt: Some("write a file".into()),
            cwd: Some(workdir.path().to_path_buf()),
            binary: Some(fake.binary()),
            env: vec!["FOO=bar".into()],
            ..RunOptions::default()
        };
        let code = run_agent(config(), options).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(fake.recorded_stdin(), "write a file");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_run_exits_one() {
        let fake = runner_test_utils::FakeCli::jsonl_with_exit("codex", &[], 3);
        let workdir = tempfile::tempdir().unwrap();
        let options = RunOptions {
            runner: Some(RunnerType::Codex),
            prompt: Some("hi".into()),
            cwd: Some(workdir.path().to_path_buf()),
            binary: Some(fake.binary()),
            ..RunOptions::default()
        };
        assert_eq!(run_agent(config(), options).await.unwrap(), 1);
    }
}
