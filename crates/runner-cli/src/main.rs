mod check_cmd;
mod config;
mod run_cmd;
mod sidecar_cmd;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};

use runner_core::types::RunnerType;

use config::RunnerConfig;

#[derive(Parser)]
#[command(
    name = "agent-runner",
    version,
    about = "Run AI coding-agent CLIs and stream their events as JSON lines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one agent session; events go to stdout, one JSON object per line
    Run {
        /// Runner to use: claude-code, codex, opencode or mock
        #[arg(long, short = 'r')]
        runner: RunnerType,
        /// Prompt text (`-` or omitted reads stdin)
        prompt: Option<String>,
        /// Read the prompt from a file instead
        #[arg(long, conflicts_with = "prompt")]
        prompt_file: Option<PathBuf>,
        /// Working directory for the agent (default: current directory)
        #[arg(long, short = 'C')]
        cwd: Option<PathBuf>,
        /// Override the runner's binary for this run
        #[arg(long)]
        binary: Option<String>,
        /// Model to request
        #[arg(long, short = 'm')]
        model: Option<String>,
        /// Turn limit, for runners that accept one
        #[arg(long)]
        max_turns: Option<u32>,
        /// Wall-clock limit in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Tool allow-list entry (repeatable)
        #[arg(long = "allow-tool")]
        allowed_tools: Vec<String>,
        /// Extra argument passed to the CLI verbatim (repeatable)
        #[arg(long = "extra-arg", allow_hyphen_values = true)]
        extra_args: Vec<String>,
        /// Environment variable for the agent, KEY=VALUE (repeatable)
        #[arg(long = "env", short = 'e')]
        env: Vec<String>,
        /// Task title used to frame the prompt
        #[arg(long)]
        task_title: Option<String>,
        /// Task description, used with --task-title
        #[arg(long, requires = "task_title")]
        task_description: Option<String>,
        /// Use this run id instead of a fresh one
        #[arg(long)]
        run_id: Option<String>,
    },
    /// List configured runners and their capabilities
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Probe every runner for its binary and credentials
    Check {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Supervise a companion server until interrupted
    Sidecar {
        /// Shell command line to run (overrides SIDECAR_COMMAND)
        #[arg(long)]
        command: Option<String>,
        /// Host for the TCP health check
        #[arg(long)]
        host: Option<String>,
        /// Port for the TCP health check; without one the process is
        /// considered healthy once spawned
        #[arg(long)]
        port: Option<u16>,
    },
    /// Write a starter config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Execute the `agent-runner init` command: write config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let path = config::save_config(&config::ConfigFile::starter())?;
    println!("Config written to {}", path.display());
    println!("Edit the [claude], [codex], [opencode] and [sidecar] sections as needed.");
    Ok(())
}

async fn dispatch(command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Init { force } => {
            cmd_init(force)?;
            Ok(0)
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "agent-runner",
                &mut std::io::stdout(),
            );
            Ok(0)
        }
        Commands::List { json } => {
            let config = RunnerConfig::resolve()?;
            check_cmd::run_list(&config, json)?;
            Ok(0)
        }
        Commands::Check { json } => {
            let config = RunnerConfig::resolve()?;
            let usable = check_cmd::run_check(&config, json).await?;
            Ok(if usable { 0 } else { 1 })
        }
        Commands::Sidecar {
            command,
            host,
            port,
        } => {
            let config = RunnerConfig::resolve()?;
            let options = sidecar_cmd::SidecarOptions {
                command,
                host,
                port,
            };
            sidecar_cmd::run_sidecar(&config, options).await
        }
        Commands::Run {
            runner,
            prompt,
            prompt_file,
            cwd,
            binary,
            model,
            max_turns,
            timeout,
            allowed_tools,
            extra_args,
            env,
            task_title,
            task_description,
            run_id,
        } => {
            let config = RunnerConfig::resolve()?;
            let options = run_cmd::RunOptions {
                runner: Some(runner),
                prompt,
                prompt_file,
                cwd,
                binary,
                model,
                max_turns,
                timeout_secs: timeout,
                allowed_tools,
                extra_args,
                env,
                task_title,
                task_description,
                run_id,
            };
            run_cmd::run_agent(config, options).await
        }
    }
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries the JSON event stream.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match dispatch(cli.command).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serialize tests that mutate process-wide environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_parses_repeatable_flags() {
        let cli = Cli::try_parse_from([
            "agent-runner",
            "run",
            "-r",
            "codex",
            "--env",
            "A=1",
            "-e",
            "B=2",
            "--extra-arg",
            "--full-auto",
            "do the thing",
        ])
        .unwrap();
        let Commands::Run {
            runner,
            env,
            extra_args,
            prompt,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(runner, RunnerType::Codex);
        assert_eq!(env, vec!["A=1", "B=2"]);
        assert_eq!(extra_args, vec!["--full-auto"]);
        assert_eq!(prompt.as_deref(), Some("do the thing"));
    }

    #[test]
    fn unknown_runner_is_rejected() {
        let err = Cli::try_parse_from(["agent-runner", "run", "-r", "gemini", "hi"])
            .err()
            .unwrap();
        assert!(err.to_string().contains("gemini"), "{err}");
    }

    #[test]
    fn task_description_requires_title() {
        assert!(
            Cli::try_parse_from(["agent-runner", "run", "-r", "mock", "--task-description", "x", "hi"])
                .is_err()
        );
    }
}
