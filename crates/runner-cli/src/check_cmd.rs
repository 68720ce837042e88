//! `agent-runner list` and `agent-runner check`.

use anyhow::{Context, Result};
use serde::Serialize;

use runner_core::registry::RunnerRegistry;
use runner_core::types::{Availability, Capabilities, RunnerType};

use crate::config::RunnerConfig;

#[derive(Debug, Serialize)]
struct RunnerRow {
    runner: RunnerType,
    capabilities: Capabilities,
}

#[derive(Debug, Serialize)]
struct ProbeRow {
    runner: RunnerType,
    #[serde(flatten)]
    availability: Availability,
}

/// Print every configured runner with its capabilities.
pub fn run_list(config: &RunnerConfig, json: bool) -> Result<()> {
    let registry = RunnerRegistry::with_defaults(&config.runners);
    let rows: Vec<RunnerRow> = registry
        .types()
        .into_iter()
        .filter_map(|t| registry.get(t).ok())
        .map(|r| RunnerRow {
            runner: r.runner_type(),
            capabilities: r.capabilities(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows).context("failed to serialize")?);
        return Ok(());
    }

    println!("{:<12} {:<8} {:<6} {:<6} {}", "RUNNER", "TOOLS", "COST", "TURNS", "MODELS");
    for row in &rows {
        let caps = &row.capabilities;
        println!(
            "{:<12} {:<8} {:<6} {:<6} {}",
            row.runner.as_str(),
            yes_no(caps.tool_events),
            yes_no(caps.cost_tracking),
            caps.max_turns.map_or_else(|| "-".to_string(), |n| n.to_string()),
            if caps.models.is_empty() {
                "(any)".to_string()
            } else {
                caps.models.join(", ")
            }
        );
    }
    Ok(())
}

/// Probe every runner and print the verdicts. Returns whether at least
/// one runner is usable.
pub async fn run_check(config: &RunnerConfig, json: bool) -> Result<bool> {
    let registry = RunnerRegistry::with_defaults(&config.runners);
    let mut rows: Vec<ProbeRow> = registry
        .probe_all()
        .await
        .into_iter()
        .map(|(runner, availability)| ProbeRow {
            runner: runner.runner_type(),
            availability,
        })
        .collect();
    rows.sort_by_key(|row| row.runner);
    let any_available = rows.iter().any(|row| row.availability.available);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows).context("failed to serialize")?);
        return Ok(any_available);
    }

    for row in &rows {
        let mark = if row.availability.available { "ok" } else { "--" };
        println!("[{mark}] {:<12} {}", row.runner.as_str(), row.availability.reason);
    }
    Ok(any_available)
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}
