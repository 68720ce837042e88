//! Stop, cancel and timeout behavior against long-running fake CLIs.
//!
//! The fakes record their own pid and the pid of a background `sleep`
//! they fork, so the tests can check that the whole process group is gone
//! once a run reports completion.

#![cfg(target_os = "linux")]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use runner_core::config::CliSettings;
use runner_core::event::{EventData, MemorySink};
use runner_core::runner::{
    CANCELLED_MESSAGE, ClaudeCodeRunner, OpenCodeRunner, Runner, RunnerError, TIMED_OUT_MESSAGE,
};
use runner_core::types::{ExecuteRequest, RunProfile, RunnerType};
use runner_test_utils::{FakeCli, process_running, wait_for_file};

const FIRST_LINE: &str =
    r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"working"}]}}"#;

async fn wait_until_started(fake: &FakeCli) {
    assert!(
        wait_for_file(&fake.dir().join("grandchild"), Duration::from_secs(5)).await,
        "fake CLI never started"
    );
}

fn assert_group_gone(fake: &FakeCli) {
    let pid = fake.recorded_pid("pid").expect("pid file");
    let grandchild = fake.recorded_pid("grandchild").expect("grandchild file");
    assert!(!process_running(pid), "agent process {pid} survived");
    assert!(!process_running(grandchild), "grandchild {grandchild} survived");
}

// ===========================================================================
// stop()
// ===========================================================================

#[tokio::test]
async fn stop_terminates_the_process_tree() {
    let fake = FakeCli::long_running("claude", FIRST_LINE, false);
    let workdir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let runner = Arc::new(ClaudeCodeRunner::with_binary(fake.binary()));

    let request = ExecuteRequest::new(RunnerType::ClaudeCode, "go", workdir.path(), sink.clone());
    let run_id = request.run_id;
    let handle = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.execute(request, CancellationToken::new()).await })
    };

    wait_until_started(&fake).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stopped_at = Instant::now();
    runner.stop(run_id).await.unwrap();
    let result = handle.await.unwrap().unwrap();
    assert!(stopped_at.elapsed() < Duration::from_millis(5200));

    assert!(!result.success);
    assert!(result.cancelled);
    assert!(
        result.error_message.as_deref().unwrap().starts_with(CANCELLED_MESSAGE),
        "{:?}",
        result.error_message
    );
    assert_group_gone(&fake);

    let events = sink.events();
    assert!(matches!(&events[0].data, EventData::Message(m) if m.content == "working"));
    assert!(matches!(
        &events.last().unwrap().data,
        EventData::Status(s) if s.status == "cancelled"
    ));
    assert!(sink.is_closed());

    // The run is no longer registered.
    let err = runner.stop(run_id).await.unwrap_err();
    assert!(matches!(err, RunnerError::NotFound(id) if id == run_id));
}

#[tokio::test]
async fn cancelling_the_token_stops_the_run() {
    let fake = FakeCli::long_running("opencode", r#"{"type":"step_start","part":{}}"#, false);
    let workdir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let runner = OpenCodeRunner::with_binary(fake.binary());
    let request = ExecuteRequest::new(RunnerType::OpenCode, "go", workdir.path(), sink.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let fake_dir = fake.dir().to_path_buf();
    tokio::spawn(async move {
        wait_for_file(&fake_dir.join("grandchild"), Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let result = runner.execute(request, cancel).await.unwrap();
    assert!(result.cancelled);
    assert!(!result.success);
    assert_eq!(result.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert_group_gone(&fake);
}

#[tokio::test]
async fn term_ignoring_process_is_killed_after_grace() {
    let fake = FakeCli::long_running("claude", FIRST_LINE, true);
    let workdir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let settings = CliSettings::new(fake.binary()).with_grace(Duration::from_millis(300));
    let runner = Arc::new(ClaudeCodeRunner::new(settings));

    let request = ExecuteRequest::new(RunnerType::ClaudeCode, "go", workdir.path(), sink);
    let run_id = request.run_id;
    let handle = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.execute(request, CancellationToken::new()).await })
    };
    wait_until_started(&fake).await;

    let stopped_at = Instant::now();
    runner.stop(run_id).await.unwrap();
    let result = handle.await.unwrap().unwrap();

    let elapsed = stopped_at.elapsed();
    assert!(elapsed >= Duration::from_millis(250), "killed before grace: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
    assert!(result.cancelled);
    assert_group_gone(&fake);
}

// ===========================================================================
// Timeouts
// ===========================================================================

#[tokio::test]
async fn profile_timeout_ends_the_run() {
    let fake = FakeCli::long_running("claude", FIRST_LINE, false);
    let workdir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let runner = ClaudeCodeRunner::with_binary(fake.binary());

    let profile = RunProfile {
        timeout: Some(Duration::from_millis(500)),
        ..RunProfile::default()
    };
    let request = ExecuteRequest::new(RunnerType::ClaudeCode, "go", workdir.path(), sink.clone())
        .with_profile(profile);

    let result = runner.execute(request, CancellationToken::new()).await.unwrap();
    assert!(!result.success);
    assert!(result.cancelled);
    assert!(
        result.error_message.as_deref().unwrap().starts_with(TIMED_OUT_MESSAGE),
        "{:?}",
        result.error_message
    );
    assert!(matches!(
        &sink.events().last().unwrap().data,
        EventData::Status(s) if s.status == "timed_out"
    ));
    assert_group_gone(&fake);
}

// ===========================================================================
// Concurrency
// ===========================================================================

#[tokio::test]
async fn concurrent_runs_are_isolated() {
    let fakes: Vec<FakeCli> = (0..3)
        .map(|_| FakeCli::long_running("claude", FIRST_LINE, false))
        .collect();
    let workdir = tempfile::tempdir().unwrap();

    let mut handles = Vec::new();
    let mut run_ids = Vec::new();
    let mut runners = Vec::new();
    for fake in &fakes {
        let runner = Arc::new(ClaudeCodeRunner::with_binary(fake.binary()));
        let sink = Arc::new(MemorySink::new());
        let request = ExecuteRequest::new(RunnerType::ClaudeCode, "go", workdir.path(), sink);
        run_ids.push(request.run_id);
        let task_runner = runner.clone();
        handles.push(tokio::spawn(async move {
            task_runner.execute(request, CancellationToken::new()).await
        }));
        runners.push(runner);
    }
    for fake in &fakes {
        wait_until_started(fake).await;
    }

    // Stopping the middle run leaves the others alive.
    runners[1].stop(run_ids[1]).await.unwrap();
    let middle = handles.remove(1).await.unwrap().unwrap();
    assert!(middle.cancelled);
    assert_group_gone(&fakes[1]);
    for fake in [&fakes[0], &fakes[2]] {
        assert!(process_running(fake.recorded_pid("pid").unwrap()));
    }

    runners[0].stop(run_ids[0]).await.unwrap();
    runners[2].stop(run_ids[2]).await.unwrap();
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().cancelled);
    }
}
