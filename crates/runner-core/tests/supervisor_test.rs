//! Supervisor lifecycle against real short-lived processes.

#![cfg(unix)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use runner_core::supervisor::{
    AlwaysHealthy, HealthChecker, ProcessSpec, StateChange, Subscription, Supervisor,
    SupervisorConfig, SupervisorError, SupervisorState, TcpHealthCheck,
};
use runner_test_utils::process_running;

use SupervisorState::*;

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        max_restarts: 2,
        initial_backoff: Duration::from_millis(10),
        startup_timeout: Duration::from_secs(2),
        graceful_stop: Duration::from_millis(500),
        health_interval: Duration::from_millis(20),
        ..SupervisorConfig::default()
    }
}

/// Collect changes until `until` is reached or `timeout` elapses.
async fn collect_until(
    sub: &mut Subscription,
    until: SupervisorState,
    timeout: Duration,
) -> Vec<StateChange> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Some(change) = sub.recv().await {
            let done = change.current == until;
            seen.push(change);
            if done {
                break;
            }
        }
    })
    .await;
    seen
}

// ===========================================================================
// Crash loop
// ===========================================================================

#[tokio::test]
async fn crash_loop_becomes_unrecoverable_and_manual_restart_recovers() {
    let sup = Supervisor::new(
        ProcessSpec::shell("sleep 0.2; exit 1"),
        fast_config(),
        Arc::new(AlwaysHealthy),
    );
    let mut sub = sup.subscribe();

    sup.start().await.unwrap();
    let changes = collect_until(&mut sub, Unrecoverable, Duration::from_secs(10)).await;
    let states: Vec<SupervisorState> = changes.iter().map(|c| c.current).collect();
    assert_eq!(
        states,
        vec![
            Starting, Running, Restarting, Starting, Running, Restarting, Starting, Running,
            Restarting, Unrecoverable,
        ]
    );

    for pair in changes.windows(2) {
        assert_eq!(pair[0].current, pair[1].previous);
    }
    let restarting: Vec<&StateChange> =
        changes.iter().filter(|c| c.current == Restarting).collect();
    assert!(restarting[0].error.as_deref().unwrap().contains("exited with code 1"));
    assert_eq!(
        restarting.iter().map(|c| c.restart_count).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(changes.last().unwrap().error.is_some());
    assert_eq!(sup.state(), Unrecoverable);
    assert_eq!(sup.pid(), None);

    assert!(matches!(sup.start().await, Err(SupervisorError::Unrecoverable)));

    sup.restart().await.unwrap();
    assert_eq!(sup.restart_count(), 0);
    assert!(matches!(sup.state(), Running | Restarting));

    sup.stop().await;
    assert_eq!(sup.state(), Stopped);
}

#[tokio::test]
async fn backoff_schedule_is_capped() {
    let config = SupervisorConfig {
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        ..SupervisorConfig::default()
    };
    let sup = Supervisor::new(ProcessSpec::shell("true"), config, Arc::new(AlwaysHealthy));
    let schedule: Vec<u128> = (1..=6).map(|n| sup.calculate_backoff(n).as_millis()).collect();
    assert_eq!(schedule, vec![100, 200, 400, 800, 1000, 1000]);
}

// ===========================================================================
// Health gating
// ===========================================================================

#[tokio::test]
async fn becomes_running_once_health_check_passes() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let health: Arc<dyn HealthChecker> = Arc::new(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 3 {
                return Err(anyhow::anyhow!("warming up"));
            }
            Ok(())
        }
    });
    let sup = Supervisor::new(ProcessSpec::shell("sleep 30"), fast_config(), health);

    sup.start().await.unwrap();
    assert_eq!(sup.state(), Running);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    let pid = sup.pid().unwrap();
    assert!(process_running(pid));
    sup.stop().await;
    assert!(!process_running(pid));
}

#[tokio::test]
async fn tcp_health_check_gates_a_listening_process() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let sup = Supervisor::new(
        ProcessSpec::shell("sleep 30"),
        fast_config(),
        Arc::new(TcpHealthCheck::new("127.0.0.1", port)),
    );
    sup.start().await.unwrap();
    assert_eq!(sup.state(), Running);
    sup.stop().await;
}

#[tokio::test]
async fn start_can_be_retried_after_a_failed_start() {
    let healthy = Arc::new(AtomicUsize::new(0));
    let flag = healthy.clone();
    let health: Arc<dyn HealthChecker> = Arc::new(move || {
        let ready = flag.load(Ordering::SeqCst) > 0;
        async move {
            if ready {
                Ok(())
            } else {
                Err(anyhow::anyhow!("closed"))
            }
        }
    });
    let config = SupervisorConfig {
        startup_timeout: Duration::from_millis(200),
        ..fast_config()
    };
    let sup = Supervisor::new(ProcessSpec::shell("sleep 30"), config, health);

    assert!(matches!(sup.start().await, Err(SupervisorError::HealthCheck(_))));
    assert_eq!(sup.state(), Stopped);

    healthy.store(1, Ordering::SeqCst);
    sup.start().await.unwrap();
    assert_eq!(sup.state(), Running);
    sup.stop().await;
}

// ===========================================================================
// Stop
// ===========================================================================

#[tokio::test]
async fn stop_during_backoff_settles_in_stopped() {
    let config = SupervisorConfig {
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(30),
        ..fast_config()
    };
    let sup = Supervisor::new(
        ProcessSpec::shell("sleep 0.1; exit 3"),
        config,
        Arc::new(AlwaysHealthy),
    );
    let mut sub = sup.subscribe();
    sup.start().await.unwrap();
    collect_until(&mut sub, Restarting, Duration::from_secs(5)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(2), sup.stop()).await;
    assert!(stopped.is_ok(), "stop waited for the backoff");
    assert_eq!(sup.state(), Stopped);

    let rest: Vec<SupervisorState> = std::iter::from_fn(|| sub.try_recv())
        .map(|c| c.current)
        .collect();
    assert_eq!(rest, vec![Stopping, Stopped]);
}

#[tokio::test]
async fn stop_kills_a_term_ignoring_process() {
    let sup = Supervisor::new(
        ProcessSpec::shell("trap '' TERM; while true; do sleep 1; done"),
        SupervisorConfig {
            graceful_stop: Duration::from_millis(200),
            ..fast_config()
        },
        Arc::new(AlwaysHealthy),
    );
    sup.start().await.unwrap();
    let pid = sup.pid().unwrap();

    tokio::time::timeout(Duration::from_secs(3), sup.stop())
        .await
        .expect("stop hung");
    assert!(!process_running(pid));
}
