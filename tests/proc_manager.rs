#![cfg(unix)]

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stevedore::errors::RuntimeError;
use stevedore::exec::ProcManager;
use tokio_util::sync::CancellationToken;

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Shell snippet that fails with `message` on stderr until the counter
/// file reaches `succeed_at` invocations.
fn flaky_script(counter: &std::path::Path, succeed_at: u32, message: &str) -> String {
    format!(
        "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; \
         if [ $n -lt {succeed_at} ]; then echo '{message}' >&2; exit 1; fi",
        c = counter.display()
    )
}

fn invocations(counter: &std::path::Path) -> u32 {
    fs::read_to_string(counter)
        .unwrap_or_default()
        .trim()
        .parse()
        .unwrap_or(0)
}

#[tokio::test]
async fn run_returns_captured_output_on_success() {
    let pm = ProcManager::new();
    let cancel = CancellationToken::new();

    let tail = pm
        .run(&cancel, &sh("echo hello; echo oops >&2"), None, None)
        .await
        .unwrap();

    assert!(tail.contains("hello"));
    assert!(tail.contains("oops"));
}

#[tokio::test]
async fn run_reports_exit_code_and_tail() {
    let pm = ProcManager::new();
    let cancel = CancellationToken::new();

    let err = pm
        .run(&cancel, &sh("echo boom >&2; exit 3"), None, None)
        .await
        .unwrap_err();

    match err {
        RuntimeError::Subprocess { code, tail, .. } => {
            assert_eq!(code, 3);
            assert!(tail.contains("boom"));
        }
        other => panic!("expected Subprocess, got {other:?}"),
    }
}

#[tokio::test]
async fn run_forwards_stdin() {
    let pm = ProcManager::new();
    let cancel = CancellationToken::new();

    let tail = pm
        .run(&cancel, &sh("cat"), Some("from-stdin"), None)
        .await
        .unwrap();

    assert!(tail.contains("from-stdin"));
}

#[tokio::test]
async fn matching_pattern_retries_until_success() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let pm = ProcManager::new();
    let cancel = CancellationToken::new();

    // Fails twice with a transient message, succeeds on the third try.
    let script = flaky_script(&counter, 3, "transient failure");
    pm.run_with_retries(
        &cancel,
        &sh(&script),
        None,
        None,
        3,
        &["transient".to_string()],
        0,
        "flaky",
    )
    .await
    .unwrap();

    assert_eq!(invocations(&counter), 3);
}

#[tokio::test]
async fn unmatched_pattern_fails_without_retrying() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let pm = ProcManager::new();
    let cancel = CancellationToken::new();

    let script = flaky_script(&counter, 10, "fatal problem");
    let err = pm
        .run_with_retries(
            &cancel,
            &sh(&script),
            None,
            None,
            3,
            &["transient".to_string()],
            0,
            "fatal",
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::Subprocess { .. }));
    assert_eq!(invocations(&counter), 1);
}

#[tokio::test]
async fn empty_pattern_list_retries_on_any_failure() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let pm = ProcManager::new();
    let cancel = CancellationToken::new();

    let script = flaky_script(&counter, 10, "whatever");
    let err = pm
        .run_with_retries(&cancel, &sh(&script), None, None, 2, &[], 0, "any")
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::Subprocess { .. }));
    // One initial attempt plus two retries.
    assert_eq!(invocations(&counter), 3);
}

#[tokio::test]
async fn repeat_runs_additional_successful_series() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log");
    let pm = ProcManager::new();
    let cancel = CancellationToken::new();

    let script = format!("echo run >> {}", log.display());
    pm.run_repeat_with_retries(&cancel, &sh(&script), None, None, 0, &[], 0, "rep", 2)
        .await
        .unwrap();

    let contents = fs::read_to_string(&log).unwrap();
    assert_eq!(contents.lines().count(), 3);
}

#[tokio::test]
async fn stop_cancels_inflight_subprocesses() {
    let pm = Arc::new(ProcManager::new());
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let runner = {
        let pm = Arc::clone(&pm);
        let cancel = cancel.clone();
        tokio::spawn(async move { pm.run(&cancel, &sh("sleep 5"), None, None).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    pm.stop();

    let result = runner.await.unwrap();
    assert!(matches!(result, Err(RuntimeError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn stop_refuses_further_spawns() {
    let pm = ProcManager::new();
    let cancel = CancellationToken::new();

    pm.stop();
    let err = pm.run(&cancel, &sh("echo hi"), None, None).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Cancelled));
}

#[tokio::test]
async fn cancelled_token_prevents_spawn() {
    let pm = ProcManager::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = pm.run(&cancel, &sh("echo hi"), None, None).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Cancelled));
}

#[tokio::test]
async fn cancellation_is_never_retried() {
    let pm = Arc::new(ProcManager::new());
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let runner = {
        let pm = Arc::clone(&pm);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            pm.run_with_retries(&cancel, &sh("sleep 5"), None, None, 5, &[], 1, "c")
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let result = runner.await.unwrap();
    assert!(matches!(result, Err(RuntimeError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(4));
}
