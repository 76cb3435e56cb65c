#![cfg(unix)]

//! End-to-end executor scenarios driven through a fake engine script.
//!
//! The script logs every invocation's arguments and reacts to marker
//! words in step commands: `slowmark` sleeps briefly, `hangmark` sleeps
//! long, `failmark` exits nonzero.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stevedore::config::loader::{load_from_str, LoadOptions};
use stevedore::engine::Builder;
use stevedore::errors::RuntimeError;
use stevedore::exec::ProcManager;
use stevedore::task::{StepStatus, Task};
use tokio_util::sync::CancellationToken;

struct FakeEngine {
    script: PathBuf,
    log: PathBuf,
}

fn write_engine(dir: &Path) -> FakeEngine {
    let log = dir.join("engine.log");
    let counter = dir.join("flaky.count");
    let script = dir.join("engine.sh");

    let body = format!(
        "#!/bin/sh\n\
         echo \"$@\" >> {log}\n\
         case \"$*\" in\n\
           *\"--name flaky\"*)\n\
             n=$(cat {counter} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {counter}\n\
             if [ $n -lt 3 ]; then echo 'transient failure' >&2; exit 1; fi ;;\n\
           *slowmark*) sleep 0.3 ;;\n\
           *hangmark*) sleep 5 ;;\n\
           *failmark*) exit 7 ;;\n\
         esac\n\
         exit 0\n",
        log = log.display(),
        counter = counter.display(),
    );
    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    FakeEngine { script, log }
}

fn log_lines(engine: &FakeEngine) -> Vec<String> {
    fs::read_to_string(&engine.log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn line_index(lines: &[String], needle: &str) -> Option<usize> {
    lines.iter().position(|l| l.contains(needle))
}

fn load(doc: &str, registry: &str) -> Arc<Task> {
    let task = load_from_str(
        doc,
        &LoadOptions {
            registry: registry.to_string(),
            ..LoadOptions::default()
        },
    )
    .unwrap();
    Arc::new(task)
}

fn builder(engine: &FakeEngine, workspace: &Path) -> Arc<Builder> {
    Arc::new(Builder::new(
        Arc::new(ProcManager::new()),
        engine.script.to_str().unwrap(),
        workspace.to_str().unwrap(),
    ))
}

#[tokio::test]
async fn linear_chain_runs_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_engine(dir.path());

    let task = load(
        "\
steps:
  - id: a
    cmd: img echo a
  - id: b
    cmd: img echo b
    when: [a]
  - id: c
    cmd: img echo c
    when: [b]
",
        "",
    );

    builder(&engine, dir.path())
        .run_task(&CancellationToken::new(), &task)
        .await
        .unwrap();

    let lines = log_lines(&engine);
    let a = line_index(&lines, "--name a").unwrap();
    let b = line_index(&lines, "--name b").unwrap();
    let c = line_index(&lines, "--name c").unwrap();
    assert!(a < b && b < c, "expected a < b < c, got {a}, {b}, {c}");

    for step in &task.steps {
        assert_eq!(step.status(), StepStatus::Successful);
        assert!(step.start_time().is_some());
        assert!(step.end_time().is_some());
    }

    // Dependency ordering: a child starts only after its parent ended.
    let a_end = task.step("a").unwrap().end_time().unwrap();
    let b_start = task.step("b").unwrap().start_time().unwrap();
    assert!(b_start >= a_end);
}

#[tokio::test]
async fn diamond_joins_after_both_branches() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_engine(dir.path());

    let task = load(
        "\
steps:
  - id: a
    cmd: img echo a
  - id: b
    cmd: img slowmark
    when: [a]
  - id: c
    cmd: img slowmark
    when: [a]
  - id: d
    cmd: img echo d
    when: [b, c]
",
        "",
    );

    builder(&engine, dir.path())
        .run_task(&CancellationToken::new(), &task)
        .await
        .unwrap();

    let d_start = task.step("d").unwrap().start_time().unwrap();
    let b_end = task.step("b").unwrap().end_time().unwrap();
    let c_end = task.step("c").unwrap().end_time().unwrap();
    assert!(d_start >= b_end);
    assert!(d_start >= c_end);
}

#[tokio::test]
async fn ignored_failure_still_enables_successors() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_engine(dir.path());

    let task = load(
        "\
steps:
  - id: a
    cmd: img failmark
    ignoreErrors: true
  - id: b
    cmd: img echo b
    when: [a]
",
        "",
    );

    builder(&engine, dir.path())
        .run_task(&CancellationToken::new(), &task)
        .await
        .unwrap();

    assert_eq!(task.step("a").unwrap().status(), StepStatus::Successful);
    assert_eq!(task.step("b").unwrap().status(), StepStatus::Successful);
    assert!(line_index(&log_lines(&engine), "--name b").is_some());
}

#[tokio::test]
async fn first_failure_aborts_and_skips_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_engine(dir.path());

    let task = load(
        "\
steps:
  - id: a
    cmd: img failmark
  - id: b
    cmd: img echo b
    when: [a]
",
        "",
    );

    let err = builder(&engine, dir.path())
        .run_task(&CancellationToken::new(), &task)
        .await
        .unwrap_err();

    match err {
        RuntimeError::Step { id, .. } => assert_eq!(id, "a"),
        other => panic!("expected step failure, got {other:?}"),
    }
    assert_eq!(task.step("a").unwrap().status(), StepStatus::Failed);
    assert_eq!(task.step("b").unwrap().status(), StepStatus::Skipped);
    assert!(line_index(&log_lines(&engine), "--name b").is_none());
}

#[tokio::test]
async fn detach_runs_in_background_mode() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_engine(dir.path());

    let task = load(
        "\
steps:
  - id: svc
    cmd: img serve
    detach: true
",
        "",
    );

    builder(&engine, dir.path())
        .run_task(&CancellationToken::new(), &task)
        .await
        .unwrap();

    let lines = log_lines(&engine);
    let svc = &lines[line_index(&lines, "--name svc").unwrap()];
    assert!(svc.contains(" -d "), "line: {svc}");
    assert!(!svc.contains(" --rm "), "line: {svc}");
}

#[tokio::test]
async fn timed_out_step_fails_with_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_engine(dir.path());

    let task = load(
        "\
steps:
  - id: slow
    cmd: img hangmark
    timeout: 1
",
        "",
    );

    let started = Instant::now();
    let err = builder(&engine, dir.path())
        .run_task(&CancellationToken::new(), &task)
        .await
        .unwrap_err();

    match err {
        RuntimeError::Step { id, source } => {
            assert_eq!(id, "slow");
            assert!(matches!(*source, RuntimeError::Timeout { seconds: 1 }));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn retry_patterns_drive_reinvocation_until_success() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_engine(dir.path());

    let task = load(
        "\
steps:
  - id: flaky
    cmd: img echo hi
    retries: 3
    retryOnErrors: [transient]
",
        "",
    );

    builder(&engine, dir.path())
        .run_task(&CancellationToken::new(), &task)
        .await
        .unwrap();

    assert_eq!(task.step("flaky").unwrap().status(), StepStatus::Successful);
    let count: u32 = fs::read_to_string(dir.path().join("flaky.count"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn build_step_scrapes_image_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_engine(dir.path());
    fs::write(
        dir.path().join("Dockerfile"),
        "FROM golang:1.22 AS build\nRUN go build -o app\nFROM debian:bookworm-slim\nCOPY --from=build /app /app\n",
    )
    .unwrap();

    let task = load(
        "\
steps:
  - id: build-app
    build: -t app:v1 .
",
        "r.io",
    );

    builder(&engine, dir.path())
        .run_task(&CancellationToken::new(), &task)
        .await
        .unwrap();

    let deps = task.step("build-app").unwrap().image_dependencies();
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].image.registry, "r.io");
    assert_eq!(deps[0].image.repository, "app");
    assert_eq!(deps[0].image.tag, "v1");
    assert_eq!(deps[0].runtime.repository, "library/debian");
    assert_eq!(deps[0].runtime.tag, "bookworm-slim");
    assert_eq!(deps[0].buildtime.len(), 1);
    assert_eq!(deps[0].buildtime[0].repository, "library/golang");

    // The build itself ran wrapped in the engine CLI image.
    let lines = log_lines(&engine);
    let build = &lines[line_index(&lines, "--name build-app").unwrap()];
    assert!(build.contains("docker build -t r.io/app:v1 ."), "line: {build}");
}

#[tokio::test]
async fn cancelling_the_run_aborts_in_flight_steps() {
    let dir = tempfile::tempdir().unwrap();
    let engine = write_engine(dir.path());

    let task = load(
        "\
steps:
  - id: slow
    cmd: img hangmark
",
        "",
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
    }

    let started = Instant::now();
    let err = builder(&engine, dir.path())
        .run_task(&cancel, &task)
        .await
        .unwrap_err();

    assert!(err.is_cancelled(), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(4));
}
