//! Tests for the native runtime driver's OCI CLI path.
//!
//! The in-process library is disabled (`prefer_library: false`) so every
//! operation goes through the scripted runtime CLI.

mod common;

use common::{Reply, ScriptedRunner, cli_native, executor, fast_exec};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use unirun::bundle::SpecBuilder;
use unirun::error::ErrorKind;
use unirun::image::LocalImageProvider;
use unirun::request::{ContainerRequest, ResourceLimits};
use unirun::runtime::{ContainerDriver, ContainerStatus, ObservedState, Signal};
use unirun::runtimes::NativeRuntimeDriver;

const RUNNING: Reply = Reply::Ok(r#"{"ociVersion":"1.0.2","id":"c1","status":"running","pid":501}"#);
const STOPPED: Reply = Reply::Ok(r#"{"ociVersion":"1.0.2","id":"c1","status":"stopped","pid":0}"#);

struct Fixture {
    dir: TempDir,
    runner: Arc<ScriptedRunner>,
    driver: NativeRuntimeDriver,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        let driver = NativeRuntimeDriver::new(
            dir.path().join("native"),
            executor(&runner),
            cli_native(),
            &fast_exec(),
        );
        Self { dir, runner, driver }
    }

    fn prefix(&self) -> String {
        format!("crun --root {}", self.dir.path().join("native").display())
    }
}

#[test]
fn test_library_disabled_by_configuration() {
    let f = Fixture::new();
    assert!(!f.driver.uses_library());
    assert_eq!(f.driver.root(), f.dir.path().join("native"));
}

#[tokio::test]
async fn test_create_passes_bundle() {
    let f = Fixture::new();
    let images = Arc::new(LocalImageProvider::new(f.dir.path().join("images")));
    let builder = SpecBuilder::new(f.dir.path().join("bundles"), images).unwrap();
    let bundle = builder.build(&ContainerRequest::new("c1", "alpine")).unwrap();

    f.driver.create("c1", &bundle).await.unwrap();
    assert_eq!(
        f.runner.calls(),
        [format!(
            "{} create --bundle {} c1",
            f.prefix(),
            bundle.path().display()
        )]
    );
}

#[tokio::test]
async fn test_query_parses_state_output() {
    let f = Fixture::new();
    f.runner.on_contains(" state c1", vec![RUNNING]);

    let observed = f.driver.query("c1").await.unwrap();
    assert_eq!(observed, ObservedState::new(ContainerStatus::Running, 501));
}

#[tokio::test]
async fn test_running_without_pid_reports_init() {
    let f = Fixture::new();
    f.runner.on_contains(" state c1", vec![Reply::Ok(r#"{"status":"running","pid":0}"#)]);

    let observed = f.driver.query("c1").await.unwrap();
    assert_eq!(observed.status, ContainerStatus::Running);
    assert_eq!(observed.pid, 1);
}

#[tokio::test]
async fn test_missing_container_is_not_found() {
    let f = Fixture::new();
    f.runner.on_contains(" state c1", vec![Reply::Fail(1, "container does not exist")]);

    let err = f.driver.query("c1").await.unwrap_err();
    assert!(err.is_not_found());
}

// =============================================================================
// Signals
// =============================================================================

#[tokio::test]
async fn test_kill_waits_for_stop() {
    let f = Fixture::new();
    f.runner.on_contains(" state c1", vec![RUNNING, STOPPED]);

    let outcome = f.driver.kill("c1", Signal::Kill).await.unwrap();
    assert_eq!(outcome.status, ContainerStatus::Stopped);
    assert_eq!(outcome.signal_attempts, 1);
    assert_eq!(f.runner.count("kill c1 KILL"), 1);
}

#[tokio::test]
async fn test_kill_on_stopped_sends_nothing() {
    let f = Fixture::new();
    f.runner.on_contains(" state c1", vec![STOPPED]);

    let outcome = f.driver.kill("c1", Signal::Term).await.unwrap();
    assert_eq!(outcome.signal_attempts, 0);
    assert_eq!(f.runner.count(" kill "), 0);
}

#[tokio::test]
async fn test_non_terminating_signal_reports_observed_status() {
    let f = Fixture::new();
    f.runner.on_contains(" state c1", vec![RUNNING]);

    let outcome = f.driver.kill("c1", Signal::Usr1).await.unwrap();
    assert_eq!(outcome.status, ContainerStatus::Running);
    assert_eq!(f.runner.count("kill c1 USR1"), 1);
}

#[tokio::test]
async fn test_stop_confirmed_within_grace() {
    let f = Fixture::new();
    f.runner.on_contains(" state c1", vec![RUNNING, STOPPED]);

    let outcome = f
        .driver
        .stop("c1", Signal::Term, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(outcome.signal_attempts, 1);
    assert_eq!(f.runner.count("kill c1 KILL"), 0);
}

// =============================================================================
// Alternates
// =============================================================================

#[tokio::test]
async fn test_falls_back_to_alternate_cli() {
    let f = Fixture::new();
    f.runner.on("crun", vec![Reply::Missing]);

    f.driver.start("c1").await.unwrap();
    let calls = f.runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].starts_with("runc --root "));
    assert!(calls[1].ends_with(" start c1"));
}

#[tokio::test]
async fn test_no_cli_is_runtime_unavailable() {
    let f = Fixture::new();
    for program in ["crun", "runc", "youki"] {
        f.runner.on(program, vec![Reply::Missing]);
    }

    let err = f.driver.delete("c1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeUnavailable);
    assert!(err.to_string().contains("disabled by configuration"));
}

// =============================================================================
// Update
// =============================================================================

#[tokio::test]
async fn test_update_maps_limits() {
    let f = Fixture::new();
    let limits = ResourceLimits {
        memory_bytes: Some(268_435_456),
        cpu_shares: Some(512),
    };
    f.driver.update("c1", &limits).await.unwrap();
    assert_eq!(
        f.runner.calls(),
        [format!("{} update --memory 268435456 --cpu-share 512 c1", f.prefix())]
    );
}
