//! Tests for bounded command execution.
//!
//! Covers retry gating, timeouts, missing binaries and stderr
//! classification through the ordered error table.

mod common;

use common::{Reply, ScriptedRunner, executor};
use std::time::Duration;
use unirun::constants::STDERR_EXCERPT_LEN;
use unirun::error::{Error, ErrorKind};
use unirun::executor::{
    CommandExecutor, ErrorRule, ErrorTable, ExecPolicy, SystemRunner, excerpt, transient_failure,
};

fn argv(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

fn policy(retries: u32) -> ExecPolicy {
    ExecPolicy::new(Duration::from_millis(100)).with_retries(retries, Duration::from_millis(1))
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let runner = ScriptedRunner::new();
    runner.on(
        "pct start",
        vec![Reply::Fail(1, "connection reset by peer"), Reply::Ok("done")],
    );

    let output = executor(&runner)
        .run(&argv("pct start 101"), &policy(2))
        .await
        .unwrap();
    assert_eq!(output.stdout, "done");
    assert_eq!(output.attempts, 2);
    assert_eq!(runner.calls().len(), 2);
}

#[tokio::test]
async fn test_non_transient_failure_is_not_retried() {
    let runner = ScriptedRunner::new();
    runner.on("pct start", vec![Reply::Fail(2, "CT 101 does not exist")]);

    let err = executor(&runner)
        .run(&argv("pct start 101"), &policy(3))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let runner = ScriptedRunner::new();
    runner.on("pct start", vec![Reply::Fail(1, "connection reset by peer")]);

    let err = executor(&runner)
        .run(&argv("pct start 101"), &policy(2))
        .await
        .unwrap_err();
    assert_eq!(runner.calls().len(), 3, "one attempt plus two retries");
    assert_eq!(err.kind(), ErrorKind::NetworkError);
    assert_eq!(err.stderr_excerpt(), Some("connection reset by peer"));
}

#[tokio::test]
async fn test_custom_retry_predicate() {
    let runner = ScriptedRunner::new();
    runner.on("zfs", vec![Reply::Fail(75, "busy"), Reply::Ok("")]);

    let policy = policy(1).with_retry_if(|code, _| code == Some(75));
    let output = executor(&runner).run(&argv("zfs snapshot a@b"), &policy).await.unwrap();
    assert_eq!(output.attempts, 2);
}

#[test]
fn test_transient_failure_predicate() {
    assert!(transient_failure(Some(1), "Resource temporarily unavailable"));
    assert!(transient_failure(Some(255), "can't lock file '/run/lock/lxc/pve-config-101.lock'"));
    assert!(!transient_failure(Some(1), "permission denied"));
}

// =============================================================================
// Timeouts and Missing Binaries
// =============================================================================

#[tokio::test]
async fn test_timeout_is_never_retried() {
    let runner = ScriptedRunner::new();
    runner.on("pct", vec![Reply::Hang]);

    let policy = ExecPolicy::new(Duration::from_millis(20))
        .with_retries(3, Duration::from_millis(1))
        .with_retry_if(|_, _| true);
    let err = executor(&runner).run(&argv("pct stop 101"), &policy).await.unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn test_spawn_enoent_is_binary_not_found() {
    let runner = ScriptedRunner::new();
    runner.on("pct", vec![Reply::Missing]);

    let err = executor(&runner).run(&argv("pct list"), &policy(2)).await.unwrap_err();
    assert!(matches!(err, Error::BinaryNotFound { ref program } if program == "pct"));
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn test_exit_127_is_binary_not_found() {
    let runner = ScriptedRunner::new();
    runner.on("pct", vec![Reply::Fail(127, "sh: pct: not found")]);

    let err = executor(&runner).run(&argv("pct list"), &policy(0)).await.unwrap_err();
    assert!(matches!(err, Error::BinaryNotFound { .. }));
}

#[tokio::test]
async fn test_exit_127_inside_guest_is_classified() {
    let runner = ScriptedRunner::new();
    runner.on("pct exec", vec![Reply::Fail(127, "kill: executable file not in $PATH")]);

    let err = executor(&runner)
        .run(&argv("pct exec 101 -- kill -HUP 1"), &policy(0).in_guest())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CommandFailed { exit_code: Some(127), .. }));
}

#[tokio::test]
async fn test_empty_argv_is_invalid() {
    let runner = ScriptedRunner::new();
    let err = executor(&runner).run(&[], &policy(0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(runner.calls().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_system_runner_runs_real_processes() {
    let executor = CommandExecutor::new(std::sync::Arc::new(SystemRunner));

    let output = executor
        .run(&argv("sh -c true"), &ExecPolicy::new(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(output.attempts, 1);

    let err = executor
        .run(
            &argv("unirun-test-binary-that-does-not-exist"),
            &ExecPolicy::new(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BinaryNotFound { .. }));
}

// =============================================================================
// Classification
// =============================================================================

#[test]
fn test_default_table_ordering() {
    let table = ErrorTable::default();
    assert_eq!(table.classify(Some(124), ""), ErrorKind::Timeout);
    assert_eq!(table.classify(Some(1), "Permission denied"), ErrorKind::PermissionDenied);
    assert_eq!(table.classify(Some(1), "CT 101 already exists on node 'pve'"), ErrorKind::AlreadyExists);
    assert_eq!(table.classify(Some(1), "no such container"), ErrorKind::NotFound);
    assert_eq!(table.classify(Some(2), "garbled"), ErrorKind::InvalidInput);
    // Earlier rules win: "timed out" beats "not found".
    assert_eq!(table.classify(Some(1), "lookup timed out: host not found"), ErrorKind::Timeout);
}

#[test]
fn test_fallback_kinds() {
    let table = ErrorTable::default();
    assert_eq!(table.classify(Some(1), "something odd"), ErrorKind::OperationFailed);
    assert_eq!(table.classify(None, "killed"), ErrorKind::Unknown);
}

#[tokio::test]
async fn test_custom_rule_takes_precedence() {
    let runner = ScriptedRunner::new();
    runner.on("pct", vec![Reply::Fail(255, "not found")]);

    let table = ErrorTable::default().with_rule_first(ErrorRule::exit_code(255, ErrorKind::OperationFailed));
    let err = executor(&runner)
        .with_table(table)
        .run(&argv("pct stop 101"), &policy(0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
}

#[test]
fn test_stderr_excerpt_is_bounded() {
    let long = "é".repeat(STDERR_EXCERPT_LEN);
    let cut = excerpt(&long);
    assert!(cut.len() <= STDERR_EXCERPT_LEN + 3);
    assert!(cut.ends_with("..."));
    assert_eq!(excerpt("  short  "), "short");
}
