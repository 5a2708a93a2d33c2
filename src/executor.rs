//! # Command Executor - Bounded External Process Invocation
//!
//! Two of the three drivers are thin layers over host CLIs. Everything they
//! share about running those CLIs lives here:
//!
//! - **Bounded waits**: every invocation runs under `tokio::time::timeout`;
//!   a timed-out child is dropped, and `kill_on_drop` reaps it best-effort.
//! - **Retries**: only when the policy's predicate accepts the failure, with
//!   a fixed backoff. Timeouts are never retried.
//! - **Classification**: an ordered [`ErrorTable`] folds raw exit codes and
//!   stderr text into the closed [`ErrorKind`] set before anything reaches
//!   the orchestrator.
//!
//! ```text
//!  argv ──▶ ProcessRunner ──▶ exit 0? ──yes──▶ CommandOutput
//!                 │               │no
//!            spawn ENOENT     retry_if? ──yes──▶ sleep(backoff) ──▶ again
//!                 │               │no
//!                 ▼               ▼
//!          BinaryNotFound   ErrorTable ──▶ Error::CommandFailed { kind, .. }
//! ```
//!
//! Spawning sits behind the [`ProcessRunner`] trait so tests can script
//! exit codes and stderr without touching the host.

use crate::constants::{COMMAND_BACKOFF, COMMAND_RETRIES, COMMAND_TIMEOUT, STDERR_EXCERPT_LEN};
use crate::error::{Error, ErrorKind, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exit code shells use for "command not found".
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

// =============================================================================
// Process Runner
// =============================================================================

/// Raw result of one process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ProcessOutput {
    /// Output of a process that exited 0 with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Output of a process that failed with the given code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Spawns a process and collects its output.
///
/// Implementations return `Ok` for any exit status. A missing binary is
/// [`Error::BinaryNotFound`]; other spawn failures are [`Error::Io`].
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, argv: &[String]) -> Result<ProcessOutput>;
}

/// Runs processes on the host via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, argv: &[String]) -> Result<ProcessOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidRequest("empty command line".to_string()))?;

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::BinaryNotFound {
                    program: program.clone(),
                },
                _ => Error::Io(e),
            })?;

        Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// =============================================================================
// Error Table
// =============================================================================

/// One classification rule.
///
/// A rule matches when every condition it carries holds. A rule with no
/// condition never matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRule {
    /// Exact exit code to match.
    pub exit_code: Option<i32>,
    /// Case-insensitive stderr substring to match (stored lowercased).
    pub stderr: Option<String>,
    /// Kind assigned on match.
    pub kind: ErrorKind,
}

impl ErrorRule {
    /// Rule matching an exit code.
    pub fn exit_code(code: i32, kind: ErrorKind) -> Self {
        Self {
            exit_code: Some(code),
            stderr: None,
            kind,
        }
    }

    /// Rule matching a stderr substring.
    pub fn stderr(needle: &str, kind: ErrorKind) -> Self {
        Self {
            exit_code: None,
            stderr: Some(needle.to_lowercase()),
            kind,
        }
    }

    /// Rule matching both an exit code and a stderr substring.
    pub fn both(code: i32, needle: &str, kind: ErrorKind) -> Self {
        Self {
            exit_code: Some(code),
            stderr: Some(needle.to_lowercase()),
            kind,
        }
    }

    fn matches(&self, exit_code: Option<i32>, stderr_lower: &str) -> bool {
        if self.exit_code.is_none() && self.stderr.is_none() {
            return false;
        }
        let code_ok = self.exit_code.is_none_or(|c| exit_code == Some(c));
        let text_ok = self
            .stderr
            .as_deref()
            .is_none_or(|needle| stderr_lower.contains(needle));
        code_ok && text_ok
    }
}

/// Ordered rule table mapping raw failures to [`ErrorKind`].
///
/// First match wins. A non-zero exit with no match is
/// [`ErrorKind::OperationFailed`]; a signal-terminated process (no exit
/// code) with no match is [`ErrorKind::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorTable {
    rules: Vec<ErrorRule>,
}

impl ErrorTable {
    /// Creates a table from an ordered rule list.
    pub fn new(rules: Vec<ErrorRule>) -> Self {
        Self { rules }
    }

    /// Returns a copy of this table with `rule` evaluated before all others.
    #[must_use]
    pub fn with_rule_first(mut self, rule: ErrorRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    /// Classifies a failed invocation.
    pub fn classify(&self, exit_code: Option<i32>, stderr: &str) -> ErrorKind {
        let lower = stderr.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(exit_code, &lower))
            .map(|rule| rule.kind)
            .unwrap_or(match exit_code {
                Some(_) => ErrorKind::OperationFailed,
                None => ErrorKind::Unknown,
            })
    }
}

impl Default for ErrorTable {
    fn default() -> Self {
        use ErrorKind::*;
        Self::new(vec![
            ErrorRule::exit_code(124, Timeout),
            ErrorRule::stderr("timed out", Timeout),
            ErrorRule::stderr("permission denied", PermissionDenied),
            ErrorRule::stderr("operation not permitted", PermissionDenied),
            ErrorRule::stderr("permission check failed", PermissionDenied),
            ErrorRule::exit_code(126, PermissionDenied),
            ErrorRule::stderr("connection reset", NetworkError),
            ErrorRule::stderr("connection refused", NetworkError),
            ErrorRule::stderr("broken pipe", NetworkError),
            ErrorRule::stderr("network is unreachable", NetworkError),
            ErrorRule::stderr("already exists", AlreadyExists),
            ErrorRule::stderr("does not exist", NotFound),
            ErrorRule::stderr("not found", NotFound),
            ErrorRule::stderr("no such", NotFound),
            ErrorRule::stderr("parameter verification failed", InvalidInput),
            ErrorRule::stderr("unknown option", InvalidInput),
            ErrorRule::stderr("usage:", InvalidInput),
            ErrorRule::stderr("invalid", InvalidInput),
            ErrorRule::exit_code(2, InvalidInput),
        ])
    }
}

// =============================================================================
// Exec Policy
// =============================================================================

/// Decides whether a failed attempt is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(Option<i32>, &str) -> bool + Send + Sync>;

/// Stderr fragments that indicate a transient condition.
const TRANSIENT_STDERR: [&str; 5] = [
    "connection reset",
    "temporarily unavailable",
    "try again",
    "can't lock file",
    "got timeout",
];

/// Default retry predicate: retries only known transient stderr.
pub fn transient_failure(_exit_code: Option<i32>, stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    TRANSIENT_STDERR.iter().any(|t| lower.contains(t))
}

/// Timeout and retry bounds for one invocation.
#[derive(Clone)]
pub struct ExecPolicy {
    /// Timeout per attempt.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retries: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
    /// Retry gate, evaluated on `(exit_code, stderr)`.
    pub retry_if: RetryPredicate,
    /// Whether exit 127 means the program itself is missing. False for
    /// commands that run another program inside a guest, where 127 comes
    /// from the guest's shell.
    pub exit_127_is_missing: bool,
}

impl std::fmt::Debug for ExecPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecPolicy")
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("backoff", &self.backoff)
            .field("exit_127_is_missing", &self.exit_127_is_missing)
            .finish_non_exhaustive()
    }
}

impl Default for ExecPolicy {
    fn default() -> Self {
        Self::new(COMMAND_TIMEOUT).with_retries(COMMAND_RETRIES, COMMAND_BACKOFF)
    }
}

impl ExecPolicy {
    /// Single attempt with the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            retries: 0,
            backoff: Duration::ZERO,
            retry_if: Arc::new(transient_failure),
            exit_127_is_missing: true,
        }
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_retry_if(
        mut self,
        predicate: impl Fn(Option<i32>, &str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_if = Arc::new(predicate);
        self
    }

    /// Same bounds, no retries.
    #[must_use]
    pub fn once(mut self) -> Self {
        self.retries = 0;
        self
    }

    /// Exit 127 is classified like any other failure instead of
    /// reporting the program as missing.
    #[must_use]
    pub fn in_guest(mut self) -> Self {
        self.exit_127_is_missing = false;
        self
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Wall time of the successful attempt.
    pub duration: Duration,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Runs external commands under an [`ExecPolicy`] and classifies failures.
#[derive(Clone)]
pub struct CommandExecutor {
    runner: Arc<dyn ProcessRunner>,
    table: ErrorTable,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(Arc::new(SystemRunner))
    }
}

impl CommandExecutor {
    /// Executor with the default error table.
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            table: ErrorTable::default(),
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: ErrorTable) -> Self {
        self.table = table;
        self
    }

    /// Returns the classification table.
    pub fn table(&self) -> &ErrorTable {
        &self.table
    }

    /// Runs `argv` until it succeeds, fails non-retryably, or runs out of
    /// attempts.
    ///
    /// # Errors
    ///
    /// - [`Error::BinaryNotFound`] when the program is missing (spawn
    ///   `ENOENT`, or exit 127 unless the policy runs [`ExecPolicy::in_guest`])
    /// - [`Error::Timeout`] when an attempt exceeds `policy.timeout`
    /// - [`Error::CommandFailed`] carrying the classified kind otherwise
    pub async fn run(&self, argv: &[String], policy: &ExecPolicy) -> Result<CommandOutput> {
        let program = argv
            .first()
            .ok_or_else(|| Error::InvalidRequest("empty command line".to_string()))?
            .clone();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            debug!(program = %program, attempt, "Running {}", argv.join(" "));

            let output = match tokio::time::timeout(policy.timeout, self.runner.run(argv)).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(program = %program, attempt, "Command timed out after {:?}", policy.timeout);
                    return Err(Error::Timeout {
                        operation: program,
                        duration: policy.timeout,
                    });
                }
            };

            if output.exit_code == Some(0) {
                return Ok(CommandOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    duration: started.elapsed(),
                    attempts: attempt,
                });
            }

            if policy.exit_127_is_missing && output.exit_code == Some(EXIT_COMMAND_NOT_FOUND) {
                return Err(Error::BinaryNotFound { program });
            }

            debug!(
                program = %program,
                attempt,
                exit_code = ?output.exit_code,
                stderr = %output.stderr.trim(),
                "Command failed"
            );

            if attempt <= policy.retries && (policy.retry_if)(output.exit_code, &output.stderr) {
                warn!(
                    program = %program,
                    attempt,
                    exit_code = ?output.exit_code,
                    "Transient failure, retrying in {:?}",
                    policy.backoff
                );
                tokio::time::sleep(policy.backoff).await;
                continue;
            }

            let kind = self.table.classify(output.exit_code, &output.stderr);
            return Err(Error::CommandFailed {
                program,
                kind,
                exit_code: output.exit_code,
                stderr: excerpt(&output.stderr),
            });
        }
    }
}

/// Truncates stderr to [`STDERR_EXCERPT_LEN`] bytes on a char boundary.
pub fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_EXCERPT_LEN {
        return trimmed.to_string();
    }
    let mut end = STDERR_EXCERPT_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
