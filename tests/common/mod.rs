//! Shared fakes for integration tests.
//!
//! - [`ScriptedRunner`]: a `ProcessRunner` that answers argv lines from a
//!   script and records every invocation
//! - [`FakeVmApi`]: a `VmApiClient` that answers (verb, path) pairs
//! - [`RecordingSnapshots`]: a `SnapshotStore` that records calls

#![allow(dead_code)]

use async_trait::async_trait;
#[cfg(feature = "vm")]
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use unirun::config::{ExecConfig, ManagedConfig, NativeConfig, VmConfig};
use unirun::error::{Error, Result};
use unirun::executor::{CommandExecutor, ProcessOutput, ProcessRunner};
#[cfg(feature = "vm")]
use unirun::runtimes::vm::{ApiResponse, HttpVerb, VmApiClient};
use unirun::snapshot::{SnapshotHandle, SnapshotStore};

// =============================================================================
// Scripted Process Runner
// =============================================================================

/// One scripted process result.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Exit 0 with stdout.
    Ok(&'static str),
    /// Exit with code and stderr.
    Fail(i32, &'static str),
    /// Spawn fails with ENOENT.
    Missing,
    /// Never finishes (the executor's timeout fires).
    Hang,
    /// Exit 0 with stdout after a delay.
    Slow(Duration, &'static str),
}

#[derive(Debug)]
enum Match {
    Prefix(String),
    Contains(String),
}

#[derive(Debug)]
struct Rule {
    matcher: Match,
    replies: VecDeque<Reply>,
    last: Reply,
}

/// Answers argv lines by the first matching rule.
///
/// A rule's replies are used in order; the last one repeats. Unmatched
/// commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, matcher: Match, replies: Vec<Reply>) {
        let last = replies.last().cloned().unwrap_or(Reply::Ok(""));
        self.rules.lock().unwrap().push(Rule {
            matcher,
            replies: replies.into(),
            last,
        });
    }

    /// Scripts commands whose joined argv starts with `prefix`.
    pub fn on(&self, prefix: &str, replies: Vec<Reply>) {
        self.push(Match::Prefix(prefix.to_string()), replies);
    }

    /// Scripts commands whose joined argv contains `needle`.
    pub fn on_contains(&self, needle: &str, replies: Vec<Reply>) {
        self.push(Match::Contains(needle.to_string()), replies);
    }

    /// Every invocation so far, argv joined by spaces.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of invocations whose joined argv contains `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }

    fn next_reply(&self, line: &str) -> Reply {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.iter_mut().find(|rule| match &rule.matcher {
            Match::Prefix(p) => line.starts_with(p.as_str()),
            Match::Contains(n) => line.contains(n.as_str()),
        });
        match rule {
            Some(rule) => rule.replies.pop_front().unwrap_or_else(|| rule.last.clone()),
            None => Reply::Ok(""),
        }
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, argv: &[String]) -> Result<ProcessOutput> {
        let line = argv.join(" ");
        self.calls.lock().unwrap().push(line.clone());

        match self.next_reply(&line) {
            Reply::Ok(stdout) => Ok(ProcessOutput::ok(stdout)),
            Reply::Fail(code, stderr) => Ok(ProcessOutput::failed(code, stderr)),
            Reply::Missing => Err(Error::BinaryNotFound {
                program: argv[0].clone(),
            }),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ProcessOutput::ok(""))
            }
            Reply::Slow(delay, stdout) => {
                tokio::time::sleep(delay).await;
                Ok(ProcessOutput::ok(stdout))
            }
        }
    }
}

/// Executor over a scripted runner.
pub fn executor(runner: &Arc<ScriptedRunner>) -> CommandExecutor {
    CommandExecutor::new(runner.clone())
}

/// Command bounds small enough for tests.
pub fn fast_exec() -> ExecConfig {
    ExecConfig {
        timeout_ms: 200,
        probe_timeout_ms: 200,
        retries: 1,
        backoff_ms: 1,
    }
}

/// Managed driver settings with millisecond polling.
pub fn fast_managed() -> ManagedConfig {
    ManagedConfig {
        stop_poll_attempts: 3,
        stop_poll_interval_ms: 1,
        grace_period_ms: 1000,
        ..ManagedConfig::default()
    }
}

/// Native driver settings that always use the CLI.
pub fn cli_native() -> NativeConfig {
    NativeConfig {
        prefer_library: false,
        ..NativeConfig::default()
    }
}

/// VM driver settings with millisecond polling.
pub fn fast_vm() -> VmConfig {
    VmConfig {
        node: "pve".to_string(),
        stop_poll_attempts: 3,
        stop_poll_interval_ms: 1,
        ..VmConfig::default()
    }
}

// =============================================================================
// Fake VM API
// =============================================================================

#[cfg(feature = "vm")]
/// A recorded API call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    pub verb: HttpVerb,
    pub path: String,
    pub body: Option<Value>,
}

#[cfg(feature = "vm")]
struct ApiRule {
    verb: HttpVerb,
    suffix: String,
    replies: VecDeque<ApiResponse>,
    last: ApiResponse,
}

#[cfg(feature = "vm")]
/// Answers calls by verb and path suffix; unmatched calls return `{}`.
#[derive(Default)]
pub struct FakeVmApi {
    rules: Mutex<Vec<ApiRule>>,
    calls: Mutex<Vec<ApiCall>>,
}

#[cfg(feature = "vm")]
impl FakeVmApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, verb: HttpVerb, suffix: &str, replies: Vec<ApiResponse>) {
        let last = replies
            .last()
            .cloned()
            .unwrap_or_else(|| ApiResponse::ok(serde_json::json!({})));
        self.rules.lock().unwrap().push(ApiRule {
            verb,
            suffix: suffix.to_string(),
            replies: replies.into(),
            last,
        });
    }

    /// Scripts `GET .../status/current` with a sequence of status words.
    pub fn statuses(&self, words: &[&str]) {
        let replies = words
            .iter()
            .map(|w| ApiResponse::ok(serde_json::json!({ "status": w, "pid": 3100 })))
            .collect();
        self.on(HttpVerb::Get, "/status/current", replies);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, verb: HttpVerb, suffix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.verb == verb && c.path.ends_with(suffix))
            .count()
    }
}

#[cfg(feature = "vm")]
#[async_trait]
impl VmApiClient for FakeVmApi {
    async fn call(&self, verb: HttpVerb, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        self.calls.lock().unwrap().push(ApiCall {
            verb,
            path: path.to_string(),
            body: body.cloned(),
        });

        let mut rules = self.rules.lock().unwrap();
        let reply = rules
            .iter_mut()
            .find(|r| r.verb == verb && path.ends_with(r.suffix.as_str()))
            .map(|r| r.replies.pop_front().unwrap_or_else(|| r.last.clone()))
            .unwrap_or_else(|| ApiResponse::ok(serde_json::json!({})));
        Ok(reply)
    }
}

// =============================================================================
// Recording Snapshot Store
// =============================================================================

#[derive(Debug, Default)]
pub struct RecordingSnapshots {
    pub created: Mutex<Vec<String>>,
    pub rolled_back: Mutex<Vec<String>>,
}

impl RecordingSnapshots {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SnapshotStore for RecordingSnapshots {
    async fn create(&self, dataset: &str, name: &str) -> Result<SnapshotHandle> {
        self.created.lock().unwrap().push(format!("{dataset}@{name}"));
        Ok(SnapshotHandle {
            dataset: dataset.to_string(),
            name: name.to_string(),
        })
    }

    async fn rollback(&self, dataset: &str, name: Option<&str>) -> Result<SnapshotHandle> {
        let name = name.unwrap_or("latest").to_string();
        self.rolled_back
            .lock()
            .unwrap()
            .push(format!("{dataset}@{name}"));
        Ok(SnapshotHandle {
            dataset: dataset.to_string(),
            name,
        })
    }
}

// =============================================================================
// Filesystem Helpers
// =============================================================================

/// Names of the entries directly under `dir` (empty if it does not exist).
pub fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| !n.starts_with('.'))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
