//! Orchestrator configuration.
//!
//! [`Config`] gathers every tunable the orchestrator reads: storage roots,
//! the selector rule table, per-backend settings and command bounds. All
//! fields have defaults taken from [`crate::constants`], so an empty JSON
//! object (or `Config::default()`) is a complete configuration. The CLI
//! layers its flags and `UNIRUN_*` environment variables on top through the
//! `with_*` methods.
//!
//! Durations are stored as milliseconds so the serialized form stays plain
//! JSON numbers.

use crate::constants::{
    COMMAND_BACKOFF, COMMAND_RETRIES, COMMAND_TIMEOUT, DEFAULT_GRACE_PERIOD, LOCK_DIR,
    NATIVE_ROOT_DIR, PROBE_TIMEOUT, STOP_POLL_ATTEMPTS, STOP_POLL_INTERVAL,
};
use crate::error::Result;
use crate::executor::ExecPolicy;
use crate::selector::{RuleTable, SelectorRule};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Default Roots
// =============================================================================

/// Returns the platform-appropriate base directory.
///
/// - Linux: `/run/unirun` (tmpfs, ephemeral)
/// - macOS: `~/.unirun/run`
/// - Windows: `%LOCALAPPDATA%\unirun\run`
fn default_base_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/run/unirun")
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .map(|h| h.join(".unirun").join("run"))
            .unwrap_or_else(|| PathBuf::from(".unirun/run"))
    }

    #[cfg(target_os = "windows")]
    {
        dirs::data_local_dir()
            .map(|d| d.join("unirun").join("run"))
            .unwrap_or_else(|| PathBuf::from("unirun\\run"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        PathBuf::from("/run/unirun")
    }
}

/// Default state root (`<base>/state`).
pub fn default_state_root() -> PathBuf {
    default_base_dir().join("state")
}

/// Default bundle root (`<base>/bundles`).
pub fn default_bundle_root() -> PathBuf {
    default_base_dir().join("bundles")
}

/// Default image root. Images outlive reboots, so this is not under `/run`.
pub fn default_image_root() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/unirun/images")
    }

    #[cfg(not(target_os = "linux"))]
    {
        dirs::data_local_dir()
            .map(|d| d.join("unirun").join("images"))
            .unwrap_or_else(|| PathBuf::from(".unirun/images"))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Sections
// =============================================================================

/// Bounds applied to every external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Timeout for lifecycle commands.
    pub timeout_ms: u64,
    /// Timeout for status probes.
    pub probe_timeout_ms: u64,
    /// Retries for transient failures.
    pub retries: u32,
    /// Fixed backoff between retries.
    pub backoff_ms: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_ms: millis(COMMAND_TIMEOUT),
            probe_timeout_ms: millis(PROBE_TIMEOUT),
            retries: COMMAND_RETRIES,
            backoff_ms: millis(COMMAND_BACKOFF),
        }
    }
}

impl ExecConfig {
    /// Policy for lifecycle commands.
    pub fn policy(&self) -> ExecPolicy {
        ExecPolicy::new(Duration::from_millis(self.timeout_ms))
            .with_retries(self.retries, Duration::from_millis(self.backoff_ms))
    }

    /// Policy for status probes (same retries, shorter timeout).
    pub fn probe_policy(&self) -> ExecPolicy {
        ExecPolicy::new(Duration::from_millis(self.probe_timeout_ms))
            .with_retries(self.retries, Duration::from_millis(self.backoff_ms))
    }
}

/// Native runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    /// Use the in-process runtime library when the host supports it.
    pub prefer_library: bool,
    /// OCI runtime CLI used as fallback.
    pub cli: String,
    /// Alternates tried in order when `cli` is not installed.
    pub alternates: Vec<String>,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            prefer_library: true,
            cli: "crun".to_string(),
            alternates: vec!["runc".to_string(), "youki".to_string()],
        }
    }
}

/// Managed container (host CLI) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagedConfig {
    /// Container management CLI.
    pub cli: String,
    /// Alternate invocation paths tried when `cli` is not found.
    pub alternates: Vec<String>,
    /// Template reference; `{image}` is replaced by the image's last path
    /// segment.
    pub template: String,
    /// Storage the guest rootfs is allocated on.
    pub storage: String,
    /// Pid probe argv; `{guest}` is replaced by the guest id.
    pub pid_probe: Vec<String>,
    /// Exit codes of the signal command that may be misleading.
    pub misleading_exit_codes: Vec<i32>,
    /// Treat a misleading exit code as success once polling confirms stop.
    pub reclassify_misleading_exit_codes: bool,
    /// Status polls after a signal.
    pub stop_poll_attempts: u32,
    /// Interval between status polls.
    pub stop_poll_interval_ms: u64,
    /// Graceful shutdown period for `stop`.
    pub grace_period_ms: u64,
}

impl Default for ManagedConfig {
    fn default() -> Self {
        Self {
            cli: "pct".to_string(),
            alternates: vec!["/usr/sbin/pct".to_string(), "/usr/bin/pct".to_string()],
            template: "local:vztmpl/{image}".to_string(),
            storage: "local-lvm".to_string(),
            pid_probe: vec![
                "lxc-info".to_string(),
                "-n".to_string(),
                "{guest}".to_string(),
                "-p".to_string(),
            ],
            misleading_exit_codes: vec![255],
            reclassify_misleading_exit_codes: true,
            stop_poll_attempts: STOP_POLL_ATTEMPTS,
            stop_poll_interval_ms: millis(STOP_POLL_INTERVAL),
            grace_period_ms: millis(DEFAULT_GRACE_PERIOD),
        }
    }
}

impl ManagedConfig {
    /// Interval between status polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    /// Graceful shutdown period.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Virtual machine backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Cluster node the VMs live on.
    pub node: String,
    /// API client CLI.
    pub api_cli: String,
    /// Status polls after shutdown/stop.
    pub stop_poll_attempts: u32,
    /// Interval between status polls.
    pub stop_poll_interval_ms: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            node: "localhost".to_string(),
            api_cli: "pvesh".to_string(),
            stop_poll_attempts: STOP_POLL_ATTEMPTS,
            stop_poll_interval_ms: millis(STOP_POLL_INTERVAL),
        }
    }
}

impl VmConfig {
    /// Interval between status polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }
}

/// Snapshot store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Dataset name template; `{id}` is replaced by the container id.
    /// Snapshots are disabled when unset.
    pub dataset_template: Option<String>,
    /// Snapshot CLI.
    pub cli: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dataset_template: None,
            cli: "zfs".to_string(),
        }
    }
}

impl SnapshotConfig {
    /// Returns the dataset for a container, if snapshots are enabled.
    pub fn dataset(&self, id: &str) -> Option<String> {
        self.dataset_template
            .as_ref()
            .map(|template| template.replace("{id}", id))
    }
}

// =============================================================================
// Config
// =============================================================================

/// Complete orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of persisted state and lock files.
    pub state_root: PathBuf,
    /// Root under which bundles are built.
    pub bundle_root: PathBuf,
    /// Root of locally extracted images.
    pub image_root: PathBuf,
    /// Ordered runtime selection rules.
    pub rules: Vec<SelectorRule>,
    /// Command bounds.
    pub exec: ExecConfig,
    /// Native runtime section.
    pub native: NativeConfig,
    /// Managed container section.
    pub managed: ManagedConfig,
    /// Virtual machine section.
    pub vm: VmConfig,
    /// Snapshot section.
    pub snapshot: SnapshotConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_root: default_state_root(),
            bundle_root: default_bundle_root(),
            image_root: default_image_root(),
            rules: SelectorRule::defaults(),
            exec: ExecConfig::default(),
            native: NativeConfig::default(),
            managed: ManagedConfig::default(),
            vm: VmConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl Config {
    /// Config with all roots under one directory (used by tests and
    /// single-user setups).
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            state_root: base.join("state"),
            bundle_root: base.join("bundles"),
            image_root: base.join("images"),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_state_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_root = path.into();
        self
    }

    #[must_use]
    pub fn with_bundle_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.bundle_root = path.into();
        self
    }

    #[must_use]
    pub fn with_image_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_root = path.into();
        self
    }

    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.vm.node = node.into();
        self
    }

    #[must_use]
    pub fn with_snapshot_dataset(mut self, template: impl Into<String>) -> Self {
        self.snapshot.dataset_template = Some(template.into());
        self
    }

    /// Compiles the selector rules.
    pub fn rule_table(&self) -> Result<RuleTable> {
        RuleTable::new(&self.rules)
    }

    /// Directory holding per-id lock files.
    pub fn lock_dir(&self) -> PathBuf {
        self.state_root.join(LOCK_DIR)
    }

    /// Root directory handed to the native runtime.
    pub fn native_root(&self) -> PathBuf {
        self.state_root.join(NATIVE_ROOT_DIR)
    }
}
