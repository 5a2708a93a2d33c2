//! Driver trait and container state.
//!
//! [`ContainerDriver`] is the lifecycle contract every backend implements:
//!
//! ```text
//! create(id, bundle) → start(id) → stop(id, sig, timeout) | kill(id, sig) → delete(id)
//!                         query(id) at any point
//! ```
//!
//! Drivers are stateless with respect to the orchestrator's records: they
//! report what the backend observes ([`ObservedState`]), and the
//! orchestrator folds that into the persisted [`ContainerState`].
//!
//! The persisted form follows the OCI runtime `state` schema
//! ([`StateDocument`]); the in-memory form carries typed fields.
//!
//! Ref: <https://github.com/opencontainers/runtime-spec/blob/main/runtime.md#state>

use crate::bundle::OciBundle;
use crate::constants::{ANNOTATION_CREATED, ANNOTATION_RUNTIME_KIND, OCI_RUNTIME_SPEC_VERSION};
use crate::error::{Error, Result};
use crate::request::ResourceLimits;
use crate::selector::RuntimeKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Container Status
// =============================================================================

/// Container lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// State recorded, driver create in flight.
    Creating,
    /// Created but not started.
    Created,
    /// Running.
    Running,
    /// Stopped.
    Stopped,
    /// Torn down; never persisted, only reported.
    Deleted,
}

impl ContainerStatus {
    /// Returns the status name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
        }
    }

    /// True for statuses from which stop/kill make sense.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Creating | Self::Created | Self::Running)
    }

    /// True once the container is gone.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(Self::Creating),
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "deleted" => Ok(Self::Deleted),
            other => Err(Error::Internal(format!("unknown container status '{other}'"))),
        }
    }
}

// =============================================================================
// Container State
// =============================================================================

/// Persisted record of one container.
///
/// `pid` is non-zero exactly when `status` is [`ContainerStatus::Running`];
/// [`ContainerState::set_status`] maintains that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// Container ID.
    pub id: String,
    /// Lifecycle status.
    pub status: ContainerStatus,
    /// Init process PID (0 unless running).
    pub pid: u32,
    /// Absolute path to the bundle directory.
    pub bundle: PathBuf,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Backend that owns the container.
    pub runtime_kind: RuntimeKind,
    /// Annotations carried through from the bundle.
    pub annotations: BTreeMap<String, String>,
}

impl ContainerState {
    /// New state in `creating`.
    pub fn new(id: impl Into<String>, bundle: impl Into<PathBuf>, runtime_kind: RuntimeKind) -> Self {
        Self {
            id: id.into(),
            status: ContainerStatus::Creating,
            pid: 0,
            bundle: bundle.into(),
            created_at: Utc::now(),
            runtime_kind,
            annotations: BTreeMap::new(),
        }
    }

    /// Sets status and pid together; the pid is dropped unless running.
    ///
    /// A running container whose pid is unknown records pid 1 (its init),
    /// so `pid != 0` holds exactly when the status is running.
    pub fn set_status(&mut self, status: ContainerStatus, pid: u32) {
        self.status = status;
        self.pid = running_pid(status, pid);
    }

    /// Returns true if the container is running.
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Returns the bundle path.
    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    /// Converts to the OCI state document.
    pub fn to_document(&self) -> StateDocument {
        let mut annotations = self.annotations.clone();
        annotations.insert(
            ANNOTATION_RUNTIME_KIND.to_string(),
            self.runtime_kind.as_str().to_string(),
        );
        annotations.insert(ANNOTATION_CREATED.to_string(), self.created_at.to_rfc3339());

        StateDocument {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            id: self.id.clone(),
            status: self.status,
            pid: self.pid,
            bundle: self.bundle.to_string_lossy().to_string(),
            annotations,
        }
    }

    /// Parses an OCI state document.
    ///
    /// Fails if the runtime kind or creation time annotations are missing or
    /// malformed: without them the container cannot be re-dispatched.
    pub fn from_document(mut doc: StateDocument) -> Result<Self> {
        let kind = doc
            .annotations
            .remove(ANNOTATION_RUNTIME_KIND)
            .ok_or_else(|| Error::Serialization(format!("missing {ANNOTATION_RUNTIME_KIND}")))?;
        let runtime_kind: RuntimeKind = kind
            .parse()
            .map_err(|_| Error::Serialization(format!("unknown runtime kind '{kind}'")))?;

        let created = doc
            .annotations
            .remove(ANNOTATION_CREATED)
            .ok_or_else(|| Error::Serialization(format!("missing {ANNOTATION_CREATED}")))?;
        let created_at = DateTime::parse_from_rfc3339(&created)
            .map_err(|e| Error::Serialization(format!("bad creation time '{created}': {e}")))?
            .with_timezone(&Utc);

        let mut state = Self {
            id: doc.id,
            status: doc.status,
            pid: 0,
            bundle: PathBuf::from(doc.bundle),
            created_at,
            runtime_kind,
            annotations: doc.annotations,
        };
        state.set_status(doc.status, doc.pid);
        Ok(state)
    }
}

/// OCI runtime state document (`state.json`, and `state` CLI output).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    /// OCI version of the state schema.
    pub oci_version: String,
    /// Container ID.
    pub id: String,
    /// Container status.
    pub status: ContainerStatus,
    /// Init process PID (0 unless running).
    #[serde(default)]
    pub pid: u32,
    /// Absolute path to the bundle directory.
    pub bundle: String,
    /// Annotations, including runtime kind and creation time.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

// =============================================================================
// Driver Observations
// =============================================================================

/// What a backend reports about a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedState {
    pub status: ContainerStatus,
    /// 0 unless running (or unknown).
    pub pid: u32,
}

impl ObservedState {
    /// Pairs a status with a pid under the same rule as
    /// [`ContainerState::set_status`].
    pub fn new(status: ContainerStatus, pid: u32) -> Self {
        Self {
            status,
            pid: running_pid(status, pid),
        }
    }

    pub fn stopped() -> Self {
        Self::new(ContainerStatus::Stopped, 0)
    }
}

fn running_pid(status: ContainerStatus, pid: u32) -> u32 {
    match status {
        ContainerStatus::Running => pid.max(1),
        _ => 0,
    }
}

/// Result of a stop or kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillOutcome {
    /// Signal commands actually issued (0 when already stopped).
    pub signal_attempts: u32,
    /// Status observed after signalling.
    pub status: ContainerStatus,
}

impl KillOutcome {
    /// Outcome for a container that was already stopped.
    pub fn already_stopped() -> Self {
        Self {
            signal_attempts: 0,
            status: ContainerStatus::Stopped,
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Signal to send to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGHUP (hangup).
    Hup,
    /// SIGINT (interrupt).
    Int,
    /// SIGQUIT.
    Quit,
    /// SIGUSR1.
    Usr1,
    /// SIGUSR2.
    Usr2,
}

impl Signal {
    /// Returns the signal number.
    #[cfg(unix)]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Quit => libc::SIGQUIT,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
        }
    }

    #[cfg(not(unix))]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => 15,
            Self::Kill => 9,
            Self::Hup => 1,
            Self::Int => 2,
            Self::Quit => 3,
            Self::Usr1 => 10,
            Self::Usr2 => 12,
        }
    }

    /// Short name without the `SIG` prefix (as `kill -<NAME>` expects).
    pub const fn short_name(&self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Kill => "KILL",
            Self::Hup => "HUP",
            Self::Int => "INT",
            Self::Quit => "QUIT",
            Self::Usr1 => "USR1",
            Self::Usr2 => "USR2",
        }
    }
}

impl std::str::FromStr for Signal {
    type Err = Error;

    /// Parses a signal name or number (e.g. "SIGTERM", "TERM", "15").
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "TERM" | "15" => Ok(Self::Term),
            "KILL" | "9" => Ok(Self::Kill),
            "HUP" | "1" => Ok(Self::Hup),
            "INT" | "2" => Ok(Self::Int),
            "QUIT" | "3" => Ok(Self::Quit),
            "USR1" | "10" => Ok(Self::Usr1),
            "USR2" | "12" => Ok(Self::Usr2),
            _ => Err(Error::InvalidSignal(s.to_string())),
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SIG{}", self.short_name())
    }
}

// =============================================================================
// Driver Trait
// =============================================================================

/// Lifecycle contract implemented by every backend.
///
/// Errors are classified before they leave a driver: callers branch on
/// [`Error::kind`], never on raw exit codes.
///
/// # Implementations
///
/// - `NativeRuntimeDriver`: in-process library with OCI CLI fallback
/// - `ManagedContainerDriver`: host container-management CLI
/// - `VirtualMachineDriver`: virtualization manager API
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Backend family.
    fn kind(&self) -> RuntimeKind;

    /// Checks if this driver can be used on the current host.
    fn is_available(&self) -> bool;

    /// Returns the reason why this driver is unavailable (if any).
    fn unavailable_reason(&self) -> Option<String>;

    /// Creates the container from a built bundle. Does not start it.
    async fn create(&self, id: &str, bundle: &OciBundle) -> Result<()>;

    /// Starts a created container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Stops a container, escalating as the backend sees fit within
    /// `timeout`.
    async fn stop(&self, id: &str, signal: Signal, timeout: Duration) -> Result<KillOutcome>;

    /// Sends a signal to a container.
    async fn kill(&self, id: &str, signal: Signal) -> Result<KillOutcome>;

    /// Removes the container from the backend.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Reports the backend's view of the container.
    async fn query(&self, id: &str) -> Result<ObservedState>;

    /// Applies new resource limits to an existing container.
    async fn update(&self, id: &str, resources: &ResourceLimits) -> Result<()> {
        let _ = (id, resources);
        Err(Error::NotSupported(format!(
            "update not supported by {} driver",
            self.kind()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parsing() {
        assert_eq!("SIGTERM".parse::<Signal>().unwrap(), Signal::Term);
        assert_eq!("TERM".parse::<Signal>().unwrap(), Signal::Term);
        assert_eq!("15".parse::<Signal>().unwrap(), Signal::Term);
        assert_eq!("sigkill".parse::<Signal>().unwrap(), Signal::Kill);
        assert_eq!("9".parse::<Signal>().unwrap(), Signal::Kill);
        assert!("INVALID".parse::<Signal>().is_err());
    }

    #[test]
    fn test_pid_only_kept_while_running() {
        let mut state = ContainerState::new("c1", "/bundles/c1", RuntimeKind::Native);
        state.set_status(ContainerStatus::Running, 42);
        assert_eq!(state.pid, 42);
        state.set_status(ContainerStatus::Stopped, 42);
        assert_eq!(state.pid, 0);
    }

    #[test]
    fn test_document_roundtrip_keeps_typed_fields() {
        let mut state = ContainerState::new("c1", "/bundles/c1", RuntimeKind::ManagedContainer);
        state.set_status(ContainerStatus::Created, 0);
        let doc = state.to_document();
        assert_eq!(doc.annotations[ANNOTATION_RUNTIME_KIND], "managed-container");

        let back = ContainerState::from_document(doc).unwrap();
        assert_eq!(back.runtime_kind, RuntimeKind::ManagedContainer);
        assert_eq!(back.created_at.timestamp(), state.created_at.timestamp());
    }
}
