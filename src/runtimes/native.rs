//! # Native Runtime Driver
//!
//! Runs containers on the local kernel through youki's `libcontainer`,
//! falling back to an OCI runtime CLI (`crun`, then `runc`, then `youki`)
//! when the library cannot be used.
//!
//! ## Capability Probe
//!
//! Evaluated once, when the driver is constructed:
//!
//! | Requirement          | Check                                  |
//! |----------------------|----------------------------------------|
//! | Linux                | compile time (`cfg(target_os)`)        |
//! | Namespace support    | `/proc/self/ns/pid` exists             |
//! | Cgroups v2           | `/sys/fs/cgroup/cgroup.controllers`    |
//! | Privileges           | effective uid 0                        |
//! | Runtime root         | `<state_root>/.native` creatable       |
//!
//! If any check fails, every operation goes to the CLI. A per-call library
//! failure that indicates a missing system service (cgroup manager, D-Bus)
//! is reported as [`Error::RuntimeUnavailable`] internally and also routed to
//! the CLI.
//!
//! ## Ownership
//!
//! Both paths share `<state_root>/.native` as their root. After create, an
//! operation uses the library only if the library's own state for the id
//! exists there; otherwise the CLI owns the container.
//!
//! Extension annotations (NUMA, RDT, network aliases) are ignored here.

use crate::bundle::OciBundle;
use crate::config::{ExecConfig, NativeConfig};
use crate::constants::{STOP_POLL_ATTEMPTS, STOP_POLL_INTERVAL};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{CommandExecutor, CommandOutput, ErrorTable, ExecPolicy};
use crate::request::ResourceLimits;
use crate::runtime::{ContainerDriver, ContainerStatus, KillOutcome, ObservedState, Signal};
use crate::runtimes::{find_in_path, poll_until_stopped};
use crate::selector::RuntimeKind;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use self::library::Library;

/// Library error text that means "the host cannot do this in-process".
const SERVICE_UNAVAILABLE_HINTS: [&str; 5] = [
    "dbus",
    "systemd",
    "cgroup controller",
    "no such device",
    "function not implemented",
];

/// Maps a library failure to an orchestrator error.
fn library_error(operation: &str, id: &str, err: impl std::fmt::Display) -> Error {
    let reason = err.to_string();
    let lower = reason.to_lowercase();
    if SERVICE_UNAVAILABLE_HINTS.iter().any(|h| lower.contains(h)) {
        return Error::RuntimeUnavailable {
            runtime: RuntimeKind::Native.to_string(),
            reason,
        };
    }
    Error::Driver {
        runtime: RuntimeKind::Native.to_string(),
        operation: operation.to_string(),
        id: id.to_string(),
        kind: ErrorTable::default().classify(Some(1), &reason),
        reason,
    }
}

// =============================================================================
// In-Process Library (Linux)
// =============================================================================

#[cfg(target_os = "linux")]
mod library {
    use super::library_error;
    use crate::error::{Error, Result};
    use crate::runtime::{ContainerStatus, ObservedState, Signal};
    use std::path::{Path, PathBuf};

    use libcontainer::container::builder::ContainerBuilder;
    use libcontainer::container::{Container, ContainerStatus as NativeStatus};
    use libcontainer::signal::Signal as LibcontainerSignal;
    use libcontainer::syscall::syscall::SyscallType;

    /// libcontainer bound to one root directory.
    pub(super) struct Library {
        root: PathBuf,
    }

    impl Library {
        /// Checks host capabilities.
        pub(super) fn probe(root: &Path) -> std::result::Result<Self, String> {
            if !Path::new("/proc/self/ns/pid").exists() {
                return Err("Linux namespaces not available".to_string());
            }
            if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
                return Err("cgroup v2 unified hierarchy not mounted".to_string());
            }
            if !nix::unistd::geteuid().is_root() {
                return Err("in-process runtime requires root".to_string());
            }
            std::fs::create_dir_all(root)
                .map_err(|e| format!("cannot create runtime root {}: {}", root.display(), e))?;
            Ok(Self {
                root: root.to_path_buf(),
            })
        }

        /// True if the library holds state for `id`.
        pub(super) fn owns(&self, id: &str) -> bool {
            self.root.join(id).join("state.json").exists()
        }

        fn load(&self, id: &str) -> Result<Container> {
            let container_dir = self.root.join(id);
            if !container_dir.exists() {
                return Err(Error::ContainerNotFound(id.to_string()));
            }
            Container::load(container_dir).map_err(|e| library_error("load", id, e))
        }

        pub(super) fn create(&self, id: &str, bundle: &Path) -> Result<()> {
            ContainerBuilder::new(id.to_string(), SyscallType::default())
                .with_root_path(&self.root)
                .map_err(|e| library_error("create", id, format!("invalid root path: {e}")))?
                .validate_id()
                .map_err(|e| library_error("create", id, format!("invalid container id: {e}")))?
                .as_init(bundle)
                .with_systemd(false)
                .build()
                .map_err(|e| library_error("create", id, e))?;
            Ok(())
        }

        pub(super) fn start(&self, id: &str) -> Result<()> {
            let mut container = self.load(id)?;
            container.start().map_err(|e| library_error("start", id, e))
        }

        pub(super) fn kill(&self, id: &str, signal: Signal) -> Result<()> {
            let mut container = self.load(id)?;
            let lc_signal = LibcontainerSignal::try_from(signal.to_string().as_str())
                .map_err(|e| Error::InvalidSignal(format!("{signal}: {e}")))?;
            container
                .kill(lc_signal, true)
                .map_err(|e| library_error("kill", id, e))
        }

        pub(super) fn delete(&self, id: &str) -> Result<()> {
            let mut container = self.load(id)?;
            container
                .delete(false)
                .map_err(|e| library_error("delete", id, e))
        }

        pub(super) fn state(&self, id: &str) -> Result<ObservedState> {
            let container = self.load(id)?;
            let status = match container.state.status {
                NativeStatus::Creating => ContainerStatus::Creating,
                NativeStatus::Created => ContainerStatus::Created,
                NativeStatus::Running | NativeStatus::Paused => ContainerStatus::Running,
                NativeStatus::Stopped => ContainerStatus::Stopped,
            };
            let pid = container
                .pid()
                .and_then(|p| u32::try_from(p.as_raw()).ok())
                .unwrap_or(0);
            Ok(ObservedState::new(status, pid))
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod library {
    use crate::error::{Error, Result};
    use crate::runtime::{ObservedState, Signal};
    use crate::selector::RuntimeKind;
    use std::path::Path;

    /// The in-process runtime needs Linux namespaces and cgroups.
    pub(super) struct Library;

    fn unavailable() -> Error {
        Error::RuntimeUnavailable {
            runtime: RuntimeKind::Native.to_string(),
            reason: "Linux required".to_string(),
        }
    }

    impl Library {
        pub(super) fn probe(_root: &Path) -> std::result::Result<Self, String> {
            Err("native runtime library requires Linux (namespaces, cgroups)".to_string())
        }

        pub(super) fn owns(&self, _id: &str) -> bool {
            false
        }

        pub(super) fn create(&self, _id: &str, _bundle: &Path) -> Result<()> {
            Err(unavailable())
        }

        pub(super) fn start(&self, _id: &str) -> Result<()> {
            Err(unavailable())
        }

        pub(super) fn kill(&self, _id: &str, _signal: Signal) -> Result<()> {
            Err(unavailable())
        }

        pub(super) fn delete(&self, _id: &str) -> Result<()> {
            Err(unavailable())
        }

        pub(super) fn state(&self, _id: &str) -> Result<ObservedState> {
            Err(unavailable())
        }
    }
}

// =============================================================================
// CLI State Output
// =============================================================================

/// Subset of the OCI `state` output printed by runtime CLIs.
#[derive(Debug, Deserialize)]
struct CliState {
    status: String,
    #[serde(default)]
    pid: i64,
}

fn parse_cli_state(id: &str, stdout: &str) -> Result<ObservedState> {
    let state: CliState = serde_json::from_str(stdout.trim()).map_err(|e| Error::Driver {
        runtime: RuntimeKind::Native.to_string(),
        operation: "state".to_string(),
        id: id.to_string(),
        kind: ErrorKind::Unknown,
        reason: format!("unparsable state output: {e}"),
    })?;

    let status = match state.status.as_str() {
        "creating" => ContainerStatus::Creating,
        "created" => ContainerStatus::Created,
        "running" | "paused" => ContainerStatus::Running,
        "stopped" => ContainerStatus::Stopped,
        other => {
            return Err(Error::Driver {
                runtime: RuntimeKind::Native.to_string(),
                operation: "state".to_string(),
                id: id.to_string(),
                kind: ErrorKind::Unknown,
                reason: format!("unknown status '{other}'"),
            });
        }
    };
    let pid = u32::try_from(state.pid).unwrap_or(0);
    Ok(ObservedState::new(status, pid))
}

// =============================================================================
// Driver
// =============================================================================

/// Driver for containers on the local kernel.
pub struct NativeRuntimeDriver {
    root: PathBuf,
    executor: CommandExecutor,
    config: NativeConfig,
    policy: ExecPolicy,
    probe_policy: ExecPolicy,
    library: Option<Library>,
    library_reason: Option<String>,
    cli_installed: Option<String>,
}

impl NativeRuntimeDriver {
    /// Creates the driver and runs the capability probe.
    pub fn new(
        root: impl Into<PathBuf>,
        executor: CommandExecutor,
        config: NativeConfig,
        exec: &ExecConfig,
    ) -> Self {
        let root = root.into();

        let (library, library_reason) = if config.prefer_library {
            match Library::probe(&root) {
                Ok(library) => {
                    info!("native runtime library available at {}", root.display());
                    (Some(library), None)
                }
                Err(reason) => {
                    debug!("native runtime library unavailable: {}", reason);
                    (None, Some(reason))
                }
            }
        } else {
            (None, Some("disabled by configuration".to_string()))
        };

        let cli_installed = std::iter::once(&config.cli)
            .chain(config.alternates.iter())
            .find(|program| find_in_path(program).is_some())
            .cloned();

        Self {
            root,
            executor,
            config,
            policy: exec.policy(),
            probe_policy: exec.probe_policy(),
            library,
            library_reason,
            cli_installed,
        }
    }

    /// True if operations go through the in-process library.
    pub fn uses_library(&self) -> bool {
        self.library.is_some()
    }

    /// Returns the runtime root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs an operation in-process if the library owns `id`.
    ///
    /// Returns `None` when the CLI should handle it instead.
    fn via_library<T>(
        &self,
        id: &str,
        op: impl FnOnce(&Library) -> Result<T>,
    ) -> Option<Result<T>> {
        let library = self.library.as_ref().filter(|l| l.owns(id))?;
        match op(library) {
            Err(Error::RuntimeUnavailable { reason, .. }) => {
                warn!(id, "Runtime library unavailable ({}), falling back to CLI", reason);
                None
            }
            result => Some(result),
        }
    }

    /// Runs `<cli> --root <root> <args>`, walking alternates while the
    /// binary is missing.
    async fn cli(&self, args: &[&str], policy: &ExecPolicy) -> Result<CommandOutput> {
        let root = self.root.to_string_lossy().to_string();
        for program in std::iter::once(&self.config.cli).chain(self.config.alternates.iter()) {
            let argv: Vec<String> = [program.as_str(), "--root", root.as_str()]
                .into_iter()
                .chain(args.iter().copied())
                .map(str::to_string)
                .collect();

            match self.executor.run(&argv, policy).await {
                Err(Error::BinaryNotFound { program }) => {
                    debug!("{} not found, trying next runtime CLI", program);
                }
                result => return result,
            }
        }

        Err(Error::RuntimeUnavailable {
            runtime: RuntimeKind::Native.to_string(),
            reason: format!(
                "runtime library unusable ({}) and no OCI runtime CLI found",
                self.library_reason.as_deref().unwrap_or("not probed")
            ),
        })
    }

    async fn send_signal(&self, id: &str, signal: Signal) -> Result<()> {
        if let Some(result) = self.via_library(id, |l| l.kill(id, signal)) {
            return result;
        }
        self.cli(&["kill", id, signal.short_name()], &self.policy)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ContainerDriver for NativeRuntimeDriver {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Native
    }

    fn is_available(&self) -> bool {
        self.library.is_some() || self.cli_installed.is_some()
    }

    fn unavailable_reason(&self) -> Option<String> {
        if self.is_available() {
            return None;
        }
        Some(format!(
            "{}; {} not installed",
            self.library_reason.as_deref().unwrap_or("runtime library unavailable"),
            self.config.cli
        ))
    }

    async fn create(&self, id: &str, bundle: &OciBundle) -> Result<()> {
        debug!(id, "Creating native container from {}", bundle.path().display());

        if let Some(library) = &self.library {
            match library.create(id, bundle.path()) {
                Ok(()) => {
                    info!(id, "Created native container (in-process)");
                    return Ok(());
                }
                Err(Error::RuntimeUnavailable { reason, .. }) => {
                    warn!(id, "Runtime library unavailable ({}), falling back to CLI", reason);
                    // Partial library state would make the CLI report a
                    // collision.
                    let partial = self.root.join(id);
                    if let Err(e) = std::fs::remove_dir_all(&partial)
                        && e.kind() != std::io::ErrorKind::NotFound
                    {
                        warn!(id, "Failed to remove {}: {}", partial.display(), e);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let bundle_path = bundle.path().to_string_lossy().to_string();
        self.cli(&["create", "--bundle", &bundle_path, id], &self.policy)
            .await?;
        info!(id, "Created native container");
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        if let Some(result) = self.via_library(id, |l| l.start(id)) {
            return result;
        }
        self.cli(&["start", id], &self.policy).await?;
        info!(id, "Started native container");
        Ok(())
    }

    async fn stop(&self, id: &str, signal: Signal, timeout: Duration) -> Result<KillOutcome> {
        if self.query(id).await?.status == ContainerStatus::Stopped {
            return Ok(KillOutcome::already_stopped());
        }

        self.send_signal(id, signal).await?;
        let mut signal_attempts = 1;
        let grace_polls = u32::try_from(timeout.as_millis() / STOP_POLL_INTERVAL.as_millis())
            .unwrap_or(u32::MAX)
            .max(1);
        if poll_until_stopped(self, id, grace_polls, STOP_POLL_INTERVAL).await? {
            return Ok(KillOutcome {
                signal_attempts,
                status: ContainerStatus::Stopped,
            });
        }

        if signal != Signal::Kill {
            warn!(id, "Still running after {:?}, escalating to SIGKILL", timeout);
            self.send_signal(id, Signal::Kill).await?;
            signal_attempts += 1;
            if poll_until_stopped(self, id, STOP_POLL_ATTEMPTS, STOP_POLL_INTERVAL).await? {
                return Ok(KillOutcome {
                    signal_attempts,
                    status: ContainerStatus::Stopped,
                });
            }
        }

        Err(Error::Timeout {
            operation: format!("stop container '{id}'"),
            duration: timeout + STOP_POLL_INTERVAL * STOP_POLL_ATTEMPTS,
        })
    }

    async fn kill(&self, id: &str, signal: Signal) -> Result<KillOutcome> {
        if self.query(id).await?.status == ContainerStatus::Stopped {
            return Ok(KillOutcome::already_stopped());
        }

        self.send_signal(id, signal).await?;
        info!(id, "Sent {} to native container", signal);

        if matches!(signal, Signal::Term | Signal::Kill)
            && poll_until_stopped(self, id, STOP_POLL_ATTEMPTS, STOP_POLL_INTERVAL).await?
        {
            return Ok(KillOutcome {
                signal_attempts: 1,
                status: ContainerStatus::Stopped,
            });
        }

        Ok(KillOutcome {
            signal_attempts: 1,
            status: self.query(id).await?.status,
        })
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if let Some(result) = self.via_library(id, |l| l.delete(id)) {
            return result;
        }
        self.cli(&["delete", id], &self.policy).await?;
        info!(id, "Deleted native container");
        Ok(())
    }

    async fn query(&self, id: &str) -> Result<ObservedState> {
        if let Some(result) = self.via_library(id, |l| l.state(id)) {
            return result;
        }
        let output = self.cli(&["state", id], &self.probe_policy).await?;
        parse_cli_state(id, &output.stdout)
    }

    async fn update(&self, id: &str, resources: &ResourceLimits) -> Result<()> {
        let mut args: Vec<String> = vec!["update".to_string()];
        if let Some(bytes) = resources.memory_bytes {
            args.push("--memory".to_string());
            args.push(bytes.to_string());
        }
        if let Some(shares) = resources.cpu_shares {
            args.push("--cpu-share".to_string());
            args.push(shares.to_string());
        }
        if args.len() == 1 {
            return Err(Error::InvalidRequest("no resource changes given".to_string()));
        }
        args.push(id.to_string());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.cli(&args, &self.policy).await?;
        info!(id, "Updated native container resources");
        Ok(())
    }
}
