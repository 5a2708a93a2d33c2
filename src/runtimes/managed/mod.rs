//! # Managed Container Driver
//!
//! Delegates the container lifecycle to the virtualization host's
//! container-management CLI (`pct` by default):
//!
//! | Operation | Invocation                                                 |
//! |-----------|------------------------------------------------------------|
//! | create    | `pct create <guest> <template> --hostname .. --storage ..` |
//! | start     | `pct start <guest>`                                        |
//! | stop/kill | see [`kill`](self::kill) protocol                          |
//! | delete    | `pct destroy <guest> --purge`                              |
//! | query     | `pct status <guest>` (+ pid probe when running)            |
//! | update    | `pct set <guest> --memory .. --cores ..`                   |
//!
//! Resource limits, namespace-derived feature flags and network aliases are
//! read back from the bundle's `config.json`, so the CLI sees exactly what
//! was persisted.
//!
//! ## Alternate Invocation Paths
//!
//! The CLI may live outside `PATH` on minimal hosts. Each invocation tries
//! the configured program first, then every alternate in order, moving on
//! only when the binary is missing. Any other failure stops the walk.

mod cli;
mod kill;

pub use self::cli::{parse_pid, parse_status};

use crate::bundle::OciBundle;
use crate::config::{ExecConfig, ManagedConfig};
use crate::error::{Error, Result};
use crate::executor::{CommandExecutor, CommandOutput, ExecPolicy};
use crate::request::ResourceLimits;
use crate::runtime::{ContainerDriver, ContainerStatus, KillOutcome, ObservedState, Signal};
use crate::runtimes::{find_in_path, guest_id};
use crate::selector::RuntimeKind;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Driver for containers managed by the host CLI.
pub struct ManagedContainerDriver {
    executor: CommandExecutor,
    config: ManagedConfig,
    policy: ExecPolicy,
    probe_policy: ExecPolicy,
    installed: Option<String>,
}

impl ManagedContainerDriver {
    /// Creates the driver. Looks up the CLI once.
    pub fn new(executor: CommandExecutor, config: ManagedConfig, exec: &ExecConfig) -> Self {
        let installed = std::iter::once(&config.cli)
            .chain(config.alternates.iter())
            .find(|program| find_in_path(program).is_some())
            .cloned();

        if let Some(program) = &installed {
            debug!("managed container CLI: {}", program);
        }

        Self {
            executor,
            config,
            policy: exec.policy(),
            probe_policy: exec.probe_policy(),
            installed,
        }
    }

    /// Returns the driver configuration.
    pub fn config(&self) -> &ManagedConfig {
        &self.config
    }

    /// Runs `<program> <args>` for the configured program and then each
    /// alternate while the binary is missing.
    ///
    /// Returns the result of the first invocation that found a binary, plus
    /// the number of invocations made.
    async fn run_cli(&self, args: &[String], policy: &ExecPolicy) -> (Result<CommandOutput>, u32) {
        let mut invocations = 0;
        for program in std::iter::once(&self.config.cli).chain(self.config.alternates.iter()) {
            invocations += 1;
            let argv: Vec<String> = std::iter::once(program.clone())
                .chain(args.iter().cloned())
                .collect();

            match self.executor.run(&argv, policy).await {
                Err(Error::BinaryNotFound { program }) => {
                    debug!("{} not found, trying next alternate", program);
                }
                result => return (result, invocations),
            }
        }

        let err = Error::RuntimeUnavailable {
            runtime: RuntimeKind::ManagedContainer.to_string(),
            reason: format!(
                "{} not found (alternates: {})",
                self.config.cli,
                self.config.alternates.join(", ")
            ),
        };
        (Err(err), invocations)
    }

    async fn cli(&self, args: Vec<String>) -> Result<CommandOutput> {
        self.run_cli(&args, &self.policy).await.0
    }

    async fn guest_status(&self, guest: u32) -> Result<ContainerStatus> {
        let args = vec!["status".to_string(), guest.to_string()];
        let output = self.run_cli(&args, &self.probe_policy).await.0?;
        cli::parse_status(&output.stdout)
    }

    /// Fetches the init pid. Falls back to 1 when the probe fails: the
    /// container is known to be running, so its init exists.
    async fn guest_pid(&self, id: &str, guest: u32) -> u32 {
        let argv = cli::pid_probe_argv(&self.config, guest);
        match self.executor.run(&argv, &self.probe_policy).await {
            Ok(output) => cli::parse_pid(&output.stdout).unwrap_or_else(|| {
                warn!(id, "Pid probe output unparsable, reporting pid 1");
                1
            }),
            Err(e) => {
                warn!(id, "Pid probe failed ({}), reporting pid 1", e);
                1
            }
        }
    }
}

#[async_trait]
impl ContainerDriver for ManagedContainerDriver {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::ManagedContainer
    }

    fn is_available(&self) -> bool {
        self.installed.is_some()
    }

    fn unavailable_reason(&self) -> Option<String> {
        match self.installed {
            Some(_) => None,
            None => Some(format!("{} not installed", self.config.cli)),
        }
    }

    async fn create(&self, id: &str, bundle: &OciBundle) -> Result<()> {
        let guest = guest_id(id);
        debug!(id, guest, "Creating managed container");
        let args = cli::create_args(&self.config, guest, bundle)?;
        self.cli(args).await?;
        info!(id, guest, "Created managed container");
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let guest = guest_id(id);
        self.cli(vec!["start".to_string(), guest.to_string()]).await?;
        info!(id, guest, "Started managed container");
        Ok(())
    }

    async fn stop(&self, id: &str, signal: Signal, timeout: Duration) -> Result<KillOutcome> {
        self.signal_and_confirm(id, signal, timeout).await
    }

    async fn kill(&self, id: &str, signal: Signal) -> Result<KillOutcome> {
        self.signal_and_confirm(id, signal, self.config.grace_period()).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let guest = guest_id(id);
        self.cli(vec![
            "destroy".to_string(),
            guest.to_string(),
            "--purge".to_string(),
        ])
        .await?;
        info!(id, guest, "Destroyed managed container");
        Ok(())
    }

    async fn query(&self, id: &str) -> Result<ObservedState> {
        let guest = guest_id(id);
        let status = self.guest_status(guest).await?;
        let pid = match status {
            ContainerStatus::Running => self.guest_pid(id, guest).await,
            _ => 0,
        };
        Ok(ObservedState::new(status, pid))
    }

    async fn update(&self, id: &str, resources: &ResourceLimits) -> Result<()> {
        let guest = guest_id(id);
        let mut args = vec!["set".to_string(), guest.to_string()];
        if let Some(bytes) = resources.memory_bytes {
            args.push("--memory".to_string());
            args.push(cli::mib(bytes).to_string());
        }
        if let Some(shares) = resources.cpu_shares {
            args.push("--cores".to_string());
            args.push(crate::bundle::cores_for_shares(shares).to_string());
        }
        if args.len() == 2 {
            return Err(Error::InvalidRequest("no resource changes given".to_string()));
        }
        self.cli(args).await?;
        info!(id, guest, "Updated managed container resources");
        Ok(())
    }
}
