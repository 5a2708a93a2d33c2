//! Kill/stop protocol for managed containers.
//!
//! The host CLI has no uniform "send signal" primitive and some of its
//! subcommands exit non-zero even when the container did stop. The protocol
//! therefore trusts polled status over exit codes, within limits:
//!
//! ```text
//!   status == stopped ──────────────────────────────▶ Ok (0 attempts)
//!        │ no
//!        ▼
//!   signal command (cli, then alternates while binary missing)
//!        │
//!        ├── ok ─────────────────────┐
//!        ├── misleading exit code ───┤ (if reclassification enabled)
//!        └── other failure ──▶ Err   │
//!                                    ▼
//!                     poll status ≤ N times ──stopped──▶ Ok
//!                                    │ still running
//!                                    ▼
//!                                 Timeout
//! ```
//!
//! Only TERM and KILL are expected to end the container. Other signals are
//! delivered and the observed status is returned without waiting.

use super::ManagedContainerDriver;
use super::cli;
use crate::error::{Error, Result};
use crate::executor::EXIT_COMMAND_NOT_FOUND;
use crate::runtime::{ContainerStatus, KillOutcome, Signal};
use crate::runtimes::guest_id;
use std::time::Duration;
use tracing::{debug, info, warn};

impl ManagedContainerDriver {
    /// Returns true if `err` is a signal-command failure whose exit code is
    /// configured as possibly misleading.
    fn is_misleading(&self, err: &Error) -> bool {
        if !self.config.reclassify_misleading_exit_codes {
            return false;
        }
        match err {
            Error::CommandFailed {
                exit_code: Some(code),
                ..
            } => self.config.misleading_exit_codes.contains(code),
            _ => false,
        }
    }

    async fn wait_stopped(&self, id: &str, guest: u32) -> Result<bool> {
        let attempts = self.config.stop_poll_attempts;
        for attempt in 1..=attempts {
            if self.guest_status(guest).await? == ContainerStatus::Stopped {
                debug!(id, attempt, "Confirmed stopped");
                return Ok(true);
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }
        Ok(false)
    }

    pub(super) async fn signal_and_confirm(
        &self,
        id: &str,
        signal: Signal,
        grace: Duration,
    ) -> Result<KillOutcome> {
        let guest = guest_id(id);

        let status = self.guest_status(guest).await?;
        if status == ContainerStatus::Stopped {
            debug!(id, guest, "Already stopped, no signal sent");
            return Ok(KillOutcome::already_stopped());
        }

        let args = cli::signal_args(guest, signal, grace);
        let mut policy = self.policy.clone().once();
        if cli::is_guest_exec(&args) {
            policy = policy.in_guest();
        }
        let (result, signal_attempts) = self.run_cli(&args, &policy).await;
        let result = result.map_err(|e| match e {
            Error::CommandFailed {
                exit_code: Some(EXIT_COMMAND_NOT_FOUND),
                ..
            } if !policy.exit_127_is_missing => Error::NotSupported(format!(
                "{signal} to container '{id}': no kill command inside guest {guest}"
            )),
            e => e,
        });

        let misleading = match result {
            Ok(_) => None,
            Err(e) if self.is_misleading(&e) => {
                debug!(id, guest, "{} returned a possibly misleading failure: {}", signal, e);
                Some(e)
            }
            Err(e) => return Err(e),
        };

        if !matches!(signal, Signal::Term | Signal::Kill) {
            if let Some(e) = misleading {
                return Err(e);
            }
            return Ok(KillOutcome {
                signal_attempts,
                status: self.guest_status(guest).await?,
            });
        }

        if self.wait_stopped(id, guest).await? {
            if let Some(e) = misleading {
                warn!(
                    id,
                    "Signal command failed but container stopped, treating as success: {}",
                    e
                );
            }
            info!(id, guest, signal_attempts, "Stopped managed container");
            return Ok(KillOutcome {
                signal_attempts,
                status: ContainerStatus::Stopped,
            });
        }

        let waited = self.config.poll_interval() * self.config.stop_poll_attempts;
        warn!(id, guest, "Still running after {:?}", waited);
        Err(Error::Timeout {
            operation: format!("{signal} to container '{id}'"),
            duration: waited,
        })
    }
}
