//! Backend drivers.
//!
//! The backend set is closed and known at compile time: each
//! [`RuntimeKind`] has exactly one driver, wrapped in the [`Backend`] enum.
//! Drivers probe their host once at construction; nothing re-probes per
//! call.
//!
//! | Kind                | Driver                    | Substrate                           |
//! |---------------------|---------------------------|-------------------------------------|
//! | `native`            | [`NativeRuntimeDriver`]   | libcontainer, or crun/runc/youki CLI |
//! | `managed-container` | [`ManagedContainerDriver`]| host container CLI (`pct`)          |
//! | `virtual-machine`   | [`VirtualMachineDriver`]  | virtualization manager API          |

#[cfg(feature = "managed")]
pub mod managed;
pub mod native;
#[cfg(feature = "vm")]
pub mod vm;

#[cfg(feature = "managed")]
pub use self::managed::ManagedContainerDriver;
pub use self::native::NativeRuntimeDriver;
#[cfg(feature = "vm")]
pub use self::vm::{PveshApiClient, VirtualMachineDriver, VmApiClient};

use crate::bundle::OciBundle;
use crate::config::Config;
use crate::constants::{GUEST_ID_MAX, GUEST_ID_MIN, GUEST_ID_VERBATIM_MIN};
use crate::error::{Error, Result};
use crate::executor::CommandExecutor;
use crate::runtime::{ContainerDriver, ContainerStatus};
use crate::selector::RuntimeKind;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Backend Dispatch
// =============================================================================

/// One compiled-in backend.
pub enum Backend {
    Native(NativeRuntimeDriver),
    #[cfg(feature = "managed")]
    Managed(ManagedContainerDriver),
    #[cfg(feature = "vm")]
    Vm(VirtualMachineDriver),
}

impl Backend {
    /// Returns the backend's kind.
    pub fn kind(&self) -> RuntimeKind {
        self.as_driver().kind()
    }

    /// Returns the backend as a lifecycle driver.
    pub fn as_driver(&self) -> &dyn ContainerDriver {
        match self {
            Self::Native(driver) => driver,
            #[cfg(feature = "managed")]
            Self::Managed(driver) => driver,
            #[cfg(feature = "vm")]
            Self::Vm(driver) => driver,
        }
    }
}

/// The backends available to an orchestrator, one per kind.
pub struct BackendSet {
    backends: Vec<Backend>,
}

impl BackendSet {
    /// Creates a set from explicit backends. Later entries for the same kind
    /// replace earlier ones.
    pub fn new(backends: Vec<Backend>) -> Self {
        let mut set = Self {
            backends: Vec::new(),
        };
        for backend in backends {
            set.insert(backend);
        }
        set
    }

    /// Builds every compiled-in backend from configuration.
    pub fn from_config(config: &Config, executor: &CommandExecutor) -> Self {
        let mut backends = vec![Backend::Native(NativeRuntimeDriver::new(
            config.native_root(),
            executor.clone(),
            config.native.clone(),
            &config.exec,
        ))];

        #[cfg(feature = "managed")]
        backends.push(Backend::Managed(ManagedContainerDriver::new(
            executor.clone(),
            config.managed.clone(),
            &config.exec,
        )));

        #[cfg(feature = "vm")]
        {
            let client = PveshApiClient::new(
                executor.clone(),
                config.vm.api_cli.clone(),
                config.exec.policy(),
            );
            backends.push(Backend::Vm(VirtualMachineDriver::new(
                std::sync::Arc::new(client),
                config.vm.clone(),
            )));
        }

        Self::new(backends)
    }

    /// Adds or replaces the backend for its kind.
    pub fn insert(&mut self, backend: Backend) {
        let kind = backend.kind();
        self.backends.retain(|b| b.kind() != kind);
        self.backends.push(backend);
    }

    /// Returns the driver for a kind.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedRuntime`] if no backend of that kind is present.
    pub fn get(&self, kind: RuntimeKind) -> Result<&dyn ContainerDriver> {
        self.backends
            .iter()
            .find(|b| b.kind() == kind)
            .map(Backend::as_driver)
            .ok_or_else(|| Error::UnsupportedRuntime(format!("{kind} backend not configured")))
    }

    /// Kinds present in this set.
    pub fn kinds(&self) -> Vec<RuntimeKind> {
        self.backends.iter().map(Backend::kind).collect()
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Numeric guest id for a container id.
///
/// The virtualization host addresses guests by number. A canonical decimal
/// id (no leading zero) in `[GUEST_ID_VERBATIM_MIN, GUEST_ID_MIN)` is used
/// verbatim; anything else maps to a stable id in
/// `[GUEST_ID_MIN, GUEST_ID_MAX]` derived from its SHA-256. The two ranges
/// are disjoint, so distinct container ids never share a verbatim guest.
pub fn guest_id(id: &str) -> u32 {
    if !id.starts_with('0')
        && id.chars().all(|c| c.is_ascii_digit())
        && let Ok(n) = id.parse::<u32>()
        && (GUEST_ID_VERBATIM_MIN..GUEST_ID_MIN).contains(&n)
    {
        return n;
    }

    let digest = Sha256::digest(id.as_bytes());
    let n = digest[..8]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    let span = u64::from(GUEST_ID_MAX - GUEST_ID_MIN) + 1;
    // n % span < span <= u32::MAX
    GUEST_ID_MIN + u32::try_from(n % span).unwrap_or(0)
}

/// Searches `PATH` for a program (or checks it directly if it has a `/`).
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Polls a driver until it reports `stopped`.
///
/// Returns `Ok(true)` once stopped, `Ok(false)` if every poll still saw the
/// container alive. Makes at most `attempts` queries, sleeping `interval`
/// between them.
pub async fn poll_until_stopped<D: ContainerDriver + ?Sized>(
    driver: &D,
    id: &str,
    attempts: u32,
    interval: Duration,
) -> Result<bool> {
    for attempt in 1..=attempts {
        let observed = driver.query(id).await?;
        if observed.status == ContainerStatus::Stopped {
            debug!(id, attempt, "Confirmed stopped");
            return Ok(true);
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(false)
}

/// Memory limit of a bundle in MiB, rounded up.
pub fn bundle_memory_mib(bundle: &OciBundle) -> Option<u64> {
    bundle
        .spec()
        .resources()
        .and_then(|r| r.memory.as_ref())
        .and_then(|m| m.limit)
        .and_then(|bytes| u64::try_from(bytes).ok())
        .map(|bytes| bytes.div_ceil(1024 * 1024))
}

/// Core count of a bundle.
pub fn bundle_cores(bundle: &OciBundle) -> Option<u64> {
    bundle
        .spec()
        .resources()
        .and_then(|r| r.cpu.as_ref())
        .and_then(|c| c.cores)
}
