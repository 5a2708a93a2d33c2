//! # Lifecycle Orchestrator
//!
//! Drives the per-container state machine and dispatches each operation to
//! the backend recorded for the container.
//!
//! ## State Machine
//!
//! ```text
//!            create                start
//!   (none) ─────────▶ creating ─▶ created ─────────▶ running
//!                        │           │                  │
//!                        │           │ stop / kill      │ stop / kill
//!                        │           ▼                  ▼
//!                        │        stopped ◀─────────────┘
//!                        │           │
//!                        │ delete    │ delete
//!                        │ --force   ▼
//!                        └──────▶ (removed)
//! ```
//!
//! `created` may also be deleted directly. `running` can only be deleted
//! with `--force`, which sends SIGKILL first.
//!
//! ## Operation Protocol
//!
//! Every mutating operation:
//!
//! 1. takes the per-id lock (fails fast with `OperationInProgress`)
//! 2. loads the persisted state (`NotFound` if absent, except for create)
//! 3. checks the transition is legal (`InvalidState` otherwise)
//! 4. calls the driver
//! 5. persists the new state, only after the driver succeeded
//!
//! A failed operation leaves the persisted state untouched. The exception is
//! create: its failure removes both the bundle and the `creating` record, so
//! nothing is left behind for the id.

use crate::bundle::SpecBuilder;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::CommandExecutor;
use crate::image::{ImageProvider, LocalImageProvider};
use crate::request::{ContainerRequest, ResourceLimits};
use crate::runtime::{ContainerDriver, ContainerState, ContainerStatus, ObservedState, Signal};
use crate::runtimes::BackendSet;
use crate::selector::{RuleTable, select};
use crate::snapshot::{
    SnapshotHandle, SnapshotStore, ZfsSnapshotStore, default_snapshot_name, validate_snapshot_name,
};
use crate::state::StateStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Coordinates selection, bundle building, drivers and persisted state.
pub struct LifecycleOrchestrator {
    config: Config,
    store: StateStore,
    builder: SpecBuilder,
    backends: BackendSet,
    rules: RuleTable,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl LifecycleOrchestrator {
    /// Creates an orchestrator from explicit collaborators.
    pub fn new(
        config: Config,
        backends: BackendSet,
        images: Arc<dyn ImageProvider>,
    ) -> Result<Self> {
        let rules = config.rule_table()?;
        let store = StateStore::new(&config.state_root)?;
        let builder = SpecBuilder::new(&config.bundle_root, images)?;
        Ok(Self {
            config,
            store,
            builder,
            backends,
            rules,
            snapshots: None,
        })
    }

    /// Creates an orchestrator with every compiled-in backend, the local
    /// image provider and, if a dataset template is configured, the `zfs`
    /// snapshot store.
    pub fn from_config(config: Config) -> Result<Self> {
        let executor = CommandExecutor::default();
        let backends = BackendSet::from_config(&config, &executor);
        let images = Arc::new(LocalImageProvider::new(&config.image_root));

        let snapshots: Option<Arc<dyn SnapshotStore>> =
            config.snapshot.dataset_template.as_ref().map(|_| {
                Arc::new(ZfsSnapshotStore::new(
                    executor.clone(),
                    config.snapshot.cli.clone(),
                    config.exec.policy(),
                )) as Arc<dyn SnapshotStore>
            });

        let mut orchestrator = Self::new(config, backends, images)?;
        orchestrator.snapshots = snapshots;
        Ok(orchestrator)
    }

    /// Attaches a snapshot store.
    #[must_use]
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the state store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Returns the backend set.
    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    fn driver(&self, state: &ContainerState) -> Result<&dyn ContainerDriver> {
        self.backends.get(state.runtime_kind)
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Creates a container: selects a backend, builds the bundle, records
    /// `creating`, calls the driver and records `created`.
    ///
    /// # Errors
    ///
    /// - validation errors before anything is written
    /// - [`Error::ContainerAlreadyExists`] if the id has state or a bundle
    /// - driver errors, after rolling back the bundle and state
    pub async fn create(&self, req: &ContainerRequest) -> Result<ContainerState> {
        let kind = select(&req.image, req.runtime.as_deref(), &self.rules)?;
        let _lock = self.store.lock(&req.id)?;

        if self.store.exists(&req.id) {
            return Err(Error::ContainerAlreadyExists(req.id.clone()));
        }
        let driver = self.backends.get(kind)?;

        let bundle = self.builder.build(req)?;
        let mut state = ContainerState::new(&req.id, bundle.path(), kind);
        state.annotations = bundle.spec().annotations.clone();

        if let Err(e) = self.store.save(&state) {
            self.discard(&req.id, bundle.path());
            return Err(e);
        }

        debug!(id = %req.id, runtime = %kind, "Invoking driver create");
        if let Err(e) = driver.create(&req.id, &bundle).await {
            warn!(id = %req.id, "Create failed, rolling back: {}", e);
            self.discard(&req.id, bundle.path());
            return Err(e);
        }

        state.set_status(ContainerStatus::Created, 0);
        if let Err(e) = self.store.save(&state) {
            warn!(id = %req.id, "Recording created state failed, rolling back: {}", e);
            if let Err(del) = driver.delete(&req.id).await {
                warn!(id = %req.id, "Driver cleanup failed: {}", del);
            }
            self.discard(&req.id, bundle.path());
            return Err(e);
        }

        info!(id = %req.id, runtime = %kind, "Created container");
        Ok(state)
    }

    /// Best-effort removal of a bundle and state record.
    fn discard(&self, id: &str, bundle: &Path) {
        if let Err(e) = remove_bundle(bundle) {
            warn!(id, "Failed to remove bundle {}: {}", bundle.display(), e);
        }
        if let Err(e) = self.store.remove(id) {
            warn!(id, "Failed to remove state: {}", e);
        }
    }

    // =========================================================================
    // Start / Stop / Kill
    // =========================================================================

    /// Starts a created container.
    pub async fn start(&self, id: &str) -> Result<ContainerState> {
        let _lock = self.store.lock(id)?;
        let mut state = self.store.load(id)?;
        require(&state, &[ContainerStatus::Created], "created")?;

        let driver = self.driver(&state)?;
        driver.start(id).await?;

        let observed = match driver.query(id).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(id, "Started but query failed ({}), recording running", e);
                ObservedState::new(ContainerStatus::Running, 1)
            }
        };
        state.set_status(observed.status, observed.pid);
        self.store.save(&state)?;

        info!(id, pid = state.pid, "Started container");
        Ok(state)
    }

    /// Stops a container, escalating within `timeout` as the backend does.
    ///
    /// A container already recorded as stopped is returned as is.
    pub async fn stop(&self, id: &str, signal: Signal, timeout: Duration) -> Result<ContainerState> {
        let _lock = self.store.lock(id)?;
        let mut state = self.store.load(id)?;
        if state.status == ContainerStatus::Stopped {
            debug!(id, "Already stopped");
            return Ok(state);
        }
        require(&state, &ACTIVE, "creating, created or running")?;

        let outcome = self.driver(&state)?.stop(id, signal, timeout).await?;
        let pid = state.pid;
        state.set_status(outcome.status, pid);
        self.store.save(&state)?;

        info!(id, signal_attempts = outcome.signal_attempts, "Stopped container");
        Ok(state)
    }

    /// Sends a signal, then records what the backend observes.
    pub async fn kill(&self, id: &str, signal: Signal) -> Result<ContainerState> {
        let _lock = self.store.lock(id)?;
        let mut state = self.store.load(id)?;
        if state.status == ContainerStatus::Stopped {
            debug!(id, "Already stopped, {} not sent", signal);
            return Ok(state);
        }
        require(&state, &ACTIVE, "creating, created or running")?;

        let driver = self.driver(&state)?;
        let outcome = driver.kill(id, signal).await?;

        let observed = match driver.query(id).await {
            Ok(observed) => observed,
            Err(e) if e.is_not_found() => ObservedState::stopped(),
            Err(e) => {
                warn!(id, "Query after {} failed ({}), using kill outcome", signal, e);
                ObservedState::new(outcome.status, state.pid)
            }
        };
        state.set_status(observed.status, observed.pid);
        self.store.save(&state)?;

        info!(id, signal_attempts = outcome.signal_attempts, status = %state.status, "Signalled container");
        Ok(state)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Tears a container down and removes its bundle and state.
    ///
    /// Without `force` the container must be `created` or `stopped`. With
    /// `force`, a running container is killed first, a `creating` leftover
    /// is accepted, and a backend that no longer knows the container counts
    /// as torn down.
    pub async fn delete(&self, id: &str, force: bool) -> Result<ContainerState> {
        let _lock = self.store.lock(id)?;
        let mut state = self.store.load(id)?;
        let driver = self.driver(&state)?;

        match state.status {
            ContainerStatus::Created | ContainerStatus::Stopped => {}
            ContainerStatus::Running if force => {
                info!(id, "Force delete: killing running container");
                match driver.kill(id, Signal::Kill).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(id, "Backend no longer knows the container");
                    }
                    Err(e) => return Err(e),
                }
            }
            ContainerStatus::Creating if force => {
                debug!(id, "Force delete of a creating leftover");
            }
            _ => {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    state: state.status.to_string(),
                    expected: "created or stopped (or --force)".to_string(),
                });
            }
        }

        match driver.delete(id).await {
            Ok(()) => {}
            Err(e) if force && e.is_not_found() => {
                warn!(id, "Backend has no record, treating as deleted: {}", e);
            }
            Err(e) => return Err(e),
        }

        // State goes first: a state file never outlives its bundle.
        self.store.remove(id)?;
        if let Err(e) = remove_bundle(&state.bundle) {
            warn!(id, "State removed but bundle {} remains: {}", state.bundle.display(), e);
            return Err(e);
        }

        state.set_status(ContainerStatus::Deleted, 0);
        info!(id, "Deleted container");
        Ok(state)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns the persisted state. Takes no lock: writes are atomic.
    pub fn state(&self, id: &str) -> Result<ContainerState> {
        self.store.load(id)
    }

    /// Lists every container with readable state, sorted by id.
    pub fn list(&self) -> Result<Vec<ContainerState>> {
        self.store.list()
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Applies new resource limits.
    pub async fn update(&self, id: &str, resources: &ResourceLimits) -> Result<ContainerState> {
        if resources.memory_bytes.is_none() && resources.cpu_shares.is_none() {
            return Err(Error::InvalidRequest("no resource changes given".to_string()));
        }
        if resources.memory_bytes == Some(0) || resources.cpu_shares == Some(0) {
            return Err(Error::InvalidRequest(
                "resource limits must be greater than zero".to_string(),
            ));
        }

        let _lock = self.store.lock(id)?;
        let state = self.store.load(id)?;
        require(
            &state,
            &[
                ContainerStatus::Created,
                ContainerStatus::Running,
                ContainerStatus::Stopped,
            ],
            "created, running or stopped",
        )?;

        self.driver(&state)?.update(id, resources).await?;
        info!(id, "Updated container resources");
        Ok(state)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    fn snapshot_target(&self, id: &str) -> Result<(&dyn SnapshotStore, String)> {
        let store = self
            .snapshots
            .as_deref()
            .ok_or_else(|| Error::RuntimeUnavailable {
                runtime: "snapshot".to_string(),
                reason: "no snapshot store configured".to_string(),
            })?;
        let dataset = self
            .config
            .snapshot
            .dataset(id)
            .ok_or_else(|| Error::RuntimeUnavailable {
                runtime: "snapshot".to_string(),
                reason: "no snapshot dataset template configured".to_string(),
            })?;
        Ok((store, dataset))
    }

    /// Snapshots the container's storage. The container must be `created`
    /// or `stopped`.
    pub async fn checkpoint(&self, id: &str, name: Option<&str>) -> Result<SnapshotHandle> {
        let (snapshots, dataset) = self.snapshot_target(id)?;
        let name = name.map_or_else(default_snapshot_name, str::to_string);
        validate_snapshot_name(&name)?;

        let _lock = self.store.lock(id)?;
        let state = self.store.load(id)?;
        require(&state, &QUIESCENT, "created or stopped")?;

        let handle = snapshots.create(&dataset, &name).await?;
        info!(id, snapshot = %handle, "Checkpointed container");
        Ok(handle)
    }

    /// Rolls the container's storage back to `name`, or to the newest
    /// snapshot. The container must be `created` or `stopped`.
    pub async fn rollback(&self, id: &str, name: Option<&str>) -> Result<SnapshotHandle> {
        let (snapshots, dataset) = self.snapshot_target(id)?;
        if let Some(name) = name {
            validate_snapshot_name(name)?;
        }

        let _lock = self.store.lock(id)?;
        let state = self.store.load(id)?;
        require(&state, &QUIESCENT, "created or stopped")?;

        let handle = snapshots.rollback(&dataset, name).await?;
        info!(id, snapshot = %handle, "Rolled back container");
        Ok(handle)
    }
}

const ACTIVE: [ContainerStatus; 3] = [
    ContainerStatus::Creating,
    ContainerStatus::Created,
    ContainerStatus::Running,
];

const QUIESCENT: [ContainerStatus; 2] = [ContainerStatus::Created, ContainerStatus::Stopped];

fn require(state: &ContainerState, allowed: &[ContainerStatus], expected: &str) -> Result<()> {
    if allowed.contains(&state.status) {
        return Ok(());
    }
    Err(Error::InvalidState {
        id: state.id.clone(),
        state: state.status.to_string(),
        expected: expected.to_string(),
    })
}

fn remove_bundle(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {
            debug!("Removed bundle {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

