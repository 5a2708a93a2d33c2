//! Snapshot storage boundary.
//!
//! Checkpoint and rollback of a container's storage are delegated to a
//! [`SnapshotStore`]. The orchestrator only decides *when* a snapshot is
//! legal (created or stopped containers) and which dataset it targets; the
//! store does the work.
//!
//! [`ZfsSnapshotStore`] drives the `zfs` CLI through the shared
//! [`CommandExecutor`], so its failures are classified like every other
//! backend command.

use crate::error::{Error, Result};
use crate::executor::{CommandExecutor, ExecPolicy};
use async_trait::async_trait;
use tracing::info;

/// A snapshot of one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub dataset: String,
    pub name: String,
}

impl SnapshotHandle {
    /// `dataset@name`.
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.dataset, self.name)
    }
}

impl std::fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.dataset, self.name)
    }
}

/// Creates and restores dataset snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Snapshots `dataset` under `name`.
    async fn create(&self, dataset: &str, name: &str) -> Result<SnapshotHandle>;

    /// Rolls `dataset` back to `name`, or to its newest snapshot when `name`
    /// is `None`.
    async fn rollback(&self, dataset: &str, name: Option<&str>) -> Result<SnapshotHandle>;
}

/// Validates a snapshot name.
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!("invalid snapshot name '{name}'")))
    }
}

/// Default snapshot name for a checkpoint taken now.
pub fn default_snapshot_name() -> String {
    format!("unirun-{}", chrono::Utc::now().format("%Y%m%d%H%M%S"))
}

/// [`SnapshotStore`] backed by the `zfs` CLI.
#[derive(Debug, Clone)]
pub struct ZfsSnapshotStore {
    executor: CommandExecutor,
    cli: String,
    policy: ExecPolicy,
}

impl ZfsSnapshotStore {
    pub fn new(executor: CommandExecutor, cli: impl Into<String>, policy: ExecPolicy) -> Self {
        Self {
            executor,
            cli: cli.into(),
            policy,
        }
    }

    fn argv(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.cli.clone())
            .chain(args.iter().map(|a| a.to_string()))
            .collect()
    }

    async fn newest(&self, dataset: &str) -> Result<String> {
        let argv = self.argv(&[
            "list", "-H", "-t", "snapshot", "-o", "name", "-s", "creation", "-d", "1", dataset,
        ]);
        let output = self.executor.run(&argv, &self.policy).await?;
        output
            .stdout
            .lines()
            .filter_map(|line| line.trim().split_once('@'))
            .map(|(_, name)| name.to_string())
            .next_back()
            .ok_or_else(|| Error::ContainerNotFound(format!("{dataset}: no snapshots")))
    }
}

#[async_trait]
impl SnapshotStore for ZfsSnapshotStore {
    async fn create(&self, dataset: &str, name: &str) -> Result<SnapshotHandle> {
        validate_snapshot_name(name)?;
        let handle = SnapshotHandle {
            dataset: dataset.to_string(),
            name: name.to_string(),
        };
        self.executor
            .run(&self.argv(&["snapshot", &handle.full_name()]), &self.policy)
            .await?;
        info!("Created snapshot {}", handle);
        Ok(handle)
    }

    async fn rollback(&self, dataset: &str, name: Option<&str>) -> Result<SnapshotHandle> {
        let name = match name {
            Some(name) => {
                validate_snapshot_name(name)?;
                name.to_string()
            }
            None => self.newest(dataset).await?,
        };
        let handle = SnapshotHandle {
            dataset: dataset.to_string(),
            name,
        };
        self.executor
            .run(&self.argv(&["rollback", "-r", &handle.full_name()]), &self.policy)
            .await?;
        info!("Rolled back to snapshot {}", handle);
        Ok(handle)
    }
}
