//! # unirun
//!
//! **One OCI-style lifecycle over native runtimes, host-managed containers
//! and virtual machines**
//!
//! This crate puts three incompatible execution substrates behind a single
//! create/start/stop/kill/delete/state contract, modelled on the OCI runtime
//! CLI and the Kubernetes CRI container service.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             unirun                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                  LifecycleOrchestrator                      │    │
//! │  │   per-id flock │ state machine │ atomic state.json          │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │          │                  │                      │                │
//! │  ┌───────┴──────┐  ┌────────┴────────┐  ┌──────────┴──────────┐     │
//! │  │   select()   │  │   SpecBuilder   │  │     StateStore      │     │
//! │  │  rule table  │  │ rootfs + config │  │  <root>/<id>/state  │     │
//! │  └──────────────┘  └─────────────────┘  └─────────────────────┘     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                    ContainerDriver backends                         │
//! │  ┌────────────────┐  ┌──────────────────┐  ┌────────────────────┐   │
//! │  │ NativeRuntime  │  │ ManagedContainer │  │  VirtualMachine    │   │
//! │  │ libcontainer / │  │   pct CLI via    │  │  manager API via   │   │
//! │  │ crun CLI       │  │ CommandExecutor  │  │  VmApiClient       │   │
//! │  └────────────────┘  └──────────────────┘  └────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   ┌─────────┐  create  ┌──────────┐      ┌─────────┐  start  ┌─────────┐
//!   │ (none)  │ ───────► │ Creating │ ───► │ Created │ ──────► │ Running │
//!   └─────────┘          └──────────┘      └────┬────┘         └────┬────┘
//!                                               │ stop / kill       │ stop / kill
//!                                               ▼                   ▼
//!                                          ┌─────────┐         ┌─────────┐
//!                                          │ Deleted │ ◄────── │ Stopped │
//!                                          └─────────┘  delete └─────────┘
//! ```
//!
//! # Errors and Exit Codes
//!
//! Every failure carries an [`ErrorKind`]; the CLI exits with
//! [`ErrorKind::exit_code`], which is stable across releases.
//!
//! # Feature Flags
//!
//! | Feature   | Backend                         | Default |
//! |-----------|---------------------------------|---------|
//! | `managed` | host CLI-managed containers     | yes     |
//! | `vm`      | virtualization manager VMs      | yes     |
//!
//! The native backend is always compiled in; its in-process library is
//! Linux only and falls back to an OCI runtime CLI elsewhere.
//!
//! # Example
//!
//! ```rust,ignore
//! use unirun::{Config, ContainerRequest, LifecycleOrchestrator, Signal};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> unirun::Result<()> {
//!     let orchestrator = LifecycleOrchestrator::from_config(Config::default())?;
//!     let request = ContainerRequest {
//!         id: "web".to_string(),
//!         image: "alpine:3.20".to_string(),
//!         ..Default::default()
//!     };
//!     orchestrator.create(&request).await?;
//!     orchestrator.start("web").await?;
//!     orchestrator.kill("web", Signal::Term).await?;
//!     orchestrator.delete("web", false).await?;
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod config;
pub mod constants;
pub mod error;
pub mod executor;
pub mod image;
pub mod orchestrator;
pub mod request;
pub mod runtime;
pub mod selector;
pub mod snapshot;
pub mod spec;
pub mod state;

pub mod runtimes;

// Re-exports
pub use bundle::{OciBundle, SpecBuilder};
pub use config::Config;
pub use constants::*;
pub use error::{Error, ErrorKind, Result};
pub use executor::{CommandExecutor, ErrorTable, ExecPolicy, ProcessRunner};
pub use image::{ImageConfig, ImageProvider, LocalImageProvider};
pub use orchestrator::LifecycleOrchestrator;
pub use request::{ContainerRequest, MountRequest, NamespaceRequest, NetAlias, ResourceLimits};
pub use runtime::{
    ContainerDriver, ContainerState, ContainerStatus, KillOutcome, ObservedState, Signal,
    StateDocument,
};
pub use runtimes::{Backend, BackendSet, NativeRuntimeDriver};
pub use selector::{RuleTable, RuntimeKind, SelectorRule, select};
pub use snapshot::{SnapshotHandle, SnapshotStore, ZfsSnapshotStore};
pub use spec::OciSpec;
pub use state::StateStore;
