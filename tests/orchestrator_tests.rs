//! Lifecycle orchestrator tests.
//!
//! Every backend is driven by fakes: the native and managed drivers share a
//! `ScriptedRunner`, the VM driver talks to a `FakeVmApi`.

#![cfg(all(feature = "managed", feature = "vm"))]

mod common;

use common::{
    FakeVmApi, RecordingSnapshots, Reply, ScriptedRunner, cli_native, entries, executor,
    fast_exec, fast_managed, fast_vm,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use unirun::config::Config;
use unirun::error::{Error, ErrorKind};
use unirun::image::LocalImageProvider;
use unirun::orchestrator::LifecycleOrchestrator;
use unirun::request::{ContainerRequest, ResourceLimits};
use unirun::runtime::{ContainerStatus, Signal};
use unirun::runtimes::{Backend, BackendSet, ManagedContainerDriver, NativeRuntimeDriver};
use unirun::runtimes::vm::{HttpVerb, VirtualMachineDriver};
use unirun::selector::RuntimeKind;

const RUNNING: Reply = Reply::Ok("status: running\n");
const STOPPED: Reply = Reply::Ok("status: stopped\n");

struct Harness {
    _dir: TempDir,
    config: Config,
    runner: Arc<ScriptedRunner>,
    api: Arc<FakeVmApi>,
    orchestrator: LifecycleOrchestrator,
}

fn harness() -> Harness {
    harness_with(|config| config)
}

fn harness_with(adjust: impl FnOnce(Config) -> Config) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = adjust(Config::rooted_at(dir.path()));
    let runner = ScriptedRunner::new();
    let api = FakeVmApi::new();

    let backends = BackendSet::new(vec![
        Backend::Native(NativeRuntimeDriver::new(
            config.native_root(),
            executor(&runner),
            cli_native(),
            &fast_exec(),
        )),
        Backend::Managed(ManagedContainerDriver::new(
            executor(&runner),
            fast_managed(),
            &fast_exec(),
        )),
        Backend::Vm(VirtualMachineDriver::new(api.clone(), fast_vm())),
    ]);
    let images = Arc::new(LocalImageProvider::new(&config.image_root));
    let orchestrator = LifecycleOrchestrator::new(config.clone(), backends, images).unwrap();

    Harness {
        _dir: dir,
        config,
        runner,
        api,
        orchestrator,
    }
}

fn managed_request() -> ContainerRequest {
    ContainerRequest::new("101", "lxc/debian-12")
}

// =============================================================================
// Full Lifecycle
// =============================================================================

#[tokio::test]
async fn test_managed_lifecycle() {
    let h = harness();
    h.runner.on("pct status 101", vec![RUNNING, RUNNING, STOPPED]);
    h.runner.on("lxc-info -n 101 -p", vec![Reply::Ok("PID: 4242\n")]);
    let o = &h.orchestrator;

    let state = o.create(&managed_request()).await.unwrap();
    assert_eq!(state.status, ContainerStatus::Created);
    assert_eq!(state.runtime_kind, RuntimeKind::ManagedContainer);
    assert!(state.bundle.join("config.json").is_file());
    assert_eq!(h.runner.count("pct create 101"), 1);

    let state = o.start("101").await.unwrap();
    assert_eq!(state.status, ContainerStatus::Running);
    assert_eq!(state.pid, 4242);
    assert_eq!(o.state("101").unwrap().pid, 4242);

    let state = o
        .stop("101", Signal::Term, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(state.status, ContainerStatus::Stopped);
    assert_eq!(state.pid, 0);
    assert_eq!(h.runner.count("pct shutdown 101 --timeout 5"), 1);

    let state = o.delete("101", false).await.unwrap();
    assert_eq!(state.status, ContainerStatus::Deleted);
    assert_eq!(h.runner.count("pct destroy 101 --purge"), 1);

    assert!(o.state("101").unwrap_err().is_not_found());
    assert!(entries(&h.config.bundle_root).is_empty());
    assert!(o.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_native_start_records_runtime_pid() {
    let h = harness();
    h.runner.on_contains(
        " state web",
        vec![Reply::Ok(r#"{"ociVersion":"1.0.2","id":"web","status":"running","pid":77}"#)],
    );

    let state = h
        .orchestrator
        .create(&ContainerRequest::new("web", "docker.io/library/nginx:1.27"))
        .await
        .unwrap();
    assert_eq!(state.runtime_kind, RuntimeKind::Native);

    let root = h.config.native_root();
    assert_eq!(
        h.runner.calls()[0],
        format!(
            "crun --root {} create --bundle {} web",
            root.display(),
            state.bundle.display()
        )
    );

    let state = h.orchestrator.start("web").await.unwrap();
    assert_eq!(state.pid, 77);
    assert_eq!(h.runner.count("start web"), 1);
}

#[tokio::test]
async fn test_running_without_reported_pid_records_init() {
    let h = harness();
    h.runner.on_contains(" state web", vec![Reply::Ok(r#"{"status":"running"}"#)]);
    h.orchestrator
        .create(&ContainerRequest::new("web", "docker.io/library/nginx:1.27"))
        .await
        .unwrap();

    let state = h.orchestrator.start("web").await.unwrap();
    assert_eq!(state.status, ContainerStatus::Running);
    assert_eq!(state.pid, 1);
    assert_eq!(h.orchestrator.state("web").unwrap().pid, 1);
}

#[tokio::test]
async fn test_plain_image_creates_native_shell_container() {
    let h = harness();
    let state = h
        .orchestrator
        .create(&ContainerRequest::new("c1", "ubuntu:20.04"))
        .await
        .unwrap();
    assert_eq!(state.runtime_kind, RuntimeKind::Native);
    assert_eq!(state.status, ContainerStatus::Created);

    let config: serde_json::Value =
        serde_json::from_slice(&std::fs::read(state.bundle.join("config.json")).unwrap()).unwrap();
    assert_eq!(config["process"]["args"], serde_json::json!(["/bin/sh"]));

    let persisted: serde_json::Value =
        serde_json::from_slice(&std::fs::read(h.orchestrator.store().state_path("c1")).unwrap())
            .unwrap();
    assert_eq!(persisted["status"], "created");
}

#[tokio::test]
async fn test_lxc_image_floors_cpu_shares_to_one_core() {
    let h = harness();
    let state = h
        .orchestrator
        .create(&ContainerRequest::new("102", "lxc/debian12").with_cpu_shares(512))
        .await
        .unwrap();
    assert_eq!(state.runtime_kind, RuntimeKind::ManagedContainer);

    let config: serde_json::Value =
        serde_json::from_slice(&std::fs::read(state.bundle.join("config.json")).unwrap()).unwrap();
    assert_eq!(config["linux"]["resources"]["cpu"]["cores"], 1);
    assert_eq!(h.runner.count("--cores 1"), 1);
}

#[tokio::test]
async fn test_vm_lifecycle() {
    let h = harness();
    h.api.statuses(&["running"]);

    let state = h
        .orchestrator
        .create(&ContainerRequest::new("web", "vm-ubuntu-24.04"))
        .await
        .unwrap();
    assert_eq!(state.runtime_kind, RuntimeKind::VirtualMachine);

    let state = h.orchestrator.start("web").await.unwrap();
    assert_eq!(state.status, ContainerStatus::Running);
    assert_eq!(state.pid, 3100);
    assert_eq!(h.api.count(HttpVerb::Post, "/qemu"), 1);
    assert_eq!(h.api.count(HttpVerb::Post, "/status/start"), 1);
    assert!(h.runner.calls().is_empty());
}

#[tokio::test]
async fn test_list_is_sorted() {
    let h = harness();
    for id in ["103", "101", "102"] {
        h.orchestrator
            .create(&ContainerRequest::new(id, "lxc/debian-12"))
            .await
            .unwrap();
    }
    let ids: Vec<String> = h
        .orchestrator
        .list()
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, ["101", "102", "103"]);
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_twice_is_already_exists() {
    let h = harness();
    h.orchestrator.create(&managed_request()).await.unwrap();

    let err = h.orchestrator.create(&managed_request()).await.unwrap_err();
    assert!(matches!(err, Error::ContainerAlreadyExists(_)));
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(h.runner.count("pct create"), 1);
    assert_eq!(entries(&h.config.bundle_root), ["101"]);
}

#[tokio::test]
async fn test_failed_create_leaves_nothing_behind() {
    let h = harness();
    h.runner.on(
        "pct create",
        vec![Reply::Fail(255, "unable to create CT 101 - storage 'local-lvm' does not exist")],
    );

    let err = h.orchestrator.create(&managed_request()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert!(!h.orchestrator.store().exists("101"));
    assert!(entries(&h.config.bundle_root).is_empty());
    assert!(entries(&h.config.state_root).is_empty());
}

#[tokio::test]
async fn test_invalid_requests_write_nothing() {
    let h = harness();

    let err = h
        .orchestrator
        .create(&ContainerRequest::new("../escape", "lxc/debian-12"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = h
        .orchestrator
        .create(&ContainerRequest::new("101", "lxc/debian-12").with_runtime("hyperv"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedRuntime(_)));

    let err = h
        .orchestrator
        .create(&ContainerRequest::new("101", ""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    assert!(h.runner.calls().is_empty());
    assert!(entries(&h.config.bundle_root).is_empty());
    assert!(entries(&h.config.state_root).is_empty());
}

#[tokio::test]
async fn test_runtime_override_beats_rules() {
    let h = harness();
    let state = h
        .orchestrator
        .create(&ContainerRequest::new("101", "debian-12").with_runtime("lxc"))
        .await
        .unwrap();
    assert_eq!(state.runtime_kind, RuntimeKind::ManagedContainer);
}

// =============================================================================
// State Machine
// =============================================================================

#[tokio::test]
async fn test_start_requires_created() {
    let h = harness();
    h.runner.on("pct status 101", vec![RUNNING]);
    h.orchestrator.create(&managed_request()).await.unwrap();
    h.orchestrator.start("101").await.unwrap();

    let err = h.orchestrator.start("101").await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(h.runner.count("pct start 101"), 1);
}

#[tokio::test]
async fn test_operations_on_unknown_id_are_not_found() {
    let h = harness();
    assert!(h.orchestrator.start("404").await.unwrap_err().is_not_found());
    assert!(h.orchestrator.kill("404", Signal::Kill).await.unwrap_err().is_not_found());
    assert!(h.orchestrator.delete("404", true).await.unwrap_err().is_not_found());
    assert!(h.runner.calls().is_empty());
}

#[tokio::test]
async fn test_stop_on_stopped_makes_no_calls() {
    let h = harness();
    h.runner.on("pct status 101", vec![STOPPED]);
    h.orchestrator.create(&managed_request()).await.unwrap();

    let state = h
        .orchestrator
        .stop("101", Signal::Term, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(state.status, ContainerStatus::Stopped);
    let calls = h.runner.calls().len();

    h.orchestrator
        .stop("101", Signal::Term, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(h.runner.calls().len(), calls);
}

#[tokio::test]
async fn test_failed_driver_call_keeps_state() {
    let h = harness();
    h.runner.on("pct start 101", vec![Reply::Fail(1, "permission check failed")]);
    h.orchestrator.create(&managed_request()).await.unwrap();

    let err = h.orchestrator.start("101").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(h.orchestrator.state("101").unwrap().status, ContainerStatus::Created);
}

#[tokio::test]
async fn test_kill_records_observed_status() {
    let h = harness();
    h.runner.on("pct status 101", vec![RUNNING, RUNNING, RUNNING]);
    h.runner.on("lxc-info", vec![Reply::Ok("PID: 900\n")]);
    h.orchestrator.create(&managed_request()).await.unwrap();
    h.orchestrator.start("101").await.unwrap();

    let state = h.orchestrator.kill("101", Signal::Hup).await.unwrap();
    assert_eq!(state.status, ContainerStatus::Running);
    assert_eq!(state.pid, 900);
    assert_eq!(h.runner.count("kill -HUP 1"), 1);
}

// =============================================================================
// Delete
// =============================================================================

#[tokio::test]
async fn test_delete_running_requires_force() {
    let h = harness();
    h.runner.on("pct status 101", vec![RUNNING, RUNNING, STOPPED]);
    h.orchestrator.create(&managed_request()).await.unwrap();
    h.orchestrator.start("101").await.unwrap();

    let err = h.orchestrator.delete("101", false).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert!(h.orchestrator.store().exists("101"));
    assert_eq!(h.runner.count("destroy"), 0);

    h.orchestrator.delete("101", true).await.unwrap();
    assert_eq!(h.runner.count("pct stop 101"), 1);
    assert_eq!(h.runner.count("pct destroy 101 --purge"), 1);
    assert!(!h.orchestrator.store().exists("101"));
    assert!(entries(&h.config.bundle_root).is_empty());
}

#[tokio::test]
async fn test_delete_running_leaves_state_file_untouched() {
    let h = harness();
    h.runner.on("pct status 101", vec![RUNNING]);
    h.orchestrator.create(&managed_request()).await.unwrap();
    h.orchestrator.start("101").await.unwrap();
    let path = h.orchestrator.store().state_path("101");
    let before = std::fs::read(&path).unwrap();

    let err = h.orchestrator.delete("101", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert_eq!(err.exit_code(), 10);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn test_kill_after_out_of_band_stop() {
    let h = harness();
    // Running at start, stopped behind our back before the kill.
    h.runner.on("pct status 101", vec![RUNNING, STOPPED]);
    h.runner.on("lxc-info", vec![Reply::Ok("PID: 900\n")]);
    h.orchestrator.create(&managed_request()).await.unwrap();
    h.orchestrator.start("101").await.unwrap();

    let state = h.orchestrator.kill("101", Signal::Term).await.unwrap();
    assert_eq!(state.status, ContainerStatus::Stopped);
    assert_eq!(state.pid, 0);
    assert_eq!(h.runner.count("pct shutdown"), 0);
    assert_eq!(h.runner.count("pct exec"), 0);
    assert_eq!(h.orchestrator.state("101").unwrap().status, ContainerStatus::Stopped);

    // Once recorded as stopped, another kill neither signals nor rewrites.
    let path = h.orchestrator.store().state_path("101");
    let before = std::fs::read(&path).unwrap();
    let calls = h.runner.calls().len();
    let state = h.orchestrator.kill("101", Signal::Term).await.unwrap();
    assert_eq!(state.status, ContainerStatus::Stopped);
    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert_eq!(h.runner.calls().len(), calls);
}

#[tokio::test]
async fn test_delete_removes_state_before_bundle() {
    let h = harness();
    let state = h.orchestrator.create(&managed_request()).await.unwrap();
    // A bundle that cannot be removed as a directory.
    std::fs::remove_dir_all(&state.bundle).unwrap();
    std::fs::write(&state.bundle, b"not a directory").unwrap();

    assert!(h.orchestrator.delete("101", false).await.is_err());
    assert!(!h.orchestrator.store().exists("101"));
    assert_eq!(h.runner.count("pct destroy 101 --purge"), 1);
}

#[tokio::test]
async fn test_delete_backend_not_found() {
    let h = harness();
    h.runner.on("pct destroy", vec![Reply::Fail(2, "CT 101 does not exist")]);
    h.orchestrator.create(&managed_request()).await.unwrap();

    let err = h.orchestrator.delete("101", false).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(h.orchestrator.store().exists("101"));

    h.orchestrator.delete("101", true).await.unwrap();
    assert!(!h.orchestrator.store().exists("101"));
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn test_held_lock_is_operation_in_progress() {
    let h = harness();
    h.orchestrator.create(&managed_request()).await.unwrap();

    let held = h.orchestrator.store().lock("101").unwrap();
    let err = h.orchestrator.start("101").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationInProgress);
    assert_eq!(h.runner.count("pct start"), 0);

    drop(held);
    h.runner.on("pct status 101", vec![RUNNING]);
    h.orchestrator.start("101").await.unwrap();
}

#[tokio::test]
async fn test_concurrent_operations_on_one_id() {
    let h = harness();
    h.runner.on("pct start 101", vec![Reply::Slow(Duration::from_millis(50), "")]);
    h.runner.on("pct status 101", vec![RUNNING]);
    h.orchestrator.create(&managed_request()).await.unwrap();

    let (a, b) = tokio::join!(h.orchestrator.start("101"), h.orchestrator.start("101"));
    let results = [a, b];
    let in_progress = results
        .iter()
        .filter(|r| matches!(r, Err(Error::OperationInProgress(_))))
        .count();
    assert_eq!(in_progress, 1);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(h.runner.count("pct start 101"), 1);
}

#[tokio::test]
async fn test_different_ids_do_not_contend() {
    let h = harness();
    h.runner.on("pct start", vec![Reply::Slow(Duration::from_millis(20), "")]);
    h.runner.on("pct status", vec![RUNNING]);
    for id in ["101", "102"] {
        h.orchestrator
            .create(&ContainerRequest::new(id, "lxc/debian-12"))
            .await
            .unwrap();
    }

    let (a, b) = tokio::join!(h.orchestrator.start("101"), h.orchestrator.start("102"));
    assert!(a.is_ok());
    assert!(b.is_ok());
}

// =============================================================================
// Update
// =============================================================================

#[tokio::test]
async fn test_update_resources() {
    let h = harness();
    h.orchestrator.create(&managed_request()).await.unwrap();

    let limits = ResourceLimits {
        memory_bytes: Some(1024 * 1024 * 1024),
        cpu_shares: None,
    };
    let state = h.orchestrator.update("101", &limits).await.unwrap();
    assert_eq!(state.status, ContainerStatus::Created);
    assert_eq!(h.runner.count("pct set 101 --memory 1024"), 1);

    let err = h
        .orchestrator
        .update("101", &ResourceLimits::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let zero = ResourceLimits {
        memory_bytes: Some(0),
        cpu_shares: None,
    };
    let err = h.orchestrator.update("101", &zero).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(h.runner.count("pct set"), 1);
}

// =============================================================================
// Snapshots
// =============================================================================

#[tokio::test]
async fn test_checkpoint_and_rollback() {
    let h = harness_with(|c| c.with_snapshot_dataset("tank/ct/{id}"));
    let snapshots = RecordingSnapshots::new();
    let o = h.orchestrator.with_snapshot_store(snapshots.clone());
    o.create(&managed_request()).await.unwrap();

    let handle = o.checkpoint("101", Some("before-upgrade")).await.unwrap();
    assert_eq!(handle.full_name(), "tank/ct/101@before-upgrade");

    let handle = o.rollback("101", None).await.unwrap();
    assert_eq!(handle.name, "latest");

    assert_eq!(*snapshots.created.lock().unwrap(), ["tank/ct/101@before-upgrade"]);
    assert_eq!(*snapshots.rolled_back.lock().unwrap(), ["tank/ct/101@latest"]);

    let err = o.checkpoint("101", Some("bad name!")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_checkpoint_requires_quiescent_container() {
    let h = harness_with(|c| c.with_snapshot_dataset("tank/ct/{id}"));
    h.runner.on("pct status 101", vec![RUNNING]);
    let snapshots = RecordingSnapshots::new();
    let o = h.orchestrator.with_snapshot_store(snapshots.clone());
    o.create(&managed_request()).await.unwrap();
    o.start("101").await.unwrap();

    let err = o.checkpoint("101", Some("snap")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert!(snapshots.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_snapshots_unconfigured() {
    let h = harness();
    h.orchestrator.create(&managed_request()).await.unwrap();

    let err = h.orchestrator.checkpoint("101", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeUnavailable);

    let o = h.orchestrator.with_snapshot_store(RecordingSnapshots::new());
    let err = o.rollback("101", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeUnavailable);
}
