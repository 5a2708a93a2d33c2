//! OCI Runtime Bundle building.
//!
//! Converts a [`ContainerRequest`] into an OCI runtime bundle
//! (`<root>/<id>/{rootfs/, config.json}`), the format consumed by runtimes
//! like crun, runc and youki, and read back by the managed and VM drivers.
//!
//! ## Build Phases
//!
//! ```text
//!  request ──▶ synthesize (pure) ──▶ mkdir <root>/<id> ──▶ rootfs ──▶ config.json
//!                  │                        │                               │
//!            validation errors        guard armed               guard committed
//!            (nothing on disk)     (drop = remove_dir_all)
//! ```
//!
//! The spec is synthesized completely in memory before the bundle directory
//! is touched, so a request that fails validation leaves nothing behind.
//! Once the directory exists, a [`BundleGuard`] removes it again on any
//! later failure: bundle creation is all-or-nothing.
//!
//! ## Determinism
//!
//! `config.json` is written through [`OciSpec::to_canonical_json`], so the
//! same request (and image) always yields byte-identical output.

use crate::constants::{
    ANNOTATION_IMAGE, ANNOTATION_NET_ALIASES, ANNOTATION_NUMA_POLICY, ANNOTATION_RDT_PROFILE,
    CONFIG_FILE, CPU_SHARES_PER_CORE, DEFAULT_NOFILE_LIMIT, DEFAULT_PATH_ENV, MAX_NET_ALIASES,
    MAX_USER_MOUNTS, OCI_RUNTIME_SPEC_VERSION, ROOTFS_DIR, validate_container_id,
};
use crate::error::{Error, Result};
use crate::image::{ImageConfig, ImageProvider};
use crate::request::{ContainerRequest, MountRequest};
use crate::spec::{
    OciCapabilities, OciCpu, OciLinux, OciMemory, OciMount, OciNamespace, OciProcess,
    OciResources, OciRlimit, OciRoot, OciSpec, OciUser,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Namespaces every container gets.
const DEFAULT_NAMESPACES: [&str; 5] = ["pid", "network", "ipc", "uts", "mount"];

/// Capabilities granted by default (the conventional runc set).
const DEFAULT_CAPABILITIES: [&str; 14] = [
    "CAP_AUDIT_WRITE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_MKNOD",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_RAW",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_CHROOT",
];

const MASKED_PATHS: [&str; 10] = [
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/sys/firmware",
];

const READONLY_PATHS: [&str; 5] = [
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

// =============================================================================
// Bundle
// =============================================================================

/// A built bundle ready for a driver's `create`.
#[derive(Debug, Clone)]
pub struct OciBundle {
    /// Path to the bundle directory.
    path: PathBuf,
    /// Path to the root filesystem (inside the bundle or provider-owned).
    rootfs: PathBuf,
    /// The spec written to `config.json`.
    spec: OciSpec,
}

impl OciBundle {
    /// Opens an existing bundle by reading its `config.json`.
    pub fn open(path: &Path) -> Result<Self> {
        let spec = OciSpec::load(path)?;
        let root = Path::new(&spec.root.path);
        let rootfs = if root.is_absolute() {
            root.to_path_buf()
        } else {
            path.join(root)
        };
        Ok(Self {
            path: path.to_path_buf(),
            rootfs,
            spec,
        })
    }

    /// Returns the bundle directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the rootfs path.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Returns the OCI spec.
    pub fn spec(&self) -> &OciSpec {
        &self.spec
    }

    /// Returns the image reference recorded in the bundle.
    pub fn image(&self) -> Option<&str> {
        self.spec.annotation(ANNOTATION_IMAGE)
    }
}

// =============================================================================
// Rollback Guard
// =============================================================================

/// Removes a partially built bundle directory unless committed.
struct BundleGuard {
    path: PathBuf,
    committed: bool,
}

impl BundleGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for BundleGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!("Failed to roll back bundle {}: {}", self.path.display(), e);
        } else {
            debug!("Rolled back bundle {}", self.path.display());
        }
    }
}

// =============================================================================
// Spec Builder
// =============================================================================

/// Builder for OCI runtime bundles.
pub struct SpecBuilder {
    /// Base directory for bundles.
    root: PathBuf,
    /// Resolves image references to root filesystems.
    images: Arc<dyn ImageProvider>,
}

impl SpecBuilder {
    /// Creates a spec builder with a specific bundle root.
    pub fn new(root: impl Into<PathBuf>, images: Arc<dyn ImageProvider>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            Error::BundleBuildFailed(format!("cannot create bundle root {}: {}", root.display(), e))
        })?;
        Ok(Self { root, images })
    }

    /// Returns the bundle root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the bundle directory for a container id.
    pub fn bundle_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Builds the bundle for a request.
    ///
    /// # Errors
    ///
    /// - Validation errors (invalid id, mount, resources, missing entrypoint)
    ///   before anything is written
    /// - [`Error::ContainerAlreadyExists`] if `<root>/<id>` already exists
    /// - [`Error::BundleBuildFailed`] for I/O failures (the directory is
    ///   rolled back)
    pub fn build(&self, req: &ContainerRequest) -> Result<OciBundle> {
        validate_container_id(&req.id).map_err(|reason| Error::InvalidContainerId {
            id: req.id.clone(),
            reason: reason.to_string(),
        })?;

        let resolved = match self.images.resolve(&req.image) {
            Ok(path) => Some(path),
            Err(Error::ImageNotFound { .. }) => {
                debug!("Image {} not resolved locally, using empty rootfs", req.image);
                None
            }
            Err(e) => return Err(e),
        };
        let image_config = self.images.image_config(&req.image)?;
        let mut spec = self.synthesize(req, &image_config)?;

        let bundle_dir = self.bundle_path(&req.id);
        if bundle_dir.exists() {
            return Err(Error::ContainerAlreadyExists(req.id.clone()));
        }

        fs::create_dir(&bundle_dir).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => Error::ContainerAlreadyExists(req.id.clone()),
            _ => Error::BundleBuildFailed(format!("failed to create bundle dir: {e}")),
        })?;
        let guard = BundleGuard::new(bundle_dir.clone());

        let rootfs = match resolved {
            Some(path) => {
                spec.root.path = path.to_string_lossy().to_string();
                path
            }
            None => {
                let rootfs = bundle_dir.join(ROOTFS_DIR);
                fs::create_dir(&rootfs).map_err(|e| {
                    Error::BundleBuildFailed(format!("failed to create rootfs: {e}"))
                })?;
                rootfs
            }
        };

        let config_json = spec.to_canonical_json()?;
        fs::write(bundle_dir.join(CONFIG_FILE), config_json)
            .map_err(|e| Error::BundleBuildFailed(format!("failed to write config.json: {e}")))?;

        guard.commit();
        info!("Built OCI bundle: {}", bundle_dir.display());

        Ok(OciBundle {
            path: bundle_dir,
            rootfs,
            spec,
        })
    }

    /// Removes a container's bundle directory, if present.
    pub fn remove(&self, id: &str) -> Result<()> {
        let dir = self.bundle_path(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            debug!("Removed bundle {}", dir.display());
        }
        Ok(())
    }

    /// Synthesizes the OCI spec for a request without touching the disk.
    pub fn synthesize(&self, req: &ContainerRequest, image: &ImageConfig) -> Result<OciSpec> {
        let args = process_args(req, image)?;
        let env = merge_env(&image.env, &req.env);

        let cwd = req
            .cwd
            .clone()
            .or_else(|| image.working_dir.clone())
            .unwrap_or_else(|| "/".to_string());
        if !cwd.starts_with('/') {
            return Err(Error::InvalidRequest(format!(
                "working directory must be absolute: {cwd}"
            )));
        }

        let mut mounts = default_mounts();
        if req.mounts.len() > MAX_USER_MOUNTS {
            return Err(Error::InvalidRequest(format!(
                "too many mounts ({} > {})",
                req.mounts.len(),
                MAX_USER_MOUNTS
            )));
        }
        let mut seen: BTreeSet<String> = mounts.iter().map(|m| m.destination.clone()).collect();
        for mount in &req.mounts {
            mounts.push(user_mount(mount, &mut seen)?);
        }

        let mut namespaces: Vec<OciNamespace> = DEFAULT_NAMESPACES
            .iter()
            .map(|ns| OciNamespace {
                ns_type: ns.to_string(),
                path: None,
            })
            .collect();
        namespaces.extend(req.namespaces.iter().map(|ns| OciNamespace {
            ns_type: ns.oci_type().to_string(),
            path: None,
        }));

        let caps: Vec<String> = DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect();

        Ok(OciSpec {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: OciRoot {
                path: ROOTFS_DIR.to_string(),
                readonly: req.readonly_rootfs,
            },
            process: OciProcess {
                terminal: false,
                user: OciUser {
                    uid: req.uid.unwrap_or(0),
                    gid: req.gid.unwrap_or(0),
                },
                args,
                env,
                cwd,
                capabilities: Some(OciCapabilities {
                    bounding: caps.clone(),
                    effective: caps.clone(),
                    permitted: caps,
                }),
                rlimits: vec![OciRlimit {
                    rlimit_type: "RLIMIT_NOFILE".to_string(),
                    hard: DEFAULT_NOFILE_LIMIT,
                    soft: DEFAULT_NOFILE_LIMIT,
                }],
                no_new_privileges: true,
            },
            hostname: req.hostname.clone().unwrap_or_else(|| req.id.clone()),
            mounts,
            linux: Some(OciLinux {
                namespaces,
                devices: Vec::new(),
                resources: resources(req)?,
                seccomp: None,
                masked_paths: MASKED_PATHS.iter().map(|p| p.to_string()).collect(),
                readonly_paths: READONLY_PATHS.iter().map(|p| p.to_string()).collect(),
            }),
            annotations: annotations(req)?,
        })
    }
}

// =============================================================================
// Spec Pieces
// =============================================================================

/// Computes the core count for a CPU share value.
///
/// Floors at one core so that small share values never yield a zero-CPU
/// container.
pub fn cores_for_shares(shares: u64) -> u64 {
    (shares / CPU_SHARES_PER_CORE).max(1)
}

fn process_args(req: &ContainerRequest, image: &ImageConfig) -> Result<Vec<String>> {
    let args: Vec<String> = if !req.command.is_empty() {
        req.command.iter().chain(req.args.iter()).cloned().collect()
    } else if !req.args.is_empty() {
        image.entrypoint.iter().chain(req.args.iter()).cloned().collect()
    } else {
        image.default_args()
    };

    if args.is_empty() {
        return Err(Error::MissingEntrypoint {
            image: req.image.clone(),
        });
    }
    Ok(args)
}

/// Image env first (in image order), request values override in place, new
/// request keys appended in key order.
fn merge_env(image_env: &[String], overrides: &BTreeMap<String, String>) -> Vec<String> {
    let mut applied: BTreeSet<&str> = BTreeSet::new();
    let mut env: Vec<String> = image_env
        .iter()
        .map(|entry| {
            let key = entry.split_once('=').map_or(entry.as_str(), |(k, _)| k);
            match overrides.get_key_value(key) {
                Some((k, v)) => {
                    applied.insert(k.as_str());
                    format!("{k}={v}")
                }
                None => entry.clone(),
            }
        })
        .collect();

    for (k, v) in overrides {
        if !applied.contains(k.as_str()) {
            env.push(format!("{k}={v}"));
        }
    }

    if !env.iter().any(|e| e.starts_with("PATH=")) {
        env.push(DEFAULT_PATH_ENV.to_string());
    }
    env
}

/// Returns default OCI mounts.
fn default_mounts() -> Vec<OciMount> {
    vec![
        OciMount::new("/proc", "proc", "proc", &[]),
        OciMount::new("/dev", "tmpfs", "tmpfs", &["nosuid", "strictatime", "mode=755", "size=65536k"]),
        OciMount::new(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
        ),
        OciMount::new("/dev/shm", "tmpfs", "shm", &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]),
        OciMount::new("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        OciMount::new("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
    ]
}

fn has_parent_component(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

/// Validates a user mount and converts it to an OCI bind mount.
fn user_mount(mount: &MountRequest, seen: &mut BTreeSet<String>) -> Result<OciMount> {
    let invalid = |reason: &str| Error::InvalidMount {
        destination: mount.destination.clone(),
        reason: reason.to_string(),
    };

    if !mount.source.starts_with('/') {
        return Err(invalid("source must be an absolute path"));
    }
    if !mount.destination.starts_with('/') {
        return Err(invalid("destination must be an absolute path"));
    }
    // SECURITY: `..` could escape the rootfs once the runtime joins the path.
    if has_parent_component(&mount.source) || has_parent_component(&mount.destination) {
        return Err(invalid("path must not contain '..'"));
    }

    let destination = mount.destination.trim_end_matches('/');
    if destination.is_empty() {
        return Err(invalid("cannot mount over the container root"));
    }
    let anchor = Path::new("/rootfs");
    if !anchor.join(destination.trim_start_matches('/')).starts_with(anchor) {
        return Err(invalid("destination escapes the rootfs"));
    }
    if !seen.insert(destination.to_string()) {
        return Err(invalid("duplicate mount destination"));
    }

    let mode = if mount.readonly { "ro" } else { "rw" };
    Ok(OciMount::new(destination, "bind", &mount.source, &["rbind", mode]))
}

fn resources(req: &ContainerRequest) -> Result<Option<OciResources>> {
    let memory = match req.resources.memory_bytes {
        None => None,
        Some(0) => return Err(Error::InvalidRequest("memory limit must be non-zero".to_string())),
        Some(bytes) => {
            let limit = i64::try_from(bytes).map_err(|_| {
                Error::InvalidRequest(format!("memory limit {bytes} out of range"))
            })?;
            Some(OciMemory { limit: Some(limit) })
        }
    };

    let cpu = match req.resources.cpu_shares {
        None => None,
        Some(0) => return Err(Error::InvalidRequest("cpu shares must be non-zero".to_string())),
        Some(shares) => Some(OciCpu {
            shares: Some(shares),
            cores: Some(cores_for_shares(shares)),
        }),
    };

    if memory.is_none() && cpu.is_none() {
        return Ok(None);
    }
    Ok(Some(OciResources { memory, cpu }))
}

fn annotations(req: &ContainerRequest) -> Result<BTreeMap<String, String>> {
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_IMAGE.to_string(), req.image.clone());

    if let Some(numa) = &req.numa_policy {
        annotations.insert(ANNOTATION_NUMA_POLICY.to_string(), numa.clone());
    }
    if let Some(rdt) = &req.rdt_profile {
        annotations.insert(ANNOTATION_RDT_PROFILE.to_string(), rdt.clone());
    }

    if req.net_aliases.len() > MAX_NET_ALIASES {
        return Err(Error::InvalidRequest(format!(
            "too many network aliases ({} > {})",
            req.net_aliases.len(),
            MAX_NET_ALIASES
        )));
    }
    if !req.net_aliases.is_empty() {
        let mut names = BTreeSet::new();
        for alias in &req.net_aliases {
            if !names.insert(alias.name.as_str()) {
                return Err(Error::InvalidRequest(format!(
                    "duplicate network device '{}'",
                    alias.name
                )));
            }
        }
        let encoded: Vec<String> = req.net_aliases.iter().map(|a| a.to_string()).collect();
        annotations.insert(ANNOTATION_NET_ALIASES.to_string(), encoded.join(","));
    }

    Ok(annotations)
}
