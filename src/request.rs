//! Container creation request.
//!
//! A [`ContainerRequest`] is the normalized input to `create`. It is plain
//! data: validation happens in the selector and the spec builder, and once
//! accepted the request is never mutated.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Linux namespaces a request may ask for on top of the defaults.
///
/// The default set (pid, network, ipc, uts, mount) is always present; only
/// the additive ones are requestable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceRequest {
    /// User namespace (unprivileged containers).
    User,
    /// Cgroup namespace (nested container managers).
    Cgroup,
}

impl NamespaceRequest {
    /// OCI namespace type name.
    pub const fn oci_type(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Cgroup => "cgroup",
        }
    }
}

impl std::str::FromStr for NamespaceRequest {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "user" | "userns" => Ok(Self::User),
            "cgroup" | "cgroupns" => Ok(Self::Cgroup),
            other => Err(crate::error::Error::InvalidRequest(format!(
                "namespace '{other}' cannot be requested (defaults are always present)"
            ))),
        }
    }
}

/// A bind mount requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    /// Absolute host path.
    pub source: String,
    /// Absolute path inside the container.
    pub destination: String,
    /// Mount read-only.
    #[serde(default)]
    pub readonly: bool,
}

impl std::str::FromStr for MountRequest {
    type Err = crate::error::Error;

    /// Parses `src:dst[:ro|rw]`.
    fn from_str(s: &str) -> crate::error::Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let (source, destination, readonly) = match parts.as_slice() {
            [src, dst] => (*src, *dst, false),
            [src, dst, "ro"] => (*src, *dst, true),
            [src, dst, "rw"] => (*src, *dst, false),
            _ => {
                return Err(crate::error::Error::InvalidMount {
                    destination: s.to_string(),
                    reason: "expected src:dst[:ro|rw]".to_string(),
                });
            }
        };
        Ok(Self {
            source: source.to_string(),
            destination: destination.to_string(),
            readonly,
        })
    }
}

/// A network device alias (`name` attached to host `bridge`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetAlias {
    /// Device name inside the guest (e.g. `eth0`).
    pub name: String,
    /// Host bridge the device attaches to (e.g. `vmbr0`).
    pub bridge: String,
}

impl std::fmt::Display for NetAlias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.bridge)
    }
}

impl std::str::FromStr for NetAlias {
    type Err = crate::error::Error;

    /// Parses `name:bridge`.
    fn from_str(s: &str) -> crate::error::Result<Self> {
        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        };
        match s.split_once(':') {
            Some((name, bridge)) if valid(name) && valid(bridge) => Ok(Self {
                name: name.to_string(),
                bridge: bridge.to_string(),
            }),
            _ => Err(crate::error::Error::InvalidRequest(format!(
                "invalid network alias '{s}', expected name:bridge"
            ))),
        }
    }
}

/// Resource limits requested for the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub memory_bytes: Option<u64>,
    /// CPU shares (1024 = one core).
    pub cpu_shares: Option<u64>,
}

/// Normalized request to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRequest {
    /// Container ID.
    pub id: String,
    /// Image reference.
    pub image: String,
    /// Entrypoint override.
    #[serde(default)]
    pub command: Vec<String>,
    /// Arguments appended to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides (take precedence over image defaults).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// User bind mounts.
    #[serde(default)]
    pub mounts: Vec<MountRequest>,
    /// Resource limits.
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Additional namespaces.
    #[serde(default)]
    pub namespaces: BTreeSet<NamespaceRequest>,
    /// Network device aliases.
    #[serde(default)]
    pub net_aliases: Vec<NetAlias>,
    /// NUMA placement policy, passed through opaquely.
    pub numa_policy: Option<String>,
    /// RDT profile, passed through opaquely.
    pub rdt_profile: Option<String>,
    /// Explicit runtime override.
    pub runtime: Option<String>,
    /// Working directory inside the container.
    pub cwd: Option<String>,
    /// User ID for the container process.
    pub uid: Option<u32>,
    /// Group ID for the container process.
    pub gid: Option<u32>,
    /// Hostname (defaults to the container id).
    pub hostname: Option<String>,
    /// Mount the root filesystem read-only.
    #[serde(default)]
    pub readonly_rootfs: bool,
}

impl ContainerRequest {
    /// Creates a request with only the id and image set.
    pub fn new(id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            ..Self::default()
        }
    }

    /// Sets the command and arguments.
    #[must_use]
    pub fn with_command(mut self, command: Vec<String>, args: Vec<String>) -> Self {
        self.command = command;
        self.args = args;
        self
    }

    /// Sets the CPU shares.
    #[must_use]
    pub fn with_cpu_shares(mut self, shares: u64) -> Self {
        self.resources.cpu_shares = Some(shares);
        self
    }

    /// Sets the memory limit in bytes.
    #[must_use]
    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.resources.memory_bytes = Some(bytes);
        self
    }

    /// Sets the runtime override.
    #[must_use]
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    /// Adds a requested namespace.
    #[must_use]
    pub fn with_namespace(mut self, ns: NamespaceRequest) -> Self {
        self.namespaces.insert(ns);
        self
    }
}
