//! # Runtime Constants
//!
//! Defines the bounds, timeouts, default paths and well-known keys used by
//! every layer of the orchestrator. These constants are the **single source
//! of truth** for limits that protect the host from runaway operations.
//!
//! ## Modification Guidelines
//!
//! Before modifying any constant:
//! 1. Consider interactions with other limits (e.g. `STOP_POLL_ATTEMPTS ×
//!    STOP_POLL_INTERVAL` bounds how long `kill` can block)
//! 2. Update dependent tests and documentation
//! 3. Exit codes in [`crate::error::ErrorKind::exit_code`] are part of the CLI
//!    contract and must never be renumbered
//!
//! ## Cross-References
//!
//! - [`crate::bundle`]: default mounts, capabilities and annotation keys
//! - [`crate::executor`]: command timeouts and retry backoff
//! - [`crate::runtimes`]: polling bounds and guest id range
//! - [`crate::state`]: state file names and lock directory

use std::time::Duration;

// =============================================================================
// Input Limits
// =============================================================================

/// Maximum image reference length in bytes.
///
/// **Security**: Prevents overly long references from reaching backend CLIs
/// as command-line arguments.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Valid characters for image references.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`, `.`, `/`, `:`, `@`
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";

/// Valid characters for container IDs.
///
/// **Security**: Excludes `/`, `.`, and other characters that could be used
/// for path traversal, since ids become directory names under the state and
/// bundle roots. Excluding `.` also keeps ids disjoint from the internal
/// dot-directories (`.locks`, `.native`).
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container ID length.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Maximum number of user-supplied mounts in one request.
pub const MAX_USER_MOUNTS: usize = 64;

/// Maximum number of network device aliases in one request.
pub const MAX_NET_ALIASES: usize = 16;

// =============================================================================
// Resource Defaults
// =============================================================================

/// CPU shares that correspond to one full core.
///
/// Cores derived from shares are `max(1, shares / CPU_SHARES_PER_CORE)`; the
/// floor keeps small share values from producing zero-core containers.
pub const CPU_SHARES_PER_CORE: u64 = 1024;

/// Default open file limit applied to the container process.
pub const DEFAULT_NOFILE_LIMIT: u64 = 1024;

/// Default `PATH` injected when neither the image nor the request sets one.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Lowest guest id the virtualization host accepts; container ids in
/// `[GUEST_ID_VERBATIM_MIN, GUEST_ID_MIN)` are used as guest ids verbatim.
pub const GUEST_ID_VERBATIM_MIN: u32 = 100;

/// Lowest hash-derived guest id.
pub const GUEST_ID_MIN: u32 = 100_000;

/// Highest hash-derived guest id handed to the virtualization host.
pub const GUEST_ID_MAX: u32 = 999_999_999;

// =============================================================================
// Timeouts and Retry Bounds
// =============================================================================
//
// Every wait point in the orchestrator is bounded either by a timeout or by
// `retries × interval`. Nothing blocks indefinitely.
// =============================================================================

/// Default timeout for a single backend CLI invocation (60 seconds).
///
/// **Rationale**: Container provisioning on the virtualization host can
/// involve storage allocation; 60s covers a cold template clone.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for quick status probes (10 seconds).
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of retries for transient CLI failures.
pub const COMMAND_RETRIES: u32 = 2;

/// Fixed backoff between CLI retry attempts.
pub const COMMAND_BACKOFF: Duration = Duration::from_millis(500);

/// Default graceful shutdown period used by `stop` (30 seconds).
///
/// **Rationale**: Matches the Kubernetes default termination grace period.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Number of status polls after a signal before giving up.
pub const STOP_POLL_ATTEMPTS: u32 = 20;

/// Interval between status polls after a signal.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum bytes of stderr kept in a user-facing error.
///
/// Full stderr is logged at debug level; the error only carries an excerpt.
pub const STDERR_EXCERPT_LEN: usize = 512;

// =============================================================================
// Storage Paths
// =============================================================================

/// File name of the persisted container state inside `<state_root>/<id>/`.
pub const STATE_FILE: &str = "state.json";

/// Directory under the state root holding per-id advisory lock files.
pub const LOCK_DIR: &str = ".locks";

/// Directory under the state root used as the native runtime's own root.
pub const NATIVE_ROOT_DIR: &str = ".native";

/// File name of the OCI runtime configuration inside a bundle.
pub const CONFIG_FILE: &str = "config.json";

/// Name of the root filesystem directory inside a bundle.
pub const ROOTFS_DIR: &str = "rootfs";

/// Optional image configuration file inside a local image directory.
pub const IMAGE_CONFIG_FILE: &str = "image.json";

// =============================================================================
// OCI Spec Versions
// =============================================================================

/// OCI Runtime Spec version for generated `config.json` and `state.json`.
///
/// See: <https://github.com/opencontainers/runtime-spec/releases>
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

// =============================================================================
// Annotation Keys
// =============================================================================
//
// Extensions that have no OCI field travel as annotations. The native runtime
// ignores them; the managed and VM drivers read them back from config.json.
// =============================================================================

/// Image reference the bundle was built from.
pub const ANNOTATION_IMAGE: &str = "org.unirun.image";

/// NUMA placement policy (opaque to the orchestrator).
pub const ANNOTATION_NUMA_POLICY: &str = "org.unirun.numa-policy";

/// RDT (cache allocation) profile name (opaque to the orchestrator).
pub const ANNOTATION_RDT_PROFILE: &str = "org.unirun.rdt-profile";

/// Network device aliases, encoded as `name:bridge` pairs joined by `,`.
pub const ANNOTATION_NET_ALIASES: &str = "org.unirun.net-aliases";

/// Runtime kind recorded in the state document.
pub const ANNOTATION_RUNTIME_KIND: &str = "org.unirun.runtime-kind";

/// Creation timestamp (RFC 3339) recorded in the state document.
pub const ANNOTATION_CREATED: &str = "org.unirun.created";

// =============================================================================
// Container ID Validation Helper
// =============================================================================

/// Validates a container ID for safety.
///
/// # Security
///
/// This function ensures container IDs:
/// - Are non-empty
/// - Don't exceed `MAX_CONTAINER_ID_LEN`
/// - Only contain characters from `CONTAINER_NAME_VALID_CHARS`
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !id.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}

/// Validates an image reference's length and character set.
#[inline]
#[must_use = "validation result must be checked before using the reference"]
pub fn validate_image_reference(reference: &str) -> std::result::Result<(), &'static str> {
    if reference.is_empty() {
        return Err("image reference cannot be empty");
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err("image reference exceeds maximum length");
    }
    if !reference.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
        return Err("image reference contains invalid characters");
    }
    Ok(())
}
