//! Error types for the orchestrator.
//!
//! Every failure is a descriptive [`Error`] variant, and every variant folds
//! into exactly one member of the closed [`ErrorKind`] set. The kind is what
//! callers branch on and what the CLI turns into a process exit code; the
//! variant carries the human-readable context.

use std::path::PathBuf;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Closed classification of every failure the orchestrator can report.
///
/// The numeric exit codes are a stable CLI contract across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request or argument is malformed.
    InvalidInput,
    /// Container (or backend object) does not exist.
    NotFound,
    /// Container id is already taken.
    AlreadyExists,
    /// Caller or backend lacks permission.
    PermissionDenied,
    /// A bounded wait expired.
    Timeout,
    /// Transport failure talking to a backend.
    NetworkError,
    /// The selected backend cannot be used on this host.
    RuntimeUnavailable,
    /// Bundle could not be built or read.
    BundleError,
    /// Backend reported a failure, or the transition is illegal.
    OperationFailed,
    /// Another invocation holds the lock for this id.
    OperationInProgress,
    /// Failure that no classification rule recognised.
    Unknown,
}

impl ErrorKind {
    /// Returns the process exit code for this kind.
    ///
    /// `0` is reserved for success.
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Unknown => 1,
            Self::InvalidInput => 2,
            Self::NotFound => 3,
            Self::AlreadyExists => 4,
            Self::PermissionDenied => 5,
            Self::Timeout => 6,
            Self::NetworkError => 7,
            Self::RuntimeUnavailable => 8,
            Self::BundleError => 9,
            Self::OperationFailed => 10,
            Self::OperationInProgress => 11,
        }
    }

    /// Returns the stable snake_case name of the kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::RuntimeUnavailable => "runtime_unavailable",
            Self::BundleError => "bundle_error",
            Self::OperationFailed => "operation_failed",
            Self::OperationInProgress => "operation_in_progress",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container already exists.
    #[error("container already exists: {0}")]
    ContainerAlreadyExists(String),

    /// Container ID failed validation.
    #[error("invalid container ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    /// Container is in wrong state for operation.
    #[error("container '{id}' is in state '{state}', expected {expected}")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    /// Another invocation currently holds this container's lock.
    #[error("operation already in progress for container '{0}'")]
    OperationInProgress(String),

    // =========================================================================
    // Request Validation Errors
    // =========================================================================
    /// Image reference is empty or malformed.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Requested runtime is unknown or not compiled in.
    #[error("unsupported runtime: {0}")]
    UnsupportedRuntime(String),

    /// Request field is out of range or inconsistent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// User mount failed validation.
    #[error("invalid mount '{destination}': {reason}")]
    InvalidMount { destination: String, reason: String },

    /// Neither the request nor the image provides a command.
    #[error("no command given and image '{image}' has no default entrypoint")]
    MissingEntrypoint { image: String },

    /// Image provider has no rootfs for the reference.
    #[error("image not found: {reference}")]
    ImageNotFound { reference: String },

    /// Signal name or number not recognised.
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    // =========================================================================
    // Bundle Errors
    // =========================================================================
    /// Failed to build bundle.
    #[error("failed to build bundle: {0}")]
    BundleBuildFailed(String),

    /// Invalid bundle (missing config.json or unreadable).
    #[error("invalid bundle at {path}: {reason}")]
    InvalidBundle { path: PathBuf, reason: String },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Runtime not available on this host.
    #[error("runtime '{runtime}' not available: {reason}")]
    RuntimeUnavailable { runtime: String, reason: String },

    /// Operation not supported by this runtime.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Backend binary could not be found or executed.
    #[error("binary not found: {program}")]
    BinaryNotFound { program: String },

    /// External command failed and was classified.
    ///
    /// `stderr` holds a bounded excerpt; it is deliberately left out of the
    /// display form and only surfaced through [`Error::stderr_excerpt`].
    #[error("{program} failed ({kind}, exit code {})", .exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    CommandFailed {
        program: String,
        kind: ErrorKind,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Virtualization manager API returned an error status.
    #[error("{verb} {path} returned HTTP {status} ({kind}): {message}")]
    Api {
        verb: String,
        path: String,
        status: u16,
        kind: ErrorKind,
        message: String,
    },

    /// In-process runtime library reported a failure.
    #[error("{runtime} failed to {operation} container '{id}': {reason}")]
    Driver {
        runtime: String,
        operation: String,
        id: String,
        kind: ErrorKind,
        reason: String,
    },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// State document exists but could not be parsed.
    #[error("corrupt state at {path}: {reason}")]
    StateCorrupt { path: PathBuf, reason: String },

    /// State write failed.
    #[error("failed to write state: {0}")]
    StorageWriteFailed(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the normalized kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ContainerNotFound(_) => ErrorKind::NotFound,
            Self::ContainerAlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidContainerId { .. }
            | Self::InvalidImageReference { .. }
            | Self::UnsupportedRuntime(_)
            | Self::InvalidRequest(_)
            | Self::InvalidMount { .. }
            | Self::MissingEntrypoint { .. }
            | Self::InvalidSignal(_) => ErrorKind::InvalidInput,
            Self::InvalidState { .. } | Self::NotSupported(_) => ErrorKind::OperationFailed,
            Self::OperationInProgress(_) => ErrorKind::OperationInProgress,
            Self::BundleBuildFailed(_) | Self::InvalidBundle { .. } => ErrorKind::BundleError,
            Self::RuntimeUnavailable { .. } => ErrorKind::RuntimeUnavailable,
            Self::BinaryNotFound { .. } | Self::ImageNotFound { .. } => ErrorKind::NotFound,
            Self::CommandFailed { kind, .. } | Self::Api { kind, .. } | Self::Driver { kind, .. } => {
                *kind
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::StateCorrupt { .. }
            | Self::StorageWriteFailed(_)
            | Self::Serialization(_) => ErrorKind::OperationFailed,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                _ => ErrorKind::OperationFailed,
            },
            Self::Internal(_) => ErrorKind::Unknown,
        }
    }

    /// Returns the process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }

    /// Returns the captured stderr excerpt of a failed command, if any.
    pub fn stderr_excerpt(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { stderr, .. } if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }

    /// Returns true if the error means "the container does not exist".
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
            && !matches!(self, Self::BinaryNotFound { .. } | Self::ImageNotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
