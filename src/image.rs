//! # Image Provider - Rootfs Resolution Boundary
//!
//! Image resolution and layer extraction are not part of the orchestrator.
//! The [`ImageProvider`] trait is the boundary: given an image reference it
//! returns an already-extracted root filesystem, plus the image's default
//! process configuration (entrypoint, command, environment).
//!
//! ## Providers
//!
//! | Provider              | Source                                     |
//! |-----------------------|--------------------------------------------|
//! | [`LocalImageProvider`]| `<image_root>/<sanitized-ref>/rootfs`      |
//! | test fakes            | anything implementing [`ImageProvider`]    |
//!
//! ## Local Layout
//!
//! ```text
//! <image_root>/
//! └── ubuntu_20.04/
//!     ├── rootfs/        extracted filesystem
//!     └── image.json     optional {"Entrypoint": [...], "Cmd": [...], "Env": [...]}
//! ```
//!
//! An image without `image.json` gets a shell default (`/bin/sh` with the
//! standard `PATH`), matching how single-binary base images are usually run.

use crate::constants::{DEFAULT_PATH_ENV, IMAGE_CONFIG_FILE, ROOTFS_DIR};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Default process configuration carried by an image.
///
/// Field names follow the OCI image config (`config` object) casing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    /// Entrypoint (prefix of the process args).
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Default command (appended to the entrypoint).
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Default environment as `KEY=VALUE` strings.
    #[serde(default)]
    pub env: Vec<String>,
    /// Default working directory.
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl ImageConfig {
    /// The shell default used when an image carries no configuration.
    pub fn shell() -> Self {
        Self {
            entrypoint: Vec::new(),
            cmd: vec!["/bin/sh".to_string()],
            env: vec![DEFAULT_PATH_ENV.to_string()],
            working_dir: None,
        }
    }

    /// Returns entrypoint ++ cmd.
    pub fn default_args(&self) -> Vec<String> {
        self.entrypoint.iter().chain(self.cmd.iter()).cloned().collect()
    }
}

/// Resolves image references to extracted root filesystems.
pub trait ImageProvider: Send + Sync {
    /// Returns the absolute path of the extracted rootfs for `reference`.
    ///
    /// Returns [`Error::ImageNotFound`] when the provider has no rootfs for
    /// the reference; callers may then fall back to an empty bundle rootfs.
    fn resolve(&self, reference: &str) -> Result<PathBuf>;

    /// Returns the image's default process configuration.
    fn image_config(&self, reference: &str) -> Result<ImageConfig> {
        let _ = reference;
        Ok(ImageConfig::default())
    }
}

/// Image provider backed by pre-extracted directories on local disk.
#[derive(Debug, Clone)]
pub struct LocalImageProvider {
    image_root: PathBuf,
}

impl LocalImageProvider {
    /// Creates a provider rooted at `image_root`.
    pub fn new(image_root: impl Into<PathBuf>) -> Self {
        Self {
            image_root: image_root.into(),
        }
    }

    /// Returns the directory an image reference maps to.
    pub fn image_dir(&self, reference: &str) -> PathBuf {
        let safe: String = reference
            .chars()
            .map(|c| match c {
                '/' | ':' | '@' => '_',
                c => c,
            })
            .collect();
        self.image_root.join(safe)
    }
}

impl ImageProvider for LocalImageProvider {
    fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let rootfs = self.image_dir(reference).join(ROOTFS_DIR);
        if !rootfs.is_dir() {
            return Err(Error::ImageNotFound {
                reference: reference.to_string(),
            });
        }
        debug!("Resolved image {} to {}", reference, rootfs.display());
        Ok(rootfs.canonicalize()?)
    }

    fn image_config(&self, reference: &str) -> Result<ImageConfig> {
        let path = self.image_dir(reference).join(IMAGE_CONFIG_FILE);
        if !path.exists() {
            return Ok(ImageConfig::shell());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| {
            Error::BundleBuildFailed(format!("malformed {}: {}", path.display(), e))
        })
    }
}
