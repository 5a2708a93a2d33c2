//! # Persisted Container State
//!
//! One JSON document per container under the state root, plus one advisory
//! lock file per id:
//!
//! ```text
//! <state_root>/
//! ├── .locks/
//! │   └── web.lock        flock(LOCK_EX | LOCK_NB) while an operation runs
//! ├── .native/            native runtime's own root (not ours to read)
//! └── web/
//!     └── state.json      OCI state document
//! ```
//!
//! ## Crash Consistency
//!
//! Documents are written to a uniquely named temp file in the same
//! directory and renamed over the target. A reader sees either the old or the
//! new document, never a torn one. Concurrent writers are excluded by
//! [`IdLock`], which every mutating operation takes first.
//!
//! Lock files are never removed: unlinking a lock file while another process
//! waits on it would let two holders coexist.

use crate::constants::{LOCK_DIR, STATE_FILE, validate_container_id};
use crate::error::{Error, Result};
use crate::runtime::{ContainerState, StateDocument};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// =============================================================================
// Lock
// =============================================================================

/// Exclusive advisory lock on one container id.
///
/// Released when dropped, or by the kernel when the process exits.
#[derive(Debug)]
pub struct IdLock {
    id: String,
    _lock: Flock<File>,
}

impl IdLock {
    /// Returns the locked id.
    pub fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Store
// =============================================================================

/// File-backed store of container state documents.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(LOCK_DIR)).map_err(|e| {
            Error::StorageWriteFailed(format!("cannot create state root {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    /// Returns the state root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of a container's state document.
    pub fn state_path(&self, id: &str) -> PathBuf {
        self.root.join(id).join(STATE_FILE)
    }

    fn check_id(id: &str) -> Result<()> {
        validate_container_id(id).map_err(|reason| Error::InvalidContainerId {
            id: id.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Takes the exclusive lock for `id` without blocking.
    ///
    /// # Errors
    ///
    /// [`Error::OperationInProgress`] if another holder has it.
    pub fn lock(&self, id: &str) -> Result<IdLock> {
        Self::check_id(id)?;
        let path = self.root.join(LOCK_DIR).join(format!("{id}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("Locked {}", id);
                Ok(IdLock {
                    id: id.to_string(),
                    _lock: lock,
                })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                Err(Error::OperationInProgress(id.to_string()))
            }
            Err((_, errno)) => Err(Error::Io(std::io::Error::from(errno))),
        }
    }

    /// Returns true if a state document exists for `id`.
    pub fn exists(&self, id: &str) -> bool {
        self.state_path(id).exists()
    }

    /// Loads a container's state.
    ///
    /// # Errors
    ///
    /// - [`Error::ContainerNotFound`] if there is no document
    /// - [`Error::StateCorrupt`] if it cannot be parsed
    pub fn load(&self, id: &str) -> Result<ContainerState> {
        Self::check_id(id)?;
        let path = self.state_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ContainerNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let doc: StateDocument = serde_json::from_str(&content).map_err(|e| Error::StateCorrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        ContainerState::from_document(doc).map_err(|e| Error::StateCorrupt {
            path,
            reason: e.to_string(),
        })
    }

    /// Writes a container's state atomically.
    pub fn save(&self, state: &ContainerState) -> Result<()> {
        Self::check_id(&state.id)?;
        let dir = self.root.join(&state.id);
        fs::create_dir_all(&dir).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;

        let mut json = serde_json::to_vec_pretty(&state.to_document())?;
        json.push(b'\n');

        let path = dir.join(STATE_FILE);
        let temp_path = dir.join(format!("{STATE_FILE}.tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp_path, &json).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            if let Err(cleanup) = fs::remove_file(&temp_path) {
                warn!("Failed to remove {}: {}", temp_path.display(), cleanup);
            }
            Error::StorageWriteFailed(e.to_string())
        })?;

        debug!("Saved state for {} ({})", state.id, state.status);
        Ok(())
    }

    /// Removes a container's state directory.
    pub fn remove(&self, id: &str) -> Result<()> {
        Self::check_id(id)?;
        let dir = self.root.join(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists all containers with a readable state document, sorted by id.
    ///
    /// Unreadable documents are logged and skipped.
    pub fn list(&self) -> Result<Vec<ContainerState>> {
        let mut states = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().join(STATE_FILE).exists() {
                continue;
            }
            match self.load(&name) {
                Ok(state) => states.push(state),
                Err(e) => warn!("Skipping {}: {}", name, e),
            }
        }
        states.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(states)
    }
}
