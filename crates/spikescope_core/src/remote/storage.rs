//! Object storage used to stage remote-execution job data.
//!
//! The remote worker and this service exchange arrays through shared
//! object storage rather than request bodies; recordings are far too large
//! to ship inline. The trait keeps the store pluggable: a cloud bucket in
//! deployment, a shared directory for single-box setups and tests.

use std::fs;
use std::path::PathBuf;

use crate::error::{DataError, DataResult};

/// Minimal object-store contract for job staging.
pub trait ObjectStore: Send + Sync {
    /// Store bytes under a path.
    fn upload(&self, path: &str, bytes: &[u8]) -> DataResult<()>;

    /// Fetch the bytes stored under a path.
    fn download(&self, path: &str) -> DataResult<Vec<u8>>;

    /// Remove every object whose path starts with `prefix`.
    fn delete_prefix(&self, prefix: &str) -> DataResult<()>;
}

/// Object store backed by a local directory tree.
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl ObjectStore for LocalDirStore {
    fn upload(&self, path: &str, bytes: &[u8]) -> DataResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DataError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::write(&full, bytes).map_err(|e| DataError::io(format!("writing {}", full.display()), e))
    }

    fn download(&self, path: &str) -> DataResult<Vec<u8>> {
        let full = self.resolve(path);
        fs::read(&full).map_err(|e| DataError::io(format!("reading {}", full.display()), e))
    }

    fn delete_prefix(&self, prefix: &str) -> DataResult<()> {
        let full = self.resolve(prefix);
        if full.exists() {
            fs::remove_dir_all(&full)
                .map_err(|e| DataError::io(format!("removing {}", full.display()), e))?;
        }
        Ok(())
    }
}
