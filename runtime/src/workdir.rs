//! Scoped working directory.
//!
//! Every build unit gets its own temporary tree. The directory is removed
//! when the `WorkDir` is dropped, which also happens on early returns,
//! cancelled tasks and unwinding panics.

use std::path::{Path, PathBuf};

use stratum_core::error::{BuildError, Result};
use tempfile::TempDir;

const PREFIX: &str = "stratum-";

/// A temporary directory owned for the duration of one build unit.
#[derive(Debug)]
pub struct WorkDir {
    dir: TempDir,
}

impl WorkDir {
    /// Create a new directory under the system temp location.
    pub fn new(label: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}{}-", PREFIX, label))
            .tempdir()
            .map_err(|e| BuildError::io("creating working directory", e))?;
        tracing::debug!(path = %dir.path().display(), "Created working directory");
        Ok(WorkDir { dir })
    }

    /// Create a new directory below `parent`.
    pub fn new_in(parent: &Path, label: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}{}-", PREFIX, label))
            .tempdir_in(parent)
            .map_err(|e| {
                BuildError::io(format!("creating working directory in {}", parent.display()), e)
            })?;
        Ok(WorkDir { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Directory the resolved file tree is installed into.
    pub fn rootfs(&self) -> Result<PathBuf> {
        let root = self.dir.path().join("rootfs");
        std::fs::create_dir_all(&root)
            .map_err(|e| BuildError::io(format!("creating {}", root.display()), e))?;
        Ok(root)
    }
}
