//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::DeployerError;
use crate::filesys::dir::Dir;

/// Directory layout under the deployer base directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base(&self) -> Dir {
        Dir::new(&self.base_dir)
    }

    /// Per-deployment working directories
    pub fn workspaces_dir(&self) -> Dir {
        self.base().subdir("workspaces")
    }

    /// Published build output
    pub fn artifacts_dir(&self) -> Dir {
        self.base().subdir("artifacts")
    }

    /// Uploaded source archives
    pub fn uploads_dir(&self) -> Dir {
        self.base().subdir("uploads")
    }

    /// Project templates
    pub fn templates_dir(&self) -> Dir {
        self.base().subdir("templates")
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), DeployerError> {
        self.workspaces_dir().create().await?;
        self.artifacts_dir().create().await?;
        self.uploads_dir().create().await?;
        self.templates_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/var/lib/webduh")
    }
}
