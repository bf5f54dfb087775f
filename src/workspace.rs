//! File access relative to the runner workspace.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// The checked-out repository every relative path resolves against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// `root` should already be absolute; see [`crate::config::Config`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` against the root. Absolute paths are taken as-is.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(path)
    }

    /// Write `content`, creating missing parent directories first.
    pub async fn write(&self, path: &str, content: &[u8]) -> Result<PathBuf> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        tokio::fs::write(&target, content)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;
        debug!(path = %target.display(), bytes = content.len(), "Wrote file");
        Ok(target)
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path);
        tokio::fs::read(&target)
            .await
            .with_context(|| format!("Failed to read {}", target.display()))
    }
}
