//! Bridge to the artifact cache.
//!
//! The dispatcher never sees cache errors: a failed save becomes id `-1`
//! and a failed restore looks like a miss.

mod directory;

pub use directory::DirectoryCache;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

/// Id reported for a save that did not happen.
pub const FAILED_SAVE_ID: i64 = -1;

/// Content-keyed cache storage.
///
/// Paths handed to implementations are already absolute.
#[async_trait]
pub trait CacheService: Send + Sync {
    /// Store `paths` under `key` and return the new entry's id.
    async fn save(&self, paths: &[PathBuf], key: &str) -> Result<i64>;

    /// Restore `paths` from the best entry for `key`.
    ///
    /// Returns the key of the entry that was restored, or `None` on a miss.
    async fn restore(&self, paths: &[PathBuf], key: &str) -> Result<Option<String>>;
}

/// Resolves controller paths and absorbs cache failures.
#[derive(Clone)]
pub struct CacheBridge {
    service: Arc<dyn CacheService>,
    workspace: PathBuf,
    home: PathBuf,
}

impl CacheBridge {
    pub fn new(
        service: Arc<dyn CacheService>,
        workspace: impl Into<PathBuf>,
        home: impl Into<PathBuf>,
    ) -> Self {
        Self {
            service,
            workspace: workspace.into(),
            home: home.into(),
        }
    }

    pub async fn save(&self, paths: &BTreeSet<String>, key: &str) -> i64 {
        let resolved = self.resolve_all(paths);
        match self.service.save(&resolved, key).await {
            Ok(id) => {
                info!(key = %key, id, "Saved cache entry");
                id
            }
            Err(e) => {
                warn!(key = %key, error = %format!("{e:#}"), "Failed to save cache");
                FAILED_SAVE_ID
            }
        }
    }

    pub async fn restore(&self, paths: &BTreeSet<String>, key: &str) -> Option<String> {
        let resolved = self.resolve_all(paths);
        match self.service.restore(&resolved, key).await {
            Ok(Some(matched)) => {
                info!(key = %key, matched = %matched, "Restored cache entry");
                Some(matched)
            }
            Ok(None) => {
                info!(key = %key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %format!("{e:#}"), "Failed to restore cache");
                None
            }
        }
    }

    fn resolve_all(&self, paths: &BTreeSet<String>) -> Vec<PathBuf> {
        paths.iter().map(|p| self.resolve(p)).collect()
    }

    /// `~/` is the runner's home; other relative paths are workspace paths.
    fn resolve(&self, path: &str) -> PathBuf {
        if path == "~" {
            return self.home.clone();
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return self.home.join(rest);
        }
        self.workspace.join(Path::new(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCache {
        seen: Mutex<Vec<PathBuf>>,
        fail: bool,
    }

    #[async_trait]
    impl CacheService for RecordingCache {
        async fn save(&self, paths: &[PathBuf], _key: &str) -> Result<i64> {
            self.seen.lock().unwrap().extend_from_slice(paths);
            anyhow::ensure!(!self.fail, "cache service unavailable");
            Ok(7)
        }

        async fn restore(&self, paths: &[PathBuf], key: &str) -> Result<Option<String>> {
            self.seen.lock().unwrap().extend_from_slice(paths);
            anyhow::ensure!(!self.fail, "cache service unavailable");
            Ok(Some(key.to_string()))
        }
    }

    fn paths(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn resolves_home_workspace_and_absolute_paths() {
        let service = Arc::new(RecordingCache::default());
        let bridge = CacheBridge::new(service.clone(), "/work/repo", "/home/runner");

        assert_eq!(
            bridge
                .save(&paths(&["~/.gradle/caches", "build", "/opt/tool"]), "k")
                .await,
            7
        );
        let seen = service.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                PathBuf::from("/opt/tool"),
                PathBuf::from("/work/repo/build"),
                PathBuf::from("/home/runner/.gradle/caches"),
            ]
        );
    }

    #[tokio::test]
    async fn failures_are_absorbed() {
        let service = Arc::new(RecordingCache {
            fail: true,
            ..RecordingCache::default()
        });
        let bridge = CacheBridge::new(service, "/work/repo", "/home/runner");

        assert_eq!(bridge.save(&paths(&["build"]), "k").await, FAILED_SAVE_ID);
        assert_eq!(bridge.restore(&paths(&["build"]), "k").await, None);
    }
}
