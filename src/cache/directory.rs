//! Cache entries kept as plain directories on the runner.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<id>/manifest.json
//! <root>/<id>/<n>/data        copy of the n-th saved path
//! ```
//!
//! Keys are immutable: saving a key that already exists fails. Restoring
//! looks for the exact key first and then for the newest entry whose key
//! starts with the requested one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::CacheService;

const MANIFEST: &str = "manifest.json";
const DATA: &str = "data";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    id: i64,
    key: String,
    created_unix_ms: u64,
    paths: Vec<PathBuf>,
}

/// Filesystem-backed [`CacheService`].
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    root: PathBuf,
}

impl DirectoryCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl CacheService for DirectoryCache {
    async fn save(&self, paths: &[PathBuf], key: &str) -> Result<i64> {
        let root = self.root.clone();
        let paths = paths.to_vec();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || save_entry(&root, &paths, &key))
            .await
            .context("Cache save task panicked")?
    }

    async fn restore(&self, paths: &[PathBuf], key: &str) -> Result<Option<String>> {
        let root = self.root.clone();
        let paths = paths.to_vec();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || restore_entry(&root, &paths, &key))
            .await
            .context("Cache restore task panicked")?
    }
}

fn save_entry(root: &Path, paths: &[PathBuf], key: &str) -> Result<i64> {
    fs::create_dir_all(root)
        .with_context(|| format!("Failed to create cache root {}", root.display()))?;

    let manifests = load_manifests(root);
    anyhow::ensure!(
        !manifests.iter().any(|m| m.key == key),
        "Cache entry for key '{key}' already exists"
    );

    let existing: Vec<&PathBuf> = paths.iter().filter(|p| p.exists()).collect();
    anyhow::ensure!(
        !existing.is_empty(),
        "None of the cache paths exist: {paths:?}"
    );

    let id = manifests.iter().map(|m| m.id).max().unwrap_or(0) + 1;
    let manifest = Manifest {
        id,
        key: key.to_string(),
        created_unix_ms: unix_millis(),
        paths: existing.iter().map(|p| (*p).clone()).collect(),
    };

    let staging = root.join(format!(".staging-{}", uuid::Uuid::new_v4()));
    if let Err(e) = stage_entry(&staging, &manifest) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    let entry_dir = root.join(id.to_string());
    if let Err(e) = fs::rename(&staging, &entry_dir) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e).with_context(|| format!("Failed to commit cache entry {id}"));
    }

    debug!(key = %key, id, "Cache entry written");
    Ok(id)
}

fn stage_entry(staging: &Path, manifest: &Manifest) -> Result<()> {
    for (index, source) in manifest.paths.iter().enumerate() {
        let slot = staging.join(index.to_string());
        fs::create_dir_all(&slot)?;
        copy_recursive(source, &slot.join(DATA))
            .with_context(|| format!("Failed to copy {} into the cache", source.display()))?;
    }
    fs::write(staging.join(MANIFEST), serde_json::to_vec_pretty(manifest)?)
        .context("Failed to write cache manifest")?;
    Ok(())
}

fn restore_entry(root: &Path, paths: &[PathBuf], key: &str) -> Result<Option<String>> {
    let manifests = load_manifests(root);
    let Some(manifest) = select_entry(&manifests, key) else {
        return Ok(None);
    };

    let entry_dir = root.join(manifest.id.to_string());
    let mut restored = 0;
    for (index, target) in manifest.paths.iter().enumerate() {
        if !paths.contains(target) {
            continue;
        }
        let source = entry_dir.join(index.to_string()).join(DATA);
        copy_recursive(&source, target)
            .with_context(|| format!("Failed to restore {}", target.display()))?;
        restored += 1;
    }

    if restored == 0 {
        debug!(key = %key, matched = %manifest.key, "Cache entry shares no paths with request");
        return Ok(None);
    }
    Ok(Some(manifest.key.clone()))
}

/// Exact key wins; otherwise the newest entry with `key` as a prefix.
fn select_entry<'a>(manifests: &'a [Manifest], key: &str) -> Option<&'a Manifest> {
    manifests.iter().find(|m| m.key == key).or_else(|| {
        manifests
            .iter()
            .filter(|m| m.key.starts_with(key))
            .max_by_key(|m| (m.created_unix_ms, m.id))
    })
}

fn load_manifests(root: &Path) -> Vec<Manifest> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };

    let mut manifests = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path().join(MANIFEST);
        if !path.is_file() {
            continue;
        }
        match fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| Ok(serde_json::from_slice::<Manifest>(&bytes)?))
        {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache manifest"),
        }
    }
    manifests
}

fn copy_recursive(source: &Path, target: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(source)?;
    if meta.is_dir() {
        fs::create_dir_all(target)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &target.join(entry.file_name()))?;
        }
    } else if meta.file_type().is_symlink() {
        copy_symlink(source, target)?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, target)?;
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    let link = fs::read_link(source)?;
    if fs::symlink_metadata(target).is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    fs::copy(source, target).map(|_| ())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: DirectoryCache,
        gradle: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let gradle = dir.path().join("home/.gradle");
        fs::create_dir_all(gradle.join("caches/modules")).unwrap();
        fs::write(gradle.join("caches/modules/dep.jar"), b"jar bytes").unwrap();
        fs::write(gradle.join("gradle.properties"), b"org.gradle.daemon=false").unwrap();
        let cache = DirectoryCache::new(dir.path().join("cache"));
        Fixture {
            _dir: dir,
            cache,
            gradle,
        }
    }

    #[tokio::test]
    async fn save_then_restore_exact_key() {
        let f = fixture();
        let paths = vec![f.gradle.clone()];

        let id = f.cache.save(&paths, "gradle-linux").await.unwrap();
        assert_eq!(id, 1);

        fs::remove_dir_all(&f.gradle).unwrap();
        let matched = f.cache.restore(&paths, "gradle-linux").await.unwrap();
        assert_eq!(matched.as_deref(), Some("gradle-linux"));
        assert_eq!(
            fs::read(f.gradle.join("caches/modules/dep.jar")).unwrap(),
            b"jar bytes"
        );
    }

    #[tokio::test]
    async fn restore_prefers_newest_prefix_match() {
        let f = fixture();
        let paths = vec![f.gradle.clone()];

        f.cache.save(&paths, "gradle-pr-repo-12-1000").await.unwrap();
        fs::write(f.gradle.join("gradle.properties"), b"newer").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let id = f.cache.save(&paths, "gradle-pr-repo-12-2000").await.unwrap();
        assert_eq!(id, 2);

        fs::write(f.gradle.join("gradle.properties"), b"local").unwrap();
        let matched = f.cache.restore(&paths, "gradle-pr-repo-12-").await.unwrap();
        assert_eq!(matched.as_deref(), Some("gradle-pr-repo-12-2000"));
        assert_eq!(fs::read(f.gradle.join("gradle.properties")).unwrap(), b"newer");
    }

    #[tokio::test]
    async fn miss_on_unknown_key_or_disjoint_paths() {
        let f = fixture();
        f.cache.save(&[f.gradle.clone()], "gradle").await.unwrap();

        assert_eq!(f.cache.restore(&[f.gradle.clone()], "maven").await.unwrap(), None);
        assert_eq!(
            f.cache
                .restore(&[PathBuf::from("/elsewhere")], "gradle")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn duplicate_key_and_missing_paths_fail() {
        let f = fixture();
        let paths = vec![f.gradle.clone()];
        f.cache.save(&paths, "gradle").await.unwrap();

        assert!(f.cache.save(&paths, "gradle").await.is_err());
        assert!(f
            .cache
            .save(&[PathBuf::from("/does/not/exist")], "other")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn missing_paths_are_skipped_when_others_exist() {
        let f = fixture();
        let paths = vec![f.gradle.clone(), f.gradle.with_file_name("absent")];
        tokio_test::assert_ok!(f.cache.save(&paths, "partial").await);
    }
}
