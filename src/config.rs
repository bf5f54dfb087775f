//! Configuration resolved from the runner environment.
//!
//! The workflow that starts the agent provides the workspace, run identity
//! and the controller endpoint (as the `endpoint` action input) through
//! environment variables. Everything is read once at startup.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::transport::heartbeat::DEFAULT_INTERVAL;

/// Resolved agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Absolute workspace root.
    pub workspace: PathBuf,

    /// Controller WebSocket URL.
    pub endpoint: String,

    /// `owner/name` of the repository the workflow runs for.
    pub repository: String,

    /// Workflow run id.
    pub run_id: u64,

    /// Home directory of the runner user.
    pub user_home: PathBuf,

    /// Directory receiving background job output files.
    pub scratch_dir: PathBuf,

    /// Root of the local cache store.
    pub cache_dir: PathBuf,

    /// Program implementing expression evaluation, if any.
    pub evaluator: Option<PathBuf>,

    /// Spacing of liveness pings.
    pub heartbeat_interval: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which plays the role of the
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let workspace = var("GITHUB_WORKSPACE").context("GITHUB_WORKSPACE not defined")?;
        let workspace = absolute(PathBuf::from(workspace))?;

        let run_id = match var("GITHUB_RUN_ID") {
            Some(id) => id
                .parse()
                .with_context(|| format!("GITHUB_RUN_ID is not a number: {id}"))?,
            None => 0,
        };

        let heartbeat_interval = match var("ACTION_RUNNER_HEARTBEAT_SECONDS") {
            Some(secs) => {
                let secs: u64 = secs.parse().with_context(|| {
                    format!("ACTION_RUNNER_HEARTBEAT_SECONDS is not a number: {secs}")
                })?;
                anyhow::ensure!(secs > 0, "ACTION_RUNNER_HEARTBEAT_SECONDS must be positive");
                Duration::from_secs(secs)
            }
            None => DEFAULT_INTERVAL,
        };

        let temp = var("RUNNER_TEMP").map_or_else(std::env::temp_dir, PathBuf::from);
        let cache_dir = var("ACTION_RUNNER_CACHE_DIR")
            .map_or_else(|| temp.join("action-runner-cache"), PathBuf::from);

        let config = Self {
            workspace,
            endpoint: var("INPUT_ENDPOINT").unwrap_or_default(),
            repository: var("GITHUB_REPOSITORY").unwrap_or_default(),
            run_id,
            user_home: var("HOME").map(PathBuf::from).unwrap_or_default(),
            scratch_dir: temp.join("action-runner"),
            cache_dir,
            evaluator: var("ACTION_RUNNER_EVALUATOR").map(PathBuf::from),
            heartbeat_interval,
        };
        debug!(?config, "Resolved configuration");
        Ok(config)
    }

    /// Check that everything needed to connect is present.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.endpoint.is_empty(),
            "No controller endpoint: set the `endpoint` input or pass --endpoint"
        );
        Ok(())
    }
}

/// Make `path` absolute against the cwd and fold `.` and `..` components
/// without touching the filesystem.
fn absolute(path: PathBuf) -> Result<PathBuf> {
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .context("Failed to resolve current directory")?
            .join(path)
    };
    Ok(normalize(&path))
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}
