//! Process execution for controller commands.
//!
//! Every process is spawned through an [`ExecutionContext`], which carries the
//! working directory and the environment variables the controller has set so
//! far. Foreground runs buffer their output; background runs stream combined
//! stdout and stderr into a file.

mod local;

pub use local::LocalExecutor;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

/// Result of running a command to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code of the process (0 = success, -1 when killed by a signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ExecutionResult {
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Working directory and environment shared by every spawned process.
///
/// Clones share the same environment: a variable set through one clone is
/// seen by processes spawned through any other.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    cwd: PathBuf,
    env: Arc<RwLock<BTreeMap<String, String>>>,
}

impl ExecutionContext {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            env: Arc::default(),
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Set a variable for all processes spawned from now on.
    pub async fn set_env(&self, name: impl Into<String>, value: impl Into<String>) {
        self.env.write().await.insert(name.into(), value.into());
    }

    pub async fn env_var(&self, name: &str) -> Option<String> {
        self.env.read().await.get(name).cloned()
    }

    /// Build a command for `program` in this context.
    pub async fn command(&self, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.cwd);
        for (name, value) in self.env.read().await.iter() {
            cmd.env(name, value);
        }
        cmd
    }
}

/// Runs processes on behalf of the dispatcher.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run to completion and capture output.
    ///
    /// A nonzero exit is not an error; callers inspect
    /// [`ExecutionResult::exit_code`]. Errors mean the process could not be
    /// started or its output could not be collected.
    async fn run(
        &self,
        ctx: &ExecutionContext,
        program: &str,
        args: &[String],
    ) -> Result<ExecutionResult>;

    /// Start a process whose stdout and stderr both go to `output`.
    ///
    /// The file is created (or truncated) before the process starts.
    async fn spawn_to_file(
        &self,
        ctx: &ExecutionContext,
        program: &str,
        args: &[String],
        output: &Path,
    ) -> Result<Child>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn env_is_shared_between_clones() {
        let ctx = ExecutionContext::new("/tmp");
        let other = ctx.clone();
        other.set_env("JAVA_HOME", "/opt/jdk21").await;
        assert_eq!(ctx.env_var("JAVA_HOME").await.as_deref(), Some("/opt/jdk21"));
        assert_eq!(ctx.env_var("MISSING").await, None);
    }

    #[tokio::test]
    async fn independent_contexts_do_not_leak() {
        let first = ExecutionContext::new("/tmp");
        let second = ExecutionContext::new("/tmp");
        first.set_env("ONLY_FIRST", "1").await;
        assert_eq!(second.env_var("ONLY_FIRST").await, None);
    }
}
