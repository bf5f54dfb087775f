//! Executor that spawns processes directly on the runner host.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tracing::{debug, instrument, warn};

use super::{CommandExecutor, ExecutionContext, ExecutionResult};

/// How long output pipes may stay open after the process exits.
pub const DEFAULT_STDIO_GRACE: Duration = Duration::from_secs(10);

/// Runs commands as plain child processes of the agent.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    stdio_grace: Duration,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalExecutor {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stdio_grace: DEFAULT_STDIO_GRACE,
        }
    }

    /// Bound the wait for output pipes to close once the process has exited.
    /// A grandchild that inherited them can otherwise hold the run open.
    #[must_use]
    pub const fn with_stdio_grace(mut self, grace: Duration) -> Self {
        self.stdio_grace = grace;
        self
    }
}

/// Read `reader` to EOF, appending to `buf` chunk by chunk so whatever was
/// read survives if the future is dropped.
async fn drain(mut reader: impl AsyncRead + Unpin, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let mut chunk = [0_u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    #[instrument(skip(self, ctx, args), fields(cwd = %ctx.cwd().display()))]
    async fn run(
        &self,
        ctx: &ExecutionContext,
        program: &str,
        args: &[String],
    ) -> Result<ExecutionResult> {
        debug!(args = args.len(), "Running command");

        let mut cmd = ctx.command(program, args).await;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{program}'"))?;

        let child_stdout = child.stdout.take().context("Failed to open stdout")?;
        let child_stderr = child.stderr.take().context("Failed to open stderr")?;

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let status = {
            // Drain both pipes together so neither side blocks on a full buffer.
            let streams = async {
                tokio::join!(
                    drain(child_stdout, &mut stdout_buf),
                    drain(child_stderr, &mut stderr_buf),
                )
            };
            tokio::pin!(streams);

            let mut drained = None;
            let status = loop {
                tokio::select! {
                    result = &mut streams, if drained.is_none() => drained = Some(result),
                    status = child.wait() => break status.context("Failed to wait for process")?,
                }
            };

            let drained = match drained {
                Some(result) => Some(result),
                None => tokio::time::timeout(self.stdio_grace, &mut streams).await.ok(),
            };
            match drained {
                Some((r1, r2)) => {
                    r1.context("Failed to read stdout")?;
                    r2.context("Failed to read stderr")?;
                }
                None => warn!(
                    grace = ?self.stdio_grace,
                    "Output streams still open after exit, keeping partial output"
                ),
            }
            status
        };

        let result = ExecutionResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        };

        debug!(exit_code = result.exit_code, "Command completed");

        Ok(result)
    }

    #[instrument(skip(self, ctx, args, output), fields(output = %output.display()))]
    async fn spawn_to_file(
        &self,
        ctx: &ExecutionContext,
        program: &str,
        args: &[String],
        output: &Path,
    ) -> Result<Child> {
        let stdout = std::fs::File::create(output)
            .with_context(|| format!("Failed to create output file {}", output.display()))?;
        let stderr = stdout
            .try_clone()
            .context("Failed to share output file with stderr")?;

        let mut cmd = ctx.command(program, args).await;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{program}'"))?;

        debug!(pid = ?child.id(), "Spawned background process");
        Ok(child)
    }
}
