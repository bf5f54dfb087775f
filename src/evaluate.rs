//! Expression evaluation capability.
//!
//! The agent does not interpret expressions itself. It hands the expression
//! and its bindings to an evaluator and relays the JSON result.

use std::path::PathBuf;
use std::io::ErrorKind;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tracing::{debug, instrument};

use crate::executor::ExecutionContext;

pub type Bindings = Map<String, Value>;

/// Evaluates an expression against variable bindings.
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    async fn evaluate(&self, expression: &str, bindings: &Bindings) -> Result<Value>;
}

/// Used when no evaluator is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledEvaluator;

#[async_trait]
impl ExpressionEvaluator for DisabledEvaluator {
    async fn evaluate(&self, _expression: &str, _bindings: &Bindings) -> Result<Value> {
        anyhow::bail!("Expression evaluation is not configured on this runner")
    }
}

#[derive(Serialize)]
struct EvaluationRequest<'a> {
    expression: &'a str,
    variables: &'a Bindings,
}

/// Delegates to an external program.
///
/// The program receives `{"expression": ..., "variables": {...}}` on stdin and
/// must print the JSON result on stdout. A nonzero exit is an evaluation
/// error whose message is the program's stderr.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: PathBuf,
    args: Vec<String>,
    ctx: ExecutionContext,
}

impl CommandEvaluator {
    pub fn new(program: impl Into<PathBuf>, ctx: ExecutionContext) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ctx,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl ExpressionEvaluator for CommandEvaluator {
    #[instrument(skip(self, bindings), fields(program = %self.program.display()))]
    async fn evaluate(&self, expression: &str, bindings: &Bindings) -> Result<Value> {
        let request = serde_json::to_vec(&EvaluationRequest {
            expression,
            variables: bindings,
        })?;

        let program = self.program.to_string_lossy();
        let mut cmd = self.ctx.command(&program, &self.args).await;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn evaluator: {program}"))?;

        let stdin = child.stdin.take().context("Failed to open stdin")?;
        let mut child_stdout = child.stdout.take().context("Failed to open stdout")?;
        let mut child_stderr = child.stderr.take().context("Failed to open stderr")?;
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let (written, r1, r2) = tokio::join!(
            feed(stdin, &request),
            child_stdout.read_to_end(&mut stdout_buf),
            child_stderr.read_to_end(&mut stderr_buf),
        );
        match written {
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!("Evaluator closed stdin before reading the whole request");
            }
            other => other.context("Failed to write expression to evaluator")?,
        }
        r1.context("Failed to read evaluator stdout")?;
        r2.context("Failed to read evaluator stderr")?;

        let status = child.wait().await.context("Failed to wait for evaluator")?;
        if !status.success() {
            anyhow::bail!(
                "Evaluator exited with {}: {}",
                status.code().unwrap_or(-1),
                String::from_utf8_lossy(&stderr_buf).trim()
            );
        }

        let value = serde_json::from_slice(&stdout_buf).context("Evaluator printed invalid JSON")?;
        debug!("Expression evaluated");
        Ok(value)
    }
}

/// Write the whole request, then close stdin to signal EOF.
async fn feed(mut stdin: ChildStdin, request: &[u8]) -> std::io::Result<()> {
    stdin.write_all(request).await?;
    stdin.shutdown().await
}

/// Bindings the agent adds to every evaluation. Caller variables with the
/// same name take precedence.
pub fn with_ambient_bindings(variables: &Bindings, workspace: &str) -> Bindings {
    let mut bindings = Bindings::new();
    bindings.insert(
        "runner".to_string(),
        json!({
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "workspace": workspace,
        }),
    );
    for (name, value) in variables {
        bindings.insert(name.clone(), value.clone());
    }
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_evaluator(script: &str) -> CommandEvaluator {
        CommandEvaluator::new("sh", ExecutionContext::new("/")).with_args(vec![
            "-c".to_string(),
            script.to_string(),
        ])
    }

    #[tokio::test]
    async fn relays_program_output() {
        // Echo the request back so the test can see what was sent.
        let evaluator = sh_evaluator("cat");
        let mut bindings = Bindings::new();
        bindings.insert("version".into(), json!("1.20.4"));

        let value = evaluator.evaluate("version > '1.20'", &bindings).await.unwrap();
        assert_eq!(
            value,
            json!({"expression": "version > '1.20'", "variables": {"version": "1.20.4"}})
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let evaluator = sh_evaluator("cat >/dev/null; echo 'bad expression' >&2; exit 2");
        let err = evaluator.evaluate("???", &Bindings::new()).await.unwrap_err();
        assert!(err.to_string().contains("bad expression"));
    }

    #[tokio::test]
    async fn invalid_json_is_an_error() {
        let evaluator = sh_evaluator("cat >/dev/null; echo not-json");
        assert!(evaluator.evaluate("1", &Bindings::new()).await.is_err());
    }

    #[tokio::test]
    async fn evaluator_may_ignore_large_request() {
        let evaluator = sh_evaluator("echo true");
        let mut bindings = Bindings::new();
        bindings.insert("changelog".into(), json!("x".repeat(200 * 1024)));

        let value = tokio_test::assert_ok!(evaluator.evaluate("changelog != ''", &bindings).await);
        assert_eq!(value, json!(true));
    }

    #[tokio::test]
    async fn disabled_evaluator_errors() {
        assert!(DisabledEvaluator.evaluate("1", &Bindings::new()).await.is_err());
    }

    #[test]
    fn caller_variables_override_ambient_bindings() {
        let mut variables = Bindings::new();
        variables.insert("pr".into(), json!(12));
        let bindings = with_ambient_bindings(&variables, "/work/repo");
        assert_eq!(bindings["pr"], json!(12));
        assert_eq!(bindings["runner"]["workspace"], json!("/work/repo"));

        variables.insert("runner".into(), json!("custom"));
        let bindings = with_ambient_bindings(&variables, "/work/repo");
        assert_eq!(bindings["runner"], json!("custom"));
    }
}
