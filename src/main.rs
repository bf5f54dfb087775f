//! action-runner agent
//!
//! Connects to a controller and runs its instructions on this CI runner.
//! Runner details come from the GitHub Actions environment; the flags below
//! override the matching variables.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use action_runner::{agent, config::Config};

#[derive(Parser, Debug)]
#[command(name = "action-runner")]
#[command(about = "Remote command execution agent for CI runners")]
struct Args {
    /// Controller WebSocket URL (overrides INPUT_ENDPOINT)
    #[arg(long)]
    endpoint: Option<String>,

    /// Workspace root (overrides GITHUB_WORKSPACE)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Expression evaluator program (overrides ACTION_RUNNER_EVALUATOR)
    #[arg(long)]
    evaluator: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Flag value standing in for environment variable `name`, if given.
    fn override_for(&self, name: &str) -> Option<String> {
        match name {
            "INPUT_ENDPOINT" => self.endpoint.clone(),
            "GITHUB_WORKSPACE" => self
                .workspace
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            "ACTION_RUNNER_EVALUATOR" => self
                .evaluator
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout stays the job log)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_lookup(|name| {
        args.override_for(name)
            .or_else(|| std::env::var(name).ok())
    })
    .context("Failed to load configuration")?;

    info!(
        repository = %config.repository,
        run_id = config.run_id,
        "Loaded configuration"
    );

    agent::run(config).await
}
