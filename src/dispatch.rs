//! Instruction dispatch.
//!
//! Turns each decoded [`Instruction`] into its side effects and the single
//! [`Response`] the controller waits for. Handler failures become response
//! payloads; only frames that cannot be decoded surface as errors.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheBridge, DirectoryCache};
use crate::config::Config;
use crate::console::Console;
use crate::evaluate::{self, CommandEvaluator, DisabledEvaluator, ExpressionEvaluator};
use crate::executor::{CommandExecutor, ExecutionContext, LocalExecutor};
use crate::jobs::{JobError, JobRegistry};
use crate::transport::protocol::{
    CommandLine, ContentEncoding, Instruction, ProtocolError, Response,
};
use crate::workspace::Workspace;

/// Identity reported for `details`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerDetails {
    pub repository: String,
    pub run_id: u64,
    pub user_home: PathBuf,
}

/// The foreground command currently running.
#[derive(Debug, Clone)]
pub struct ForegroundCommand {
    pub command: String,
    pub started_at: Instant,
}

/// Holds at most one foreground command.
#[derive(Debug, Default)]
struct ForegroundSlot {
    current: Mutex<Option<ForegroundCommand>>,
}

impl ForegroundSlot {
    /// Occupy the slot, or return the command already holding it.
    fn acquire(&self, command: &str) -> Result<ForegroundGuard<'_>, ForegroundCommand> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = current.as_ref() {
            return Err(running.clone());
        }
        *current = Some(ForegroundCommand {
            command: command.to_string(),
            started_at: Instant::now(),
        });
        Ok(ForegroundGuard { slot: self })
    }

    fn current(&self) -> Option<ForegroundCommand> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Empties the slot when dropped, however the run ended.
struct ForegroundGuard<'a> {
    slot: &'a ForegroundSlot,
}

impl Drop for ForegroundGuard<'_> {
    fn drop(&mut self) {
        self.slot
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Routes instructions to their handlers.
pub struct Dispatcher {
    ctx: ExecutionContext,
    workspace: Workspace,
    details: RunnerDetails,
    scratch_dir: PathBuf,
    executor: Arc<dyn CommandExecutor>,
    jobs: Arc<JobRegistry>,
    cache: CacheBridge,
    evaluator: Arc<dyn ExpressionEvaluator>,
    console: Arc<dyn Console>,
    foreground: ForegroundSlot,
}

impl Dispatcher {
    /// Build a dispatcher with the production collaborators for `config`.
    pub fn new(config: &Config, console: Arc<dyn Console>) -> Self {
        let ctx = ExecutionContext::new(&config.workspace);
        let evaluator: Arc<dyn ExpressionEvaluator> = match &config.evaluator {
            Some(program) => Arc::new(CommandEvaluator::new(program, ctx.clone())),
            None => Arc::new(DisabledEvaluator),
        };
        let cache = CacheBridge::new(
            Arc::new(DirectoryCache::new(&config.cache_dir)),
            &config.workspace,
            &config.user_home,
        );

        Self {
            workspace: Workspace::new(&config.workspace),
            details: RunnerDetails {
                repository: config.repository.clone(),
                run_id: config.run_id,
                user_home: config.user_home.clone(),
            },
            scratch_dir: config.scratch_dir.clone(),
            executor: Arc::new(LocalExecutor::new()),
            jobs: Arc::new(JobRegistry::new()),
            cache,
            evaluator,
            console,
            foreground: ForegroundSlot::default(),
            ctx,
        }
    }

    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheBridge) -> Self {
        self.cache = cache;
        self
    }

    pub const fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub const fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// The foreground command in flight, if any.
    pub fn foreground(&self) -> Option<ForegroundCommand> {
        self.foreground.current()
    }

    /// Decode `frame` and run it.
    ///
    /// `Ok(None)` means the instruction produces no response.
    pub async fn handle(&self, frame: &str) -> Result<Option<Response>, ProtocolError> {
        let instruction = Instruction::decode(frame)?;
        Ok(self.execute(instruction).await)
    }

    #[instrument(skip_all, fields(kind = instruction.kind()))]
    pub async fn execute(&self, instruction: Instruction) -> Option<Response> {
        let response = match instruction {
            Instruction::Unknown => {
                debug!("Ignoring unknown instruction");
                return None;
            }
            Instruction::Details => Response::Details {
                repository: self.details.repository.clone(),
                id: self.details.run_id,
                user_home: self.details.user_home.display().to_string(),
            },
            Instruction::Command { command, optional } => {
                self.run_command(&command, optional).await
            }
            Instruction::BackgroundCommand { id, command } => {
                self.run_background(&id, &command).await
            }
            Instruction::SetEnv { name, value } => {
                info!(name = %name, "Setting environment variable");
                self.ctx.set_env(name, value).await;
                Response::empty()
            }
            Instruction::WriteFile {
                path,
                content,
                encoding,
            } => self.write_file(&path, &content, encoding).await,
            Instruction::ReadFile { path } => self.read_file(&path).await,
            Instruction::Log { message, level } => {
                self.console.log(level, &message);
                Response::empty()
            }
            Instruction::Eval {
                expression,
                variables,
            } => {
                let workspace = self.workspace.root().display().to_string();
                let bindings = evaluate::with_ambient_bindings(&variables, &workspace);
                match self.evaluator.evaluate(&expression, &bindings).await {
                    Ok(result) => Response::Result { result },
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "Expression evaluation failed");
                        Response::error(format!("{e:#}"))
                    }
                }
            }
            Instruction::SaveCache { key, paths } => Response::CacheId {
                id: self.cache.save(&paths, &key).await,
            },
            Instruction::RestoreCache { key, paths } => {
                self.cache.restore(&paths, &key).await;
                Response::empty()
            }
            Instruction::Mask { value } => {
                self.console.add_mask(&value);
                Response::empty()
            }
            Instruction::Group { title } => {
                match title {
                    Some(title) => self.console.start_group(&title),
                    None => self.console.end_group(),
                }
                Response::empty()
            }
        };
        Some(response)
    }

    async fn run_command(&self, argv: &[String], optional: bool) -> Response {
        let Some(line) = CommandLine::parse(argv, optional) else {
            return Response::error("empty command");
        };
        let shown = line.display();

        let _guard = match self.foreground.acquire(&shown) {
            Ok(guard) => guard,
            Err(running) => {
                warn!(command = %shown, running = %running.command, "Rejecting command while another runs");
                return Response::error("a foreground command is already running");
            }
        };

        self.console.start_group(&format!("Executing \"{shown}\""));
        let response = match self.executor.run(&self.ctx, &line.program, &line.args).await {
            Ok(result) => {
                if !result.stdout.is_empty() {
                    self.console.info(result.stdout.trim_end());
                }
                if !result.stderr.is_empty() {
                    self.console.info(result.stderr.trim_end());
                }
                self.console
                    .info(&format!("Command returned exit code {}", result.exit_code));
                info!(command = %shown, exit_code = result.exit_code, optional = line.optional, "Command finished");

                if result.success() || line.optional {
                    Response::Stdout {
                        stdout: result.stdout,
                    }
                } else {
                    Response::Stderr {
                        stderr: result.stderr,
                    }
                }
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(command = %shown, error = %message, "Command could not be run");
                self.console.info(&message);
                if line.optional {
                    Response::Stdout {
                        stdout: String::new(),
                    }
                } else {
                    Response::Stderr { stderr: message }
                }
            }
        };
        self.console.end_group();
        response
    }

    async fn run_background(&self, id: &str, argv: &[String]) -> Response {
        let Some((program, args)) = argv.split_first() else {
            return Response::error("empty command");
        };
        if self.jobs.has(id).await {
            return Response::error(JobError::AlreadyRunning(id.to_string()).to_string());
        }

        let output = match self.prepare_output(id).await {
            Ok(output) => output,
            Err(e) => return Response::error(format!("{e:#}")),
        };

        let child = match self
            .executor
            .spawn_to_file(&self.ctx, program, args, &output)
            .await
        {
            Ok(child) => child,
            Err(e) => {
                warn!(job = %id, error = %format!("{e:#}"), "Background command could not be started");
                return Response::error(format!("{e:#}"));
            }
        };

        match self.jobs.register(id, child, output.clone()).await {
            Ok(()) => Response::Output {
                output: output.display().to_string(),
            },
            Err(e) => Response::error(e.to_string()),
        }
    }

    async fn prepare_output(&self, id: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create scratch directory {}",
                    self.scratch_dir.display()
                )
            })?;
        Ok(self
            .scratch_dir
            .join(format!("{}-{}.log", file_safe(id), uuid::Uuid::new_v4())))
    }

    async fn write_file(&self, path: &str, content: &str, encoding: ContentEncoding) -> Response {
        let bytes = match encoding {
            ContentEncoding::Utf8 => content.as_bytes().to_vec(),
            ContentEncoding::Base64 => match BASE64.decode(content) {
                Ok(bytes) => bytes,
                Err(e) => return Response::error(format!("Invalid base64 content: {e}")),
            },
        };
        match self.workspace.write(path, &bytes).await {
            Ok(target) => {
                info!(path = %target.display(), "Written file");
                Response::empty()
            }
            Err(e) => {
                warn!(path = %path, error = %format!("{e:#}"), "Failed to write file");
                Response::error(format!("{e:#}"))
            }
        }
    }

    async fn read_file(&self, path: &str) -> Response {
        match self.workspace.read(path).await {
            Ok(bytes) => Response::File {
                file: BASE64.encode(bytes),
            },
            Err(e) => {
                debug!(path = %path, error = %format!("{e:#}"), "Failed to read file");
                Response::error(format!("{e:#}"))
            }
        }
    }
}

/// Keep job ids usable as file name prefixes.
fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
