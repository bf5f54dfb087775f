//! Registry of detached background commands.
//!
//! A job is keyed by the id the controller chose for it and lives in the
//! registry only while its process runs. Each registered job gets a monitor
//! task that waits for the process and removes the entry when it exits, so
//! an id can be reused as soon as its previous job is gone.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Child;
use tokio::sync::{oneshot, Notify, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("background job '{0}' is already running")]
    AlreadyRunning(String),

    #[error("no background job '{0}' is running")]
    NotFound(String),
}

/// Point-in-time view of a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub id: String,
    /// File receiving the job's combined output.
    pub output: PathBuf,
    pub pid: Option<u32>,
    pub elapsed: Duration,
}

struct JobEntry {
    generation: u64,
    output: PathBuf,
    pid: Option<u32>,
    started_at: Instant,
    cancel: Option<oneshot::Sender<()>>,
}

/// Owns every in-flight background job.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobEntry>>,
    generation: AtomicU64,
    changed: Notify,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `child` under `id` until it exits.
    ///
    /// Fails if a job with the same id is still running, in which case
    /// `child` is killed.
    pub async fn register(
        self: &Arc<Self>,
        id: &str,
        mut child: Child,
        output: PathBuf,
    ) -> Result<(), JobError> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(id) {
                drop(jobs);
                let _ = child.start_kill();
                return Err(JobError::AlreadyRunning(id.to_string()));
            }
            jobs.insert(
                id.to_string(),
                JobEntry {
                    generation,
                    output: output.clone(),
                    pid: child.id(),
                    started_at: Instant::now(),
                    cancel: Some(cancel_tx),
                },
            );
        }

        info!(job = %id, pid = ?child.id(), output = %output.display(), "Background job started");

        let registry = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = cancel_rx => {
                    debug!(job = %id, "Cancelling background job");
                    let _ = child.kill().await;
                    child.wait().await
                }
            };
            match status {
                Ok(status) => {
                    info!(job = %id, exit_code = status.code().unwrap_or(-1), "Background job finished");
                }
                Err(e) => warn!(job = %id, error = %e, "Failed to wait for background job"),
            }
            registry.remove_generation(&id, generation).await;
        });

        Ok(())
    }

    /// Drop the entry for `id`. Does nothing if it is not registered.
    pub async fn deregister(&self, id: &str) {
        if self.jobs.write().await.remove(id).is_some() {
            debug!(job = %id, "Background job deregistered");
        }
        self.changed.notify_waiters();
    }

    pub async fn has(&self, id: &str) -> bool {
        self.jobs.read().await.contains_key(id)
    }

    pub async fn status(&self, id: &str) -> Option<JobStatus> {
        let jobs = self.jobs.read().await;
        jobs.get(id).map(|job| JobStatus {
            id: id.to_string(),
            output: job.output.clone(),
            pid: job.pid,
            elapsed: job.started_at.elapsed(),
        })
    }

    /// Ids of all running jobs, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.jobs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Kill the job's process. The entry disappears once the process has
    /// been reaped.
    pub async fn cancel(&self, id: &str) -> Result<(), JobError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if let Some(cancel) = job.cancel.take() {
            let _ = cancel.send(());
        }
        Ok(())
    }

    /// Wait until no job with `id` is registered.
    pub async fn wait(&self, id: &str) {
        loop {
            let changed = self.changed.notified();
            if !self.has(id).await {
                return;
            }
            changed.await;
        }
    }

    async fn remove_generation(&self, id: &str, generation: u64) {
        {
            let mut jobs = self.jobs.write().await;
            if jobs.get(id).is_some_and(|job| job.generation == generation) {
                jobs.remove(id);
            }
        }
        self.changed.notify_waiters();
    }
}
