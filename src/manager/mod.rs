//! The execution and streaming engine: job registry, lifecycle entry
//! points and the shared log watcher.

pub mod cgroup;
pub mod job;
pub mod logwatcher;
mod watch;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

pub use cgroup::{Cgroup, ResourceLimits};
pub use job::{Job, JobInfo, JobOptions, JobStatus};
pub use logwatcher::LogWatcher;
pub use watch::IsActiveFn;

use crate::error::{JobWorkerError, Result};

/// Registry of every job this process has accepted, plus the process-wide
/// log watcher. Terminated and failed jobs are retained so clients can
/// still query their status and stream already-written output.
pub struct JobManager {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    watcher: LogWatcher,
}

impl JobManager {
    /// Must be called from within a tokio runtime (the watcher spawns its
    /// dispatcher task).
    pub fn new() -> Result<Self> {
        Ok(Self {
            jobs: RwLock::new(HashMap::new()),
            watcher: LogWatcher::new()?,
        })
    }

    /// Build and register a job, then start it. The record stays in the
    /// registry even when the start fails, so a later query reports
    /// `FailedToStart` rather than `NotFound`.
    pub async fn start_job(
        &self,
        shutdown: &CancellationToken,
        command: &str,
        args: &[String],
        opts: JobOptions,
    ) -> Result<Arc<JobInfo>> {
        let job = Arc::new(Job::new(command.to_string(), args.to_vec(), opts));
        let job_id = job.info().job_id().to_string();

        {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&job_id) {
                return Err(JobWorkerError::AlreadyExists(job_id));
            }
            jobs.insert(job_id.clone(), job.clone());
        }

        job.clone().start(shutdown).await?;

        Ok(job.info())
    }

    /// Request termination. The monitor task observes the child's exit and
    /// drives the `Running → Stopped` transition, so the returned view may
    /// still read `Running` for a moment.
    pub async fn stop_job(&self, job_id: &str) -> Result<Arc<JobInfo>> {
        let job = self.lookup(job_id).await?;
        job.cancel();
        Ok(job.info())
    }

    pub async fn query_job(&self, job_id: &str) -> Result<Arc<JobInfo>> {
        Ok(self.lookup(job_id).await?.info())
    }

    /// Subscribe to the job's log. The returned channel delivers the file
    /// from offset zero and closes once the job is inactive and its final
    /// write has been read through.
    pub async fn stream_job(&self, job_id: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let job = self.lookup(job_id).await?;
        let info = job.info();

        self.watcher
            .add_watch(job.log_path(), Box::new(move || info.is_active()))
            .await
    }

    /// Stop delivering log events. In-flight subscriptions drain on their
    /// own; running jobs are unaffected.
    pub fn close(&self) {
        self.watcher.close();
    }

    async fn lookup(&self, job_id: &str) -> Result<Arc<Job>> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobWorkerError::NotFound(job_id.to_string()))
    }
}
