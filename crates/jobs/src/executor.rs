//! Background job executor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::store::JobStore;
use super::types::{Job, JobKind, JobStatus};

/// Result of one handler invocation.
#[derive(Debug)]
pub enum JobOutcome {
    /// Job finished; the optional value lands in `Job::result`.
    Success(Option<serde_json::Value>),
    /// Attempt failed; the job re-pends or fails terminally per its budget.
    Failure(String),
}

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job) -> JobOutcome + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for ready jobs.
    pub poll_interval: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub uptime_secs: u64,
}

/// Polls a job store for ready jobs and executes them with registered
/// handlers, honoring each job's attempt budget.
pub struct JobExecutor<S> {
    store: S,
    handlers: HashMap<String, JobHandler>,
}

impl<S> JobExecutor<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job kind.
    ///
    /// Patterns: an exact type name, a `prefix.*` category, or `*` for a
    /// catch-all.
    pub fn register_handler<F>(&mut self, kind_pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobOutcome + Send + Sync + 'static,
    {
        self.handlers.insert(kind_pattern.into(), Box::new(handler));
    }

    fn get_handler(&self, kind: &JobKind) -> Option<&JobHandler> {
        let type_name = kind.type_name();
        if let Some(h) = self.handlers.get(type_name) {
            return Some(h);
        }

        for (pattern, handler) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if type_name.starts_with(prefix) {
                    return Some(handler);
                }
            }
        }

        self.handlers.get("*")
    }

    /// Execute a single claimed (running) job.
    pub fn execute_one(&self, job: &mut Job) -> Result<(), String> {
        let handler = self
            .get_handler(&job.kind)
            .ok_or_else(|| format!("no handler for job kind: {:?}", job.kind))?;

        match handler(job) {
            JobOutcome::Success(result) => {
                job.complete(result, Utc::now()).map_err(|e| e.to_string())?;
                self.store.update(job).map_err(|e| e.to_string())?;
                Ok(())
            }
            JobOutcome::Failure(error) => {
                job.fail(error.clone(), Utc::now()).map_err(|e| e.to_string())?;
                self.store.update(job).map_err(|e| e.to_string())?;
                Err(error)
            }
        }
    }

    /// Spawn the executor in a background thread.
    pub fn spawn(self, config: JobExecutorConfig) -> JobExecutorHandle
    where
        S: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = Arc::clone(&stats);

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                executor_loop(self, config, shutdown_rx, stats_clone);
            })
            .expect("failed to spawn job executor thread");

        JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn executor_loop<S: JobStore + 'static>(
    executor: JobExecutor<S>,
    config: JobExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        {
            let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        match executor.store.claim_next(Utc::now()) {
            Ok(Some(mut job)) => {
                debug!(
                    executor = %config.name,
                    job_id = %job.id,
                    kind = ?job.kind,
                    attempt = job.attempts,
                    "claimed job"
                );

                let result = execute_claimed(&executor, &mut job);

                let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                s.jobs_processed += 1;
                match (&result, job.status) {
                    (Ok(()), _) => s.jobs_succeeded += 1,
                    (Err(_), JobStatus::Failed) => s.jobs_failed += 1,
                    (Err(_), _) => s.jobs_retried += 1,
                }
            }
            Ok(None) => {
                thread::sleep(config.poll_interval);
            }
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}

fn execute_claimed<S: JobStore + 'static>(
    executor: &JobExecutor<S>,
    job: &mut Job,
) -> Result<(), String> {
    if executor.get_handler(&job.kind).is_none() {
        let error = format!("no handler for job kind: {:?}", job.kind);
        warn!(job_id = %job.id, error = %error, "unroutable job");
        if job.fail(error.clone(), Utc::now()).is_ok() {
            if let Err(e) = executor.store.update(job) {
                error!(job_id = %job.id, error = %e, "failed to persist unroutable job");
            }
        }
        return Err(error);
    }

    match executor.execute_one(job) {
        Ok(()) => {
            debug!(job_id = %job.id, "job completed");
            Ok(())
        }
        Err(error) => {
            debug!(job_id = %job.id, error = %error, status = ?job.status, "job attempt failed");
            Err(error)
        }
    }
}
