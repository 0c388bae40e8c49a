//! The background execution context: one long-lived worker thread.
//!
//! The worker owns a current-thread tokio runtime. Submitted jobs are spawned
//! onto it and interleave at their await points; CPU-bound work inside a job
//! stalls every other job on the worker.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Background executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker thread name, also used in logs
    pub name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "casegen-worker".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Executor error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("background worker `{0}` could not be started")]
    Unavailable(String),
    #[error("background worker `{0}` is no longer accepting jobs")]
    Closed(String),
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_submitted: u64,
    pub jobs_finished: u64,
    pub jobs_panicked: u64,
    pub current_running: usize,
}

/// Single persistent worker onto which jobs are submitted without blocking.
///
/// The worker is started lazily, at most once, on the first
/// [`ensure_started`](Self::ensure_started) or [`submit`](Self::submit). Jobs
/// submitted right after start are queued on the worker's channel, so there is
/// no window in which a submission can be lost.
#[derive(Debug)]
pub struct BackgroundExecutor {
    config: ExecutorConfig,
    worker: OnceLock<Option<mpsc::UnboundedSender<BoxedJob>>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl Default for BackgroundExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl BackgroundExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            worker: OnceLock::new(),
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn arc(config: ExecutorConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Start the worker if it is not running yet. Idempotent.
    ///
    /// Returns whether a worker is available.
    pub fn ensure_started(&self) -> bool {
        self.sender().is_some()
    }

    /// Whether the worker has been started successfully.
    pub fn is_started(&self) -> bool {
        matches!(self.worker.get(), Some(Some(_)))
    }

    /// Hand `job` to the worker. Never waits for the job to run.
    ///
    /// Errors raised inside `job` are the caller's business; the job must
    /// handle them itself.
    pub fn submit<F>(&self, job: F) -> Result<(), ExecutorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self
            .sender()
            .ok_or_else(|| ExecutorError::Unavailable(self.config.name.clone()))?;

        sender
            .send(Box::pin(job))
            .map_err(|_| ExecutorError::Closed(self.config.name.clone()))?;

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .jobs_submitted += 1;
        Ok(())
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn sender(&self) -> Option<&mpsc::UnboundedSender<BoxedJob>> {
        self.worker
            .get_or_init(|| spawn_worker(&self.config, self.stats.clone()))
            .as_ref()
    }
}

fn spawn_worker(
    config: &ExecutorConfig,
    stats: Arc<Mutex<ExecutorStats>>,
) -> Option<mpsc::UnboundedSender<BoxedJob>> {
    let (tx, rx) = mpsc::unbounded_channel::<BoxedJob>();
    let name = config.name.clone();

    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                // Dropping `rx` here makes every later submit fail with `Closed`.
                error!(executor = %name, error = %e, "failed to build worker runtime");
                return;
            }
        };
        runtime.block_on(worker_loop(name, rx, stats));
    });

    match spawned {
        Ok(_) => {
            info!(executor = %config.name, "background worker spawned");
            Some(tx)
        }
        Err(e) => {
            error!(executor = %config.name, error = %e, "failed to spawn background worker thread");
            None
        }
    }
}

async fn worker_loop(
    name: String,
    mut rx: mpsc::UnboundedReceiver<BoxedJob>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %name, "background worker started");
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(job) => {
                    running.spawn(job);
                    stats.lock().unwrap_or_else(PoisonError::into_inner).current_running += 1;
                }
                None => break,
            },
            Some(joined) = running.join_next(), if !running.is_empty() => {
                record_finished(&name, &stats, joined);
            }
        }
    }

    debug!(executor = %name, in_flight = running.len(), "draining in-flight jobs");
    while let Some(joined) = running.join_next().await {
        record_finished(&name, &stats, joined);
    }

    info!(executor = %name, "background worker stopped");
}

fn record_finished(name: &str, stats: &Mutex<ExecutorStats>, joined: Result<(), JoinError>) {
    let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
    s.current_running = s.current_running.saturating_sub(1);
    s.jobs_finished += 1;

    if let Err(e) = joined {
        if e.is_panic() {
            s.jobs_panicked += 1;
        }
        error!(executor = %name, error = %e, "background job aborted");
    }
}
