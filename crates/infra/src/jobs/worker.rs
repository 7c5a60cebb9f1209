//! Job worker: the consumer loop that drains the queue.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::JobQueue;
use super::types::{FailOutcome, Job, JobKind};
use crate::config::JobQueueSettings;
use crate::error::ServiceResult;

/// Handler key that matches every job kind without a dedicated handler.
pub const WILDCARD: &str = "*";

/// Result of running a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// Transient failure; the retry budget applies.
    Failure(String),
    /// Failure that retrying will not fix; dead-letter right away.
    Permanent(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> JobResult {
        (self)(job.clone()).await
    }
}

#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Name for logging
    pub name: String,
    pub reclaim_interval: Duration,
    /// Pause after a failed dequeue before trying again.
    pub error_backoff: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            reclaim_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl JobWorkerConfig {
    pub fn from_settings(settings: &JobQueueSettings) -> Self {
        Self {
            reclaim_interval: settings.reclaim_interval(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_reclaimed: u64,
    pub uptime_secs: u64,
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop after the job in hand (if any) and wait for the loop to exit.
    ///
    /// A dequeue already waiting is allowed to finish so a job popped from the
    /// store is never dropped on the floor.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "job worker task ended abnormally");
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

enum Settled {
    Succeeded,
    Retried,
    DeadLettered,
    /// The lease was reclaimed while the handler ran.
    Superseded,
}

/// Pulls jobs off the queue and dispatches them by kind.
pub struct JobWorker {
    queue: Arc<JobQueue>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobWorker {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job kind name, or [`WILDCARD`].
    pub fn register_handler<H>(&mut self, kind: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(kind.into(), Arc::new(handler));
    }

    fn handler_for(&self, kind: &JobKind) -> Option<&Arc<dyn JobHandler>> {
        self.handlers
            .get(kind.as_str())
            .or_else(|| self.handlers.get(WILDCARD))
    }

    pub fn spawn(self, config: JobWorkerConfig) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let join = tokio::spawn(self.run(config, shutdown_rx, stats.clone()));

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn run(
        self,
        config: JobWorkerConfig,
        mut shutdown: watch::Receiver<bool>,
        stats: Arc<Mutex<WorkerStats>>,
    ) {
        info!(worker = %config.name, "job worker started");
        let started = Instant::now();
        let mut last_reclaim = Instant::now();

        while !*shutdown.borrow() {
            if last_reclaim.elapsed() >= config.reclaim_interval {
                last_reclaim = Instant::now();
                match self.queue.reclaim_expired().await {
                    Ok(0) => {}
                    Ok(n) => {
                        info!(worker = %config.name, reclaimed = n, "reclaimed expired jobs");
                        update(&stats, |s| s.jobs_reclaimed += n as u64);
                    }
                    Err(err) => warn!(worker = %config.name, error = %err, "reclaim pass failed"),
                }
            }

            match self.queue.dequeue().await {
                Ok(Some(job)) => {
                    let job_id = job.id.clone();
                    match self.process(job).await {
                        Ok(settled) => update(&stats, |s| {
                            s.jobs_processed += 1;
                            match settled {
                                Settled::Succeeded => s.jobs_succeeded += 1,
                                Settled::Retried => s.jobs_retried += 1,
                                Settled::DeadLettered => s.jobs_dead_lettered += 1,
                                Settled::Superseded => {}
                            }
                        }),
                        // The lease stays on record; reclaim will redeliver it.
                        Err(err) => error!(
                            worker = %config.name,
                            job_id = %job_id,
                            error = %err,
                            "failed to acknowledge job"
                        ),
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!(worker = %config.name, error = %err, "failed to dequeue job");
                    tokio::select! {
                        _ = tokio::time::sleep(config.error_backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }

            update(&stats, |s| s.uptime_secs = started.elapsed().as_secs());
        }

        info!(worker = %config.name, "job worker stopped");
    }

    async fn process(&self, job: Job) -> ServiceResult<Settled> {
        let Some(handler) = self.handler_for(&job.kind) else {
            let reason = format!("no handler for job kind: {}", job.kind);
            warn!(job_id = %job.id, kind = %job.kind, "no handler for job");
            self.queue.dead_letter(&job, &reason).await?;
            return Ok(Settled::DeadLettered);
        };

        match handler.handle(&job).await {
            JobResult::Success => {
                self.queue.complete(&job).await?;
                debug!(job_id = %job.id, "job completed successfully");
                Ok(Settled::Succeeded)
            }
            JobResult::Failure(reason) => match self.queue.fail(&job, &reason).await? {
                FailOutcome::Retrying { attempt } => {
                    debug!(job_id = %job.id, attempt, error = %reason, "job failed; will retry");
                    Ok(Settled::Retried)
                }
                FailOutcome::DeadLettered => Ok(Settled::DeadLettered),
                FailOutcome::Stale => Ok(Settled::Superseded),
            },
            JobResult::Permanent(reason) => {
                self.queue.dead_letter(&job, &reason).await?;
                Ok(Settled::DeadLettered)
            }
        }
    }
}

fn update(stats: &Mutex<WorkerStats>, f: impl FnOnce(&mut WorkerStats)) {
    let mut guard = stats.lock().unwrap_or_else(|p| p.into_inner());
    f(&mut guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::NewJob;
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use storefront_core::SystemClock;

    fn queue() -> Arc<JobQueue> {
        Arc::new(JobQueue::with_timeouts(
            InMemoryStore::arc(),
            Arc::new(SystemClock::new()),
            2,
            Duration::from_millis(20),
            Duration::from_secs(300),
        ))
    }

    async fn wait_for(handle: &WorkerHandle, done: impl Fn(&WorkerStats) -> bool) -> WorkerStats {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stats = handle.stats();
            if done(&stats) || Instant::now() > deadline {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn successful_jobs_are_completed() {
        let queue = queue();
        let seen = Arc::new(AtomicU32::new(0));
        let mut worker = JobWorker::new(queue.clone());
        let counter = seen.clone();
        worker.register_handler("email_send", move |_job: Job| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                JobResult::Success
            }
        });

        for _ in 0..3 {
            queue
                .enqueue(NewJob::new(JobKind::EmailSend, b"hi".to_vec()))
                .await
                .unwrap();
        }

        let handle = worker.spawn(JobWorkerConfig::default());
        let stats = wait_for(&handle, |s| s.jobs_succeeded == 3).await;
        handle.shutdown().await;

        assert_eq!(stats.jobs_succeeded, 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        let depth = queue.stats().await.unwrap();
        assert_eq!(depth.queue_length + depth.processing_length, 0);
    }

    #[tokio::test]
    async fn failing_jobs_retry_then_dead_letter() {
        let queue = queue();
        let mut worker = JobWorker::new(queue.clone());
        worker.register_handler("report_generate", |_job: Job| async {
            JobResult::Failure("renderer crashed".into())
        });

        queue
            .enqueue(NewJob::new(JobKind::ReportGenerate, Vec::new()))
            .await
            .unwrap();

        let handle = worker.spawn(JobWorkerConfig::default());
        let stats = wait_for(&handle, |s| s.jobs_dead_lettered == 1).await;
        handle.shutdown().await;

        assert_eq!(stats.jobs_retried, 1);
        assert_eq!(stats.jobs_dead_lettered, 1);
        let entries = queue.dead_letters(10).await.unwrap();
        assert_eq!(entries[0].attempts, Some(2));
        assert_eq!(entries[0].reason, "renderer crashed");
    }

    #[tokio::test]
    async fn permanent_failures_and_unknown_kinds_skip_retries() {
        let queue = queue();
        let mut worker = JobWorker::new(queue.clone());
        worker.register_handler("data_cleanup", |_job: Job| async {
            JobResult::Permanent("table missing".into())
        });

        queue
            .enqueue(NewJob::new(JobKind::DataCleanup, Vec::new()))
            .await
            .unwrap();
        queue
            .enqueue(NewJob::new(JobKind::custom("unrouted"), Vec::new()))
            .await
            .unwrap();

        let handle = worker.spawn(JobWorkerConfig::default());
        let stats = wait_for(&handle, |s| s.jobs_dead_lettered == 2).await;
        handle.shutdown().await;

        assert_eq!(stats.jobs_retried, 0);
        assert_eq!(stats.jobs_dead_lettered, 2);
        let reasons: Vec<_> = queue
            .dead_letters(10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.reason)
            .collect();
        assert!(reasons.contains(&"table missing".to_string()));
        assert!(reasons.contains(&"no handler for job kind: unrouted".to_string()));
    }

    #[tokio::test]
    async fn wildcard_handler_catches_unmatched_kinds() {
        let queue = queue();
        let mut worker = JobWorker::new(queue.clone());
        worker.register_handler(WILDCARD, |_job: Job| async { JobResult::Success });

        queue
            .enqueue(NewJob::new(JobKind::custom("webhook_retry"), Vec::new()))
            .await
            .unwrap();

        let handle = worker.spawn(JobWorkerConfig::default());
        let stats = wait_for(&handle, |s| s.jobs_succeeded == 1).await;
        handle.shutdown().await;

        assert_eq!(stats.jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_an_idle_worker() {
        let worker = JobWorker::new(queue());
        let handle = worker.spawn(JobWorkerConfig::default().with_name("idle"));

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("worker did not stop");
    }
}
