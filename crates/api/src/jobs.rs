//! Job handlers registered by the API binary's worker.

use std::sync::Arc;

use tracing::info;

use storefront_infra::jobs::{Job, JobKind, JobQueue, JobResult, JobWorker};

/// Worker with a handler for every built-in job kind.
///
/// The handlers only record the work; delivery to mail and reporting
/// backends lives with those integrations.
pub fn default_worker(queue: Arc<JobQueue>) -> JobWorker {
    let mut worker = JobWorker::new(queue);
    for kind in [JobKind::EmailSend, JobKind::ReportGenerate, JobKind::DataCleanup] {
        worker.register_handler(kind.as_str(), log_job);
    }
    worker
}

async fn log_job(job: Job) -> JobResult {
    info!(
        job_id = %job.id,
        kind = %job.kind,
        attempts = job.attempts,
        payload_bytes = job.payload.len(),
        "processing job"
    );
    JobResult::Success
}
