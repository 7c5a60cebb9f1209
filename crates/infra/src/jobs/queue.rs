//! Store-backed job queue.
//!
//! Layout in the store:
//! - `job_queue`: pending jobs. Enqueue pushes to the head, dequeue pops the
//!   tail, so delivery is FIFO.
//! - `processing_jobs`: one `{id}#{lease}` entry per live delivery.
//! - `job_inflight:{id}`: the current lease of a job, with its deadline.
//! - `dead_letter_queue`: terminal failures, newest at the head.
//!
//! Every store failure is returned to the caller. Queue depth and delivery
//! state must stay observable, so nothing here degrades to a default.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use storefront_core::{Clock, JobId, LeaseId};

use super::types::{
    DeadLetterEntry, FailOutcome, InFlightRecord, Job, NewJob, QueueStats, Receipt,
};
use crate::config::JobQueueSettings;
use crate::error::{ServiceError, ServiceResult};
use crate::store::KvStore;

pub const QUEUE_KEY: &str = "job_queue";
pub const PROCESSING_KEY: &str = "processing_jobs";
pub const DEAD_LETTER_KEY: &str = "dead_letter_queue";
const INFLIGHT_PREFIX: &str = "job_inflight:";
const LEASE_SEPARATOR: char = '#';

/// Reason recorded when a lease runs out before the job is acknowledged.
pub const VISIBILITY_TIMEOUT_REASON: &str = "visibility timeout expired";
/// Reason recorded for queue entries that do not decode as a job.
pub const MALFORMED_PAYLOAD_REASON: &str = "malformed job payload";

fn inflight_key(id: &JobId) -> String {
    format!("{INFLIGHT_PREFIX}{id}")
}

fn processing_entry(id: &JobId, lease: &LeaseId) -> Vec<u8> {
    format!("{id}{LEASE_SEPARATOR}{lease}").into_bytes()
}

fn parse_processing_entry(raw: &[u8]) -> Option<(JobId, LeaseId)> {
    let text = std::str::from_utf8(raw).ok()?;
    let (id, lease) = text.rsplit_once(LEASE_SEPARATOR)?;
    Some((id.parse().ok()?, lease.parse().ok()?))
}

/// Where an acknowledgement stands against the lease on record.
enum Standing {
    Current(InFlightRecord),
    /// No lease on record and the caller named no delivery.
    Untracked,
    /// The caller's delivery was reclaimed or already settled.
    Stale,
}

pub struct JobQueue {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    dequeue_timeout: Duration,
    visibility_timeout: Duration,
}

impl core::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobQueue")
            .field("max_attempts", &self.max_attempts)
            .field("dequeue_timeout", &self.dequeue_timeout)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, settings: &JobQueueSettings) -> Self {
        Self::with_timeouts(
            store,
            clock,
            settings.max_attempts,
            settings.dequeue_timeout(),
            settings.visibility_timeout(),
        )
    }

    pub fn with_timeouts(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
        dequeue_timeout: Duration,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            max_attempts: max_attempts.max(1),
            dequeue_timeout,
            visibility_timeout,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Queue new work. The returned id is the job's only identity.
    pub async fn enqueue(&self, new: NewJob) -> ServiceResult<JobId> {
        let job = Job::from_new(new, self.max_attempts, self.clock.now());
        self.push(&job).await?;
        debug!(job_id = %job.id, kind = %job.kind, "job enqueued");
        Ok(job.id)
    }

    /// Take the next job, waiting up to the dequeue timeout.
    ///
    /// `Ok(None)` means the queue stayed empty for the whole wait. A returned
    /// job is leased until it is completed, failed or reclaimed.
    pub async fn dequeue(&self) -> ServiceResult<Option<Job>> {
        let Some(raw) = self.store.brpop(QUEUE_KEY, self.dequeue_timeout).await? else {
            return Ok(None);
        };

        let mut job: Job = match serde_json::from_slice(&raw) {
            Ok(job) => job,
            Err(err) => {
                let entry = DeadLetterEntry::for_raw(&raw, MALFORMED_PAYLOAD_REASON, self.clock.now());
                if let Err(dlq_err) = self.write_dead_letter(&entry).await {
                    error!(error = %dlq_err, "failed to dead-letter malformed job payload");
                }
                return Err(ServiceError::deserialization(err));
            }
        };

        match self.track(&job).await {
            Ok(lease) => job.lease = Some(lease),
            Err(err) => {
                // Put it back on the consuming end so it is the next one delivered.
                if let Err(restore_err) = self.store.rpush(QUEUE_KEY, raw).await {
                    error!(job_id = %job.id, error = %restore_err, "failed to restore job after tracking failure");
                }
                return Err(err);
            }
        }

        debug!(job_id = %job.id, kind = %job.kind, attempts = job.attempts, "job dequeued");
        Ok(Some(job))
    }

    /// Acknowledge successful processing. Idempotent.
    ///
    /// Pass the dequeued [`Job`] so a late acknowledgement from a consumer
    /// whose lease was reclaimed leaves the redelivery alone.
    pub async fn complete(&self, receipt: impl Into<Receipt>) -> ServiceResult<()> {
        let receipt = receipt.into();
        match self.standing(&receipt).await? {
            Standing::Current(record) => {
                self.release(&receipt.id, &record.lease_id).await?;
                debug!(job_id = %receipt.id, "job completed");
            }
            Standing::Untracked => {}
            Standing::Stale => warn!(job_id = %receipt.id, "ignoring completion of a reclaimed delivery"),
        }
        Ok(())
    }

    /// Record a failed delivery.
    ///
    /// While the job has attempts left it is re-enqueued; after that it is
    /// dead-lettered. An id with no lease on record is dead-lettered with the
    /// reason only. A failure reported for a reclaimed delivery changes
    /// nothing and returns [`FailOutcome::Stale`].
    pub async fn fail(&self, receipt: impl Into<Receipt>, reason: &str) -> ServiceResult<FailOutcome> {
        let receipt = receipt.into();
        match self.standing(&receipt).await? {
            Standing::Current(record) => {
                let lease_id = record.lease_id.clone();
                let outcome = self.settle_failure(record.job, reason).await?;
                self.release(&receipt.id, &lease_id).await?;
                Ok(outcome)
            }
            Standing::Untracked => {
                let entry = DeadLetterEntry::for_id(&receipt.id, reason, self.clock.now());
                self.write_dead_letter(&entry).await?;
                warn!(job_id = %receipt.id, reason, "untracked job dead-lettered");
                Ok(FailOutcome::DeadLettered)
            }
            Standing::Stale => {
                warn!(job_id = %receipt.id, reason, "ignoring failure of a reclaimed delivery");
                Ok(FailOutcome::Stale)
            }
        }
    }

    /// Dead-letter immediately, skipping the retry budget.
    pub async fn dead_letter(&self, receipt: impl Into<Receipt>, reason: &str) -> ServiceResult<()> {
        let receipt = receipt.into();
        let now = self.clock.now();
        match self.standing(&receipt).await? {
            Standing::Current(record) => {
                self.write_dead_letter(&DeadLetterEntry::for_job(&record.job, reason, now))
                    .await?;
                self.release(&receipt.id, &record.lease_id).await?;
            }
            Standing::Untracked => {
                self.write_dead_letter(&DeadLetterEntry::for_id(&receipt.id, reason, now))
                    .await?;
            }
            Standing::Stale => {
                warn!(job_id = %receipt.id, reason, "ignoring dead-letter of a reclaimed delivery");
                return Ok(());
            }
        }
        warn!(job_id = %receipt.id, reason, "job dead-lettered");
        Ok(())
    }

    /// Treat every lease past its deadline as a failed delivery.
    ///
    /// Processing entries whose lease is no longer on record are dropped.
    /// Returns how many expired jobs this call reclaimed.
    pub async fn reclaim_expired(&self) -> ServiceResult<usize> {
        let entries = self.store.lrange(PROCESSING_KEY, 0, -1).await?;
        let now = self.clock.now();
        let mut reclaimed = 0;

        for raw in entries {
            let Some((id, lease)) = parse_processing_entry(&raw) else {
                self.store.lrem(PROCESSING_KEY, &raw).await?;
                continue;
            };

            match self.load_inflight(&id).await? {
                Some(record) if record.lease_id == lease => {
                    if !record.is_expired(now) {
                        continue;
                    }
                    // Another reclaimer got here first.
                    if self.store.lrem(PROCESSING_KEY, &raw).await? == 0 {
                        continue;
                    }
                    let outcome = self.settle_failure(record.job, VISIBILITY_TIMEOUT_REASON).await?;
                    self.forget_lease(&id, &lease).await?;
                    info!(job_id = %id, ?outcome, "reclaimed expired job");
                    reclaimed += 1;
                }
                _ => {
                    self.store.lrem(PROCESSING_KEY, &raw).await?;
                    debug!(job_id = %id, "dropped orphaned processing entry");
                }
            }
        }

        Ok(reclaimed)
    }

    pub async fn stats(&self) -> ServiceResult<QueueStats> {
        Ok(QueueStats {
            queue_length: self.store.llen(QUEUE_KEY).await?,
            processing_length: self.store.llen(PROCESSING_KEY).await?,
            dead_letter_count: self.store.llen(DEAD_LETTER_KEY).await?,
        })
    }

    /// Up to `limit` dead-letter entries, newest first.
    pub async fn dead_letters(&self, limit: usize) -> ServiceResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let raw = self.store.lrange(DEAD_LETTER_KEY, 0, stop).await?;

        Ok(raw
            .iter()
            .filter_map(|bytes| match serde_json::from_slice(bytes) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(error = %err, "skipping undecodable dead-letter entry");
                    None
                }
            })
            .collect())
    }

    async fn push(&self, job: &Job) -> ServiceResult<()> {
        let bytes = serde_json::to_vec(job).map_err(ServiceError::serialization)?;
        self.store.lpush(QUEUE_KEY, bytes).await?;
        Ok(())
    }

    async fn track(&self, job: &Job) -> ServiceResult<LeaseId> {
        let record = InFlightRecord::lease(job.clone(), self.clock.now(), self.visibility_timeout);
        let bytes = serde_json::to_vec(&record).map_err(ServiceError::serialization)?;
        self.store.set(&inflight_key(&job.id), bytes).await?;
        self.store
            .lpush(PROCESSING_KEY, processing_entry(&job.id, &record.lease_id))
            .await?;
        Ok(record.lease_id)
    }

    async fn standing(&self, receipt: &Receipt) -> ServiceResult<Standing> {
        let record = self.load_inflight(&receipt.id).await?;
        Ok(match (record, &receipt.lease) {
            (Some(record), Some(lease)) if record.lease_id != *lease => Standing::Stale,
            (Some(record), _) => Standing::Current(record),
            (None, Some(_)) => Standing::Stale,
            (None, None) => Standing::Untracked,
        })
    }

    async fn release(&self, id: &JobId, lease: &LeaseId) -> ServiceResult<()> {
        self.store
            .lrem(PROCESSING_KEY, &processing_entry(id, lease))
            .await?;
        self.forget_lease(id, lease).await
    }

    /// Drop the lease record unless a newer delivery already replaced it.
    async fn forget_lease(&self, id: &JobId, lease: &LeaseId) -> ServiceResult<()> {
        match self.load_inflight(id).await? {
            Some(record) if record.lease_id == *lease => {
                self.store.delete(&[inflight_key(id)]).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn load_inflight(&self, id: &JobId) -> ServiceResult<Option<InFlightRecord>> {
        match self.store.get(&inflight_key(id)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(ServiceError::deserialization),
            None => Ok(None),
        }
    }

    async fn settle_failure(&self, mut job: Job, reason: &str) -> ServiceResult<FailOutcome> {
        let now = self.clock.now();
        job.attempts = job.attempts.saturating_add(1);

        if job.has_attempts_left() {
            job.scheduled_at = now;
            self.push(&job).await?;
            debug!(job_id = %job.id, attempt = job.attempts, reason, "job re-enqueued for retry");
            Ok(FailOutcome::Retrying {
                attempt: job.attempts,
            })
        } else {
            self.write_dead_letter(&DeadLetterEntry::for_job(&job, reason, now))
                .await?;
            warn!(job_id = %job.id, attempts = job.attempts, reason, "job exhausted its attempts");
            Ok(FailOutcome::DeadLettered)
        }
    }

    async fn write_dead_letter(&self, entry: &DeadLetterEntry) -> ServiceResult<()> {
        let bytes = serde_json::to_vec(entry).map_err(ServiceError::serialization)?;
        self.store.lpush(DEAD_LETTER_KEY, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::jobs::types::JobKind;
    use crate::store::InMemoryStore;
    use storefront_core::ManualClock;

    const VISIBILITY: Duration = Duration::from_secs(300);

    fn queue() -> (JobQueue, Arc<InMemoryStore>, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let queue = JobQueue::with_timeouts(
            store.clone(),
            Arc::new(clock.clone()),
            3,
            Duration::from_millis(50),
            VISIBILITY,
        );
        (queue, store, clock)
    }

    fn email(body: &str) -> NewJob {
        NewJob::new(JobKind::EmailSend, body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_round_trips_the_job() {
        let (queue, _store, clock) = queue();

        let id = queue.enqueue(email("welcome")).await.unwrap();
        let job = queue.dequeue().await.unwrap().unwrap();

        assert_eq!(job.id, id);
        assert!(!job.id.as_str().is_empty());
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.kind, JobKind::EmailSend);
        assert_eq!(job.payload, b"welcome".to_vec());
        assert_eq!(job.created_at, clock.now());
    }

    #[tokio::test]
    async fn delivery_is_fifo() {
        let (queue, _store, _clock) = queue();
        let first = queue.enqueue(email("1")).await.unwrap();
        let second = queue.enqueue(email("2")).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, first);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, second);
    }

    #[tokio::test]
    async fn dequeue_on_empty_queue_waits_then_returns_none() {
        let (queue, _store, _clock) = queue();

        let started = std::time::Instant::now();
        assert!(queue.dequeue().await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn stats_reflect_enqueued_and_dead_lettered_jobs() {
        let (queue, _store, _clock) = queue();
        for i in 0..5 {
            queue.enqueue(email(&i.to_string())).await.unwrap();
        }
        for _ in 0..2 {
            let job = queue.dequeue().await.unwrap().unwrap();
            queue.dead_letter(&job.id, "bounced").await.unwrap();
        }

        assert_eq!(
            queue.stats().await.unwrap(),
            QueueStats {
                queue_length: 3,
                processing_length: 0,
                dead_letter_count: 2,
            }
        );
    }

    #[tokio::test]
    async fn dequeued_job_is_tracked_until_completed() {
        let (queue, _store, _clock) = queue();
        queue.enqueue(email("x")).await.unwrap();

        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(queue.stats().await.unwrap().processing_length, 1);

        queue.complete(&job).await.unwrap();
        queue.complete(&job.id).await.unwrap();
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn fail_retries_within_budget_then_dead_letters() {
        let (queue, _store, _clock) = queue();
        let id = queue.enqueue(email("x")).await.unwrap();

        for expected in 1..3 {
            let job = queue.dequeue().await.unwrap().unwrap();
            assert_eq!(job.attempts, expected - 1);
            assert_eq!(
                queue.fail(&id, "smtp down").await.unwrap(),
                FailOutcome::Retrying { attempt: expected }
            );
        }

        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(queue.fail(&id, "smtp down").await.unwrap(), FailOutcome::DeadLettered);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.processing_length, 0);
        assert_eq!(stats.dead_letter_count, 1);

        let entries = queue.dead_letters(10).await.unwrap();
        assert_eq!(entries[0].job_id.as_ref(), Some(&id));
        assert_eq!(entries[0].attempts, Some(3));
        assert_eq!(entries[0].kind, Some(JobKind::EmailSend));
        assert_eq!(entries[0].reason, "smtp down");
    }

    #[tokio::test]
    async fn failing_an_unknown_job_records_a_minimal_entry() {
        let (queue, _store, _clock) = queue();
        let id = JobId::generate();

        assert_eq!(queue.fail(&id, "lost").await.unwrap(), FailOutcome::DeadLettered);

        let entries = queue.dead_letters(1).await.unwrap();
        assert_eq!(entries[0].job_id.as_ref(), Some(&id));
        assert_eq!(entries[0].kind, None);
        assert_eq!(entries[0].attempts, None);
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimed_as_failed_deliveries() {
        let (queue, _store, clock) = queue();
        let id = queue.enqueue(email("x")).await.unwrap();
        queue.dequeue().await.unwrap().unwrap();

        assert_eq!(queue.reclaim_expired().await.unwrap(), 0);

        clock.advance(VISIBILITY + Duration::from_secs(1));
        assert_eq!(queue.reclaim_expired().await.unwrap(), 1);
        assert_eq!(queue.reclaim_expired().await.unwrap(), 0);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.processing_length, 0);
        assert_eq!(stats.queue_length, 1);

        let redelivered = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(redelivered.id, id);
        assert_eq!(redelivered.attempts, 1);
    }

    #[tokio::test]
    async fn late_completion_does_not_release_the_redelivery() {
        let (queue, _store, clock) = queue();
        let id = queue.enqueue(email("x")).await.unwrap();
        let first = queue.dequeue().await.unwrap().unwrap();

        clock.advance(VISIBILITY + Duration::from_secs(1));
        assert_eq!(queue.reclaim_expired().await.unwrap(), 1);
        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.id, id);
        assert_ne!(second.lease, first.lease);

        // The first consumer finishes after its lease was reclaimed.
        queue.complete(&first).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().processing_length, 1);

        // The second consumer never acknowledges; the job comes back again.
        clock.advance(VISIBILITY + Duration::from_secs(1));
        assert_eq!(queue.reclaim_expired().await.unwrap(), 1);
        let third = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(third.id, id);
        assert_eq!(third.attempts, 2);
    }

    #[tokio::test]
    async fn late_failure_is_ignored() {
        let (queue, _store, clock) = queue();
        queue.enqueue(email("x")).await.unwrap();
        let first = queue.dequeue().await.unwrap().unwrap();

        clock.advance(VISIBILITY + Duration::from_secs(1));
        assert_eq!(queue.reclaim_expired().await.unwrap(), 1);

        // Reclaimed but not yet redelivered.
        assert_eq!(queue.fail(&first, "late").await.unwrap(), FailOutcome::Stale);
        assert_eq!(queue.stats().await.unwrap().queue_length, 1);

        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(queue.fail(&first, "late").await.unwrap(), FailOutcome::Stale);
        queue.dead_letter(&first, "late").await.unwrap();
        assert_eq!(
            queue.stats().await.unwrap(),
            QueueStats {
                queue_length: 0,
                processing_length: 1,
                dead_letter_count: 0,
            }
        );

        queue.complete(&second).await.unwrap();
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn reclaim_drops_orphaned_processing_entries() {
        let (queue, store, _clock) = queue();
        store
            .lpush(PROCESSING_KEY, b"ghost".to_vec())
            .await
            .unwrap();

        assert_eq!(queue.reclaim_expired().await.unwrap(), 0);
        assert_eq!(queue.stats().await.unwrap().processing_length, 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered() {
        let (queue, store, _clock) = queue();
        store.lpush(QUEUE_KEY, b"{not a job".to_vec()).await.unwrap();

        let err = queue.dequeue().await.unwrap_err();
        assert!(matches!(err, ServiceError::Deserialization(_)));

        let entries = queue.dead_letters(5).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, MALFORMED_PAYLOAD_REASON);
        assert_eq!(entries[0].raw_payload.as_deref(), Some("{not a job"));
    }

    #[tokio::test]
    async fn dead_letters_are_listed_newest_first() {
        let (queue, _store, _clock) = queue();
        for reason in ["first", "second", "third"] {
            queue.fail(&JobId::generate(), reason).await.unwrap();
        }

        let reasons: Vec<_> = queue
            .dead_letters(2)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.reason)
            .collect();
        assert_eq!(reasons, ["third", "second"]);
        assert!(queue.dead_letters(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failures_are_surfaced() {
        let (queue, store, _clock) = queue();
        store.set_unavailable(true);

        assert!(matches!(
            queue.stats().await,
            Err(ServiceError::Store(StoreError::Unavailable))
        ));
        assert!(queue.enqueue(email("x")).await.is_err());
        assert!(queue.dequeue().await.is_err());
    }
}
