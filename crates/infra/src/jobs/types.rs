//! Core job types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use storefront_core::{JobId, LeaseId};

use crate::error::{ServiceError, ServiceResult};

/// Job kind for routing to handlers.
///
/// Stored as its string name so kinds added later by other deployments still
/// decode as [`JobKind::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobKind {
    EmailSend,
    ReportGenerate,
    DataCleanup,
    Custom(String),
}

impl JobKind {
    pub fn custom(kind: impl Into<String>) -> Self {
        Self::from(kind.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobKind::EmailSend => "email_send",
            JobKind::ReportGenerate => "report_generate",
            JobKind::DataCleanup => "data_cleanup",
            JobKind::Custom(kind) => kind,
        }
    }
}

impl From<String> for JobKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "email_send" => JobKind::EmailSend,
            "report_generate" => JobKind::ReportGenerate,
            "data_cleanup" => JobKind::DataCleanup,
            _ => JobKind::Custom(value),
        }
    }
}

impl From<JobKind> for String {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::Custom(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work submitted by a caller. The queue assigns identity and bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: Vec<u8>,
}

impl NewJob {
    pub fn new(kind: JobKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Build a job whose payload is `value` encoded as JSON.
    pub fn json<T: Serialize + ?Sized>(kind: JobKind, value: &T) -> ServiceResult<Self> {
        let payload = serde_json::to_vec(value).map_err(ServiceError::serialization)?;
        Ok(Self { kind, payload })
    }
}

/// A queued unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Opaque to the queue.
    pub payload: Vec<u8>,
    /// Failed deliveries so far. Never decreases.
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    /// Set on jobs handed out by `dequeue`; identifies that delivery.
    #[serde(skip)]
    pub lease: Option<LeaseId>,
}

impl Job {
    pub(crate) fn from_new(new: NewJob, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::generate(),
            kind: new.kind,
            payload: new.payload,
            attempts: 0,
            max_attempts,
            created_at: now,
            scheduled_at: now,
            lease: None,
        }
    }

    /// Decode a JSON payload.
    pub fn payload_json<T: DeserializeOwned>(&self) -> ServiceResult<T> {
        serde_json::from_slice(&self.payload).map_err(ServiceError::deserialization)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Lease held on a dequeued job until it is acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightRecord {
    pub job: Job,
    pub lease_id: LeaseId,
    pub leased_at: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
}

impl InFlightRecord {
    pub(crate) fn lease(job: Job, now: DateTime<Utc>, visibility_timeout: Duration) -> Self {
        let lease = chrono::Duration::from_std(visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            job,
            lease_id: LeaseId::generate(),
            leased_at: now,
            lease_until: now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.lease_until
    }
}

/// Entry in the dead-letter list.
///
/// `kind` and `attempts` are only known when the job was still tracked as in
/// flight; `job_id` is absent when the queued payload itself was unreadable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<JobKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    /// Raw payload text for entries that could not be decoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
}

impl DeadLetterEntry {
    pub(crate) fn for_job(job: &Job, reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            job_id: Some(job.id.clone()),
            kind: Some(job.kind.clone()),
            attempts: Some(job.attempts),
            reason: reason.to_string(),
            failed_at: now,
            raw_payload: None,
        }
    }

    pub(crate) fn for_id(id: &JobId, reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            job_id: Some(id.clone()),
            kind: None,
            attempts: None,
            reason: reason.to_string(),
            failed_at: now,
            raw_payload: None,
        }
    }

    pub(crate) fn for_raw(raw: &[u8], reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            job_id: None,
            kind: None,
            attempts: None,
            reason: reason.to_string(),
            failed_at: now,
            raw_payload: Some(String::from_utf8_lossy(raw).into_owned()),
        }
    }
}

/// Depth of each queue list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_length: u64,
    pub processing_length: u64,
    pub dead_letter_count: u64,
}

/// What `fail` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-enqueued; `attempt` failed deliveries so far.
    Retrying { attempt: u32 },
    DeadLettered,
    /// The caller's lease had already been reclaimed; nothing changed.
    Stale,
}

/// The delivery an acknowledgement settles.
///
/// Taken from a dequeued [`Job`] it carries that delivery's lease, and an
/// acknowledgement for a lease that was reclaimed in the meantime is ignored.
/// Taken from a bare [`JobId`] it settles whichever lease is current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub id: JobId,
    pub lease: Option<LeaseId>,
}

impl From<&Job> for Receipt {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            lease: job.lease.clone(),
        }
    }
}

impl From<&JobId> for Receipt {
    fn from(id: &JobId) -> Self {
        Self {
            id: id.clone(),
            lease: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_as_its_name() {
        assert_eq!(
            serde_json::to_string(&JobKind::EmailSend).unwrap(),
            "\"email_send\""
        );
        assert_eq!(
            serde_json::from_str::<JobKind>("\"data_cleanup\"").unwrap(),
            JobKind::DataCleanup
        );
        assert_eq!(
            serde_json::from_str::<JobKind>("\"webhook_retry\"").unwrap(),
            JobKind::custom("webhook_retry")
        );
    }

    #[test]
    fn custom_with_builtin_name_normalizes() {
        assert_eq!(JobKind::custom("report_generate"), JobKind::ReportGenerate);
    }

    #[test]
    fn new_job_starts_with_zero_attempts() {
        let now = Utc::now();
        let job = Job::from_new(NewJob::new(JobKind::EmailSend, b"hi".to_vec()), 3, now);

        assert!(!job.id.as_str().is_empty());
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.created_at, now);
        assert!(job.has_attempts_left());
    }

    #[test]
    fn json_payload_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Email {
            to: String,
        }

        let new = NewJob::json(JobKind::EmailSend, &Email { to: "a@b.c".into() }).unwrap();
        let job = Job::from_new(new, 3, Utc::now());
        assert_eq!(job.payload_json::<Email>().unwrap(), Email { to: "a@b.c".into() });
        assert!(matches!(
            job.payload_json::<u64>(),
            Err(ServiceError::Deserialization(_))
        ));
    }

    #[test]
    fn lease_expiry_is_strictly_after_deadline() {
        let now = Utc::now();
        let job = Job::from_new(NewJob::new(JobKind::DataCleanup, Vec::new()), 3, now);
        let record = InFlightRecord::lease(job, now, Duration::from_secs(30));

        assert!(!record.is_expired(now + chrono::Duration::seconds(30)));
        assert!(record.is_expired(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn lease_is_not_part_of_the_queued_payload() {
        let mut job = Job::from_new(NewJob::new(JobKind::EmailSend, Vec::new()), 3, Utc::now());
        job.lease = Some(LeaseId::generate());

        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("lease").is_none());
        let decoded: Job = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.lease, None);
        assert_eq!(Receipt::from(&job).lease, job.lease);
    }

    #[test]
    fn minimal_dead_letter_omits_unknown_fields() {
        let entry = DeadLetterEntry::for_id(&JobId::generate(), "boom", Utc::now());
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("kind").is_none());
        assert!(json.get("attempts").is_none());
        assert_eq!(json["reason"], "boom");
    }
}
