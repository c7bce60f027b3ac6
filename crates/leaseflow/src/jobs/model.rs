use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub status: String,

    pub run_at: Option<DateTime<Utc>>,

    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,

    pub retry_count: i32,
    pub max_attempts: i32,

    pub failed_reason: Option<String>,
    pub last_http_code: Option<i32>,

    pub dedupe_key: Option<String>,
    pub payload_hash: Option<String>,

    pub credential_key: String,
    pub endpoint: String,

    pub job_type: String,
    pub priority: i32,

    pub subject_id: Uuid,
    pub payload_json: Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    pub fn homogeneity_key(&self) -> HomogeneityKey {
        HomogeneityKey::new(self.credential_key.clone(), self.endpoint.clone())
    }

    /// True once the attempt ceiling is reached; such a job is never claimed again.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_attempts
    }

    /// Mirrors the SQL runnable predicate used by every claim strategy.
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status(),
            Some(JobStatus::Pending) | Some(JobStatus::Retrying)
        ) && !self.is_exhausted()
            && self.locked_at.is_none()
            && self.run_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Succeeded,
    /// Failed at least once and waiting for `run_at`; still claimable.
    Retrying,
    /// Terminal: attempts exhausted or the failure was not retryable.
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Succeeded,
        JobStatus::Retrying,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Retrying => "retrying",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

/// The partition every job of one claimed batch must share.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HomogeneityKey {
    pub credential_key: String,
    pub endpoint: String,
}

impl HomogeneityKey {
    pub fn new(credential_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            credential_key: credential_key.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl std::fmt::Display for HomogeneityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.credential_key, self.endpoint)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub subject_id: Uuid,
    pub credential_key: String,
    pub endpoint: String,
    pub job_type: String,
    pub priority: i32,
    pub payload_json: Value,
    pub run_at: Option<DateTime<Utc>>,
    /// Falls back to the queue kind's default when unset.
    pub max_attempts: Option<i32>,
    pub dedupe_key: Option<String>,
    pub payload_hash: Option<String>,
}

impl NewJob {
    pub fn new(subject_id: Uuid) -> Self {
        Self {
            subject_id,
            payload_json: Value::Object(Default::default()),
            ..Default::default()
        }
    }

    pub fn context(mut self, credential_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.credential_key = credential_key.into();
        self.endpoint = endpoint.into();
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = job_type.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn payload(mut self, payload_json: Value) -> Self {
        self.payload_json = payload_json;
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn dedupe_key(mut self, dedupe_key: impl Into<String>) -> Self {
        self.dedupe_key = Some(dedupe_key.into());
        self
    }

    pub fn payload_hash(mut self, payload_hash: impl Into<String>) -> Self {
        self.payload_hash = Some(payload_hash.into());
        self
    }
}

/// Credential/config record plus endpoint descriptor, keyed by the homogeneity key.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ChannelContext {
    pub credential_key: String,
    pub endpoint: String,
    pub base_url: String,
    pub settings_json: Value,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl ChannelContext {
    pub fn key(&self) -> HomogeneityKey {
        HomogeneityKey::new(self.credential_key.clone(), self.endpoint.clone())
    }
}

/// What a dispatcher reports back for a failed attempt.
#[derive(Debug, Clone)]
pub struct Failure {
    pub reason: String,
    pub http_code: Option<i32>,
    /// `None` makes the job runnable again immediately.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Failure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            http_code: None,
            next_retry_at: None,
        }
    }

    pub fn http_code(mut self, code: i32) -> Self {
        self.http_code = Some(code);
        self
    }

    pub fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub pending: i64,
    pub processing: i64,
    pub succeeded: i64,
    pub retrying: i64,
    pub failed: i64,
    pub cancelled: i64,
    /// Claimable right now.
    pub runnable: i64,
    /// Rows whose attempts are used up, whatever their status reads.
    pub exhausted: i64,
    pub oldest_runnable_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn record_status(&mut self, status: &str, count: i64) {
        match JobStatus::parse(status) {
            Some(JobStatus::Pending) => self.pending += count,
            Some(JobStatus::Processing) => self.processing += count,
            Some(JobStatus::Succeeded) => self.succeeded += count,
            Some(JobStatus::Retrying) => self.retrying += count,
            Some(JobStatus::Failed) => self.failed += count,
            Some(JobStatus::Cancelled) => self.cancelled += count,
            None => {}
        }
    }
}
