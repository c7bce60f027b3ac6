use std::time::Duration;

use async_trait::async_trait;
use leaseflow::jobs::HydratedJob;
use serde::Deserialize;
use tracing::info;

/// Outcome of one delivery attempt that did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchError {
    /// Downstream status, when the channel answered at all.
    pub http_code: Option<i32>,
    pub message: String,
}

impl DispatchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            http_code: None,
            message: message.into(),
        }
    }

    pub fn http(code: i32, message: impl Into<String>) -> Self {
        Self {
            http_code: Some(code),
            message: message.into(),
        }
    }
}

/// Talks to the outside world for one claimed job.
///
/// The worker reports the result back to the engine; implementations never
/// touch queue rows themselves.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, job: &HydratedJob) -> Result<(), DispatchError>;
}

/// `payload_json.dry_run`, used to script outcomes in demos and soak runs.
#[derive(Debug, Default, Deserialize)]
struct DryRunScript {
    #[serde(default)]
    fail: bool,
    http_code: Option<i32>,
    reason: Option<String>,
    #[serde(default)]
    delay_ms: u64,
}

/// Logs the job and succeeds, unless the payload scripts a failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunDispatcher;

#[async_trait]
impl Dispatcher for DryRunDispatcher {
    async fn dispatch(&self, hydrated: &HydratedJob) -> Result<(), DispatchError> {
        let job = &hydrated.job;
        let script: DryRunScript = job
            .payload_json
            .get("dry_run")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        if script.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(script.delay_ms)).await;
        }

        info!(
            job_id = %job.id,
            subject_id = %job.subject_id,
            job_type = %job.job_type,
            context = %job.homogeneity_key(),
            base_url = hydrated.context.as_ref().map(|c| c.base_url.as_str()),
            attempt = job.retry_count,
            "dry-run dispatch"
        );

        if !script.fail {
            return Ok(());
        }

        let message = script
            .reason
            .unwrap_or_else(|| "dry-run failure".to_string());
        Err(match script.http_code {
            Some(code) => DispatchError::http(code, message),
            None => DispatchError::new(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use leaseflow::jobs::Job;
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn hydrated(payload: Value) -> HydratedJob {
        let now = Utc::now();
        HydratedJob {
            job: Job {
                id: Uuid::now_v7(),
                status: "processing".into(),
                run_at: None,
                locked_at: Some(now),
                locked_by: Some("w1".into()),
                processing_started_at: Some(now),
                retry_count: 1,
                max_attempts: 3,
                failed_reason: None,
                last_http_code: None,
                dedupe_key: None,
                payload_hash: None,
                credential_key: "acct".into(),
                endpoint: "bookings".into(),
                job_type: "api".into(),
                priority: 0,
                subject_id: Uuid::now_v7(),
                payload_json: payload,
                created_at: now,
                updated_at: now,
            },
            context: None,
        }
    }

    #[tokio::test]
    async fn plain_payload_succeeds() {
        let out = DryRunDispatcher.dispatch(&hydrated(json!({}))).await;
        assert_eq!(out, Ok(()));
    }

    #[tokio::test]
    async fn scripted_failure_carries_code_and_reason() {
        let payload = json!({ "dry_run": { "fail": true, "http_code": 503, "reason": "upstream down" } });
        let err = DryRunDispatcher
            .dispatch(&hydrated(payload))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::http(503, "upstream down"));
    }

    #[tokio::test]
    async fn malformed_script_is_ignored() {
        let payload = json!({ "dry_run": "nope" });
        assert!(DryRunDispatcher.dispatch(&hydrated(payload)).await.is_ok());
    }
}
