use chrono::{DateTime, Duration, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::kind::DEFAULT_LEASE_TTL_SECS;
use crate::jobs::store::JobStore;

/// Releases leases that outlived their TTL, presumably because the worker died.
///
/// Runs at the start of every claim. The reclaim is a single self-limiting
/// conditional update, so any number of workers may run it at once.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    lease_ttl: Duration,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_LEASE_TTL_SECS))
    }
}

impl Watchdog {
    pub fn new(lease_ttl: Duration) -> Self {
        Self { lease_ttl }
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Leases started at or before this instant are expired.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.lease_ttl
    }

    pub fn is_expired(&self, processing_started_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        processing_started_at <= self.cutoff(now)
    }

    pub async fn run(&self, store: &dyn JobStore, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let reclaimed = store.reclaim_expired(self.cutoff(now), now).await?;

        for id in &reclaimed {
            warn!(
                queue = store.queue(),
                job_id = %id,
                lease_ttl_secs = self.lease_ttl.num_seconds(),
                "lease expired, job returned to queue"
            );
        }

        Ok(reclaimed)
    }
}
