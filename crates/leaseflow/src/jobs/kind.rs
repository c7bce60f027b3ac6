use std::str::FromStr;
use std::sync::Arc;

use crate::error::QueueError;
use crate::jobs::claim::{CandidateClaim, ClaimStrategy, ProbeBatchClaim, SingleRowClaim};
use crate::jobs::engine::QueueSettings;
use crate::jobs::model::DEFAULT_MAX_ATTEMPTS;

pub const DEFAULT_LEASE_TTL_SECS: i64 = 90;

/// Compile-time description of one queue table.
///
/// The table identifier only ever comes from `TABLE`, so SQL built from it
/// never contains runtime input.
pub trait QueueKind: Send + Sync + 'static {
    const NAME: &'static str;
    const TABLE: &'static str;
    /// Business entity that `subject_id` points at.
    const SUBJECT: &'static str;
    const DEFAULT_MAX_ATTEMPTS: i32 = DEFAULT_MAX_ATTEMPTS;
    const DEFAULT_LEASE_TTL_SECS: i64 = DEFAULT_LEASE_TTL_SECS;

    fn strategy(settings: &QueueSettings) -> Arc<dyn ClaimStrategy>;
}

/// Booking exchanges pushed to a channel. Batches share one account/endpoint.
pub struct Exchange;

impl QueueKind for Exchange {
    const NAME: &'static str = "exchange";
    const TABLE: &'static str = "exchange_jobs";
    const SUBJECT: &'static str = "booking_exchange";

    fn strategy(_settings: &QueueSettings) -> Arc<dyn ClaimStrategy> {
        Arc::new(ProbeBatchClaim)
    }
}

/// Booking link synchronisation. Claimed with the candidate/guarded-update pattern.
pub struct LinkSync;

impl QueueKind for LinkSync {
    const NAME: &'static str = "link_sync";
    const TABLE: &'static str = "link_sync_jobs";
    const SUBJECT: &'static str = "booking_link";

    fn strategy(_settings: &QueueSettings) -> Arc<dyn ClaimStrategy> {
        Arc::new(CandidateClaim)
    }
}

/// Rate and availability delivery. Batches share one account/endpoint.
pub struct RateDelivery;

impl QueueKind for RateDelivery {
    const NAME: &'static str = "rate_delivery";
    const TABLE: &'static str = "rate_delivery_jobs";
    const SUBJECT: &'static str = "rate_range";

    fn strategy(_settings: &QueueSettings) -> Arc<dyn ClaimStrategy> {
        Arc::new(ProbeBatchClaim)
    }
}

/// Calendar pulls, one job at a time in priority order.
pub struct Pull;

impl QueueKind for Pull {
    const NAME: &'static str = "pull";
    const TABLE: &'static str = "pull_jobs";
    const SUBJECT: &'static str = "calendar_feed";

    fn strategy(settings: &QueueSettings) -> Arc<dyn ClaimStrategy> {
        Arc::new(SingleRowClaim::new(settings.job_types.clone()))
    }
}

/// Runtime selector for the kinds above (config, CLI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum QueueKindName {
    #[value(name = "exchange")]
    Exchange,
    #[value(name = "link_sync")]
    LinkSync,
    #[value(name = "rate_delivery")]
    RateDelivery,
    #[value(name = "pull")]
    Pull,
}

impl QueueKindName {
    pub const ALL: [QueueKindName; 4] = [
        QueueKindName::Exchange,
        QueueKindName::LinkSync,
        QueueKindName::RateDelivery,
        QueueKindName::Pull,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKindName::Exchange => Exchange::NAME,
            QueueKindName::LinkSync => LinkSync::NAME,
            QueueKindName::RateDelivery => RateDelivery::NAME,
            QueueKindName::Pull => Pull::NAME,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            QueueKindName::Exchange => Exchange::TABLE,
            QueueKindName::LinkSync => LinkSync::TABLE,
            QueueKindName::RateDelivery => RateDelivery::TABLE,
            QueueKindName::Pull => Pull::TABLE,
        }
    }

    pub fn default_lease_ttl_secs(&self) -> i64 {
        match self {
            QueueKindName::Exchange => Exchange::DEFAULT_LEASE_TTL_SECS,
            QueueKindName::LinkSync => LinkSync::DEFAULT_LEASE_TTL_SECS,
            QueueKindName::RateDelivery => RateDelivery::DEFAULT_LEASE_TTL_SECS,
            QueueKindName::Pull => Pull::DEFAULT_LEASE_TTL_SECS,
        }
    }
}

impl FromStr for QueueKindName {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| QueueError::Config(format!("unknown queue kind: {s}")))
    }
}

impl std::fmt::Display for QueueKindName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
