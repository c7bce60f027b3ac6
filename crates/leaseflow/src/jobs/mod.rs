pub mod claim;
pub mod contexts;
pub mod engine;
pub mod hydrate;
pub mod kind;
pub mod memory;
pub mod model;
pub mod pg;
pub mod reason;
pub mod retry;
pub mod store;
pub mod watchdog;

pub use claim::{CandidateClaim, ClaimStrategy, ProbeBatchClaim, SingleRowClaim};
pub use contexts::ContextsRepo;
pub use engine::{QueueEngine, QueueSettings};
pub use hydrate::{HydratedJob, Hydrator};
pub use kind::{Exchange, LinkSync, Pull, QueueKind, QueueKindName, RateDelivery};
pub use memory::MemoryJobStore;
pub use model::{ChannelContext, Failure, HomogeneityKey, Job, JobStatus, NewJob, QueueStats};
pub use pg::{store_for, PgJobStore};
pub use retry::RetryPolicy;
pub use store::JobStore;
pub use watchdog::Watchdog;
