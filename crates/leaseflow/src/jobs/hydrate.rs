use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::model::{ChannelContext, HomogeneityKey, Job};
use crate::jobs::store::JobStore;

/// A claimed job together with the context its dispatcher needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HydratedJob {
    pub job: Job,
    pub context: Option<ChannelContext>,
}

/// Loads the full graph for claimed ids.
///
/// Reads are keyed strictly by the id list the locking step produced. Nothing
/// here filters on lease owner or status: those fields were just written by the
/// claim and must not be used to re-derive the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hydrator;

impl Hydrator {
    pub async fn hydrate(&self, store: &dyn JobStore, ids: &[Uuid]) -> Result<Vec<HydratedJob>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let jobs = store.fetch_jobs(ids).await?;

        let keys: Vec<HomogeneityKey> = jobs
            .iter()
            .map(Job::homogeneity_key)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let contexts = store.fetch_contexts(&keys).await?;

        Ok(assemble(store.queue(), ids, jobs, contexts))
    }
}

/// Order rows as `ids` lists them and attach contexts.
fn assemble(
    queue: &str,
    ids: &[Uuid],
    jobs: Vec<Job>,
    contexts: Vec<ChannelContext>,
) -> Vec<HydratedJob> {
    let mut by_id: HashMap<Uuid, Job> = jobs.into_iter().map(|j| (j.id, j)).collect();
    let by_key: HashMap<HomogeneityKey, ChannelContext> =
        contexts.into_iter().map(|c| (c.key(), c)).collect();

    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(job) = by_id.remove(id) else {
            warn!(queue, job_id = %id, "claimed job vanished before hydration");
            continue;
        };
        let context = by_key.get(&job.homogeneity_key()).cloned();
        out.push(HydratedJob { job, context });
    }
    out
}
