//! Job supervision.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

use common::SnapshotStore;
use common::config::{Configuration, JobConfig};
use replication::Replication;

use crate::local::{Job, JobError, LocalJob};

/// Build every configured job against `store`.
pub fn build_jobs(
    config: &Configuration,
    store: Arc<dyn SnapshotStore>,
    replication: Arc<dyn Replication>,
) -> Result<Vec<Arc<dyn Job>>, JobError> {
    config
        .jobs
        .iter()
        .map(|job| match job {
            JobConfig::Local(local) => {
                LocalJob::from_config(local, Arc::clone(&store), Arc::clone(&replication))
                    .map(|job| Arc::new(job) as Arc<dyn Job>)
            }
        })
        .collect()
}

/// Run `jobs` concurrently, each on a child of `ctx`. Returns once every
/// job has ended.
pub async fn run_jobs(jobs: Vec<Arc<dyn Job>>, ctx: CancellationToken) {
    let mut tasks = JoinSet::new();

    for job in jobs {
        let name = job.name().to_string();
        let span = info_span!("job", name = %name, job_type = %job.job_type());
        let child = ctx.child_token();
        tasks.spawn(
            async move {
                job.start(child).await;
                name
            }
            .instrument(span),
        );
    }

    info!(jobs = tasks.len(), "Jobs started");

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(name) => info!(job = %name, "Job ended"),
            Err(e) => error!(error = %e, "Job task failed"),
        }
    }

    info!("All jobs ended");
}
