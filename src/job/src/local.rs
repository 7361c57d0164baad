//! The local replication job.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use common::config::{ConfigError, JobDebugConfig, LocalJobConfig};
use common::{DatasetFilter, DatasetMapFilter, MappingError, PrefixFilter, SnapshotStore};
use pruner::{PruneMetrics, PrunePolicy, Pruner, policy};
use replication::{Receiver, Replication, ReplicationReport, Sender};

use crate::snapper::IntervalAutosnap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    LocalReplication,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::LocalReplication => "local-replication",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A long-running unit of work owned by the daemon.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn job_type(&self) -> JobType;

    /// Run until `ctx` is cancelled. Failures are logged and end the
    /// job early.
    async fn start(&self, ctx: CancellationToken);
}

/// One half of a replication relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The sending side, selected by the mapping itself
    Left,
    /// The receiving side, selected by the inverted mapping
    Right,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }

    /// Datasets this side's pruner works on.
    pub fn dataset_filter(
        &self,
        mapping: &Arc<DatasetMapFilter>,
    ) -> Result<Arc<dyn DatasetFilter>, PrunerError> {
        match self {
            Side::Left => Ok(mapping.as_filter()),
            Side::Right => mapping
                .inverted_filter()
                .map_err(PrunerError::InvertMapping),
        }
    }

    pub fn policy(&self, job: &LocalJob) -> Arc<dyn PrunePolicy> {
        match self {
            Side::Left => Arc::clone(&job.prune_lhs),
            Side::Right => Arc::clone(&job.prune_rhs),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = PrunerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" | "lhs" => Ok(Side::Left),
            "right" | "rhs" => Ok(Side::Right),
            _ => Err(PrunerError::UnknownSide(s.to_string())),
        }
    }
}

#[derive(Error, Debug)]
pub enum PrunerError {
    #[error("cannot invert mapping for prune_rhs: {0}")]
    InvertMapping(#[source] MappingError),

    #[error("unknown side '{0}', must be either left or right")]
    UnknownSide(String),
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("job '{job}': cannot set up receiver: {source}")]
    Receiver {
        job: String,
        #[source]
        source: MappingError,
    },

    #[error("job '{job}': cannot create {side} pruner: {source}")]
    Pruner {
        job: String,
        side: Side,
        #[source]
        source: PrunerError,
    },

    #[error("job '{job}': snapshotter exited unexpectedly: {reason}")]
    SnapshotterExited { job: String, reason: String },

    #[error("no job named '{0}'")]
    UnknownJob(String),
}

/// Snapshots, replicates and prunes datasets within one host.
pub struct LocalJob {
    name: String,
    mapping: Arc<DatasetMapFilter>,
    snapshot_prefix: String,
    interval: Duration,
    prune_lhs: Arc<dyn PrunePolicy>,
    prune_rhs: Arc<dyn PrunePolicy>,
    debug: JobDebugConfig,
    store: Arc<dyn SnapshotStore>,
    replication: Arc<dyn Replication>,
    metrics: PruneMetrics,
}

impl LocalJob {
    pub fn from_config(
        config: &LocalJobConfig,
        store: Arc<dyn SnapshotStore>,
        replication: Arc<dyn Replication>,
    ) -> Result<Self, JobError> {
        config.validate()?;
        let mapping = config.build_mapping()?;

        Ok(Self {
            name: config.name.clone(),
            mapping: Arc::new(mapping),
            snapshot_prefix: config.snapshot_prefix.clone(),
            interval: config.interval,
            prune_lhs: policy::from_config(&config.prune_lhs),
            prune_rhs: policy::from_config(&config.prune_rhs),
            debug: config.debug.clone(),
            store,
            replication,
            metrics: PruneMetrics::new(),
        })
    }

    pub fn metrics(&self) -> &PruneMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    fn prefix_filter(&self) -> PrefixFilter {
        PrefixFilter::new(self.snapshot_prefix.clone())
    }

    /// Build the pruner for one side. No I/O; the pass's reference time is
    /// the moment of this call.
    pub fn pruner(&self, side: Side, dry_run: bool) -> Result<Pruner, PrunerError> {
        let filter = side.dataset_filter(&self.mapping)?;
        Ok(Pruner::new(
            Utc::now(),
            dry_run,
            filter,
            self.prefix_filter(),
            side.policy(self),
        )
        .with_metrics(self.metrics.clone()))
    }

    /// Set up endpoints and pruners, then loop until `ctx` is cancelled.
    pub async fn run(&self, ctx: &CancellationToken) -> Result<(), JobError> {
        // The sender sees every dataset; the receiver's mapping decides what
        // is actually replicated.
        let sender = Sender::new(
            Arc::new(DatasetMapFilter::wildcard()).as_filter(),
            self.prefix_filter(),
            Arc::clone(&self.store),
        );
        let receiver = Receiver::new(
            Arc::clone(&self.mapping),
            self.prefix_filter(),
            Arc::clone(&self.store),
        )
        .map_err(|source| JobError::Receiver {
            job: self.name.clone(),
            source,
        })?;

        let plhs = self.setup_pruner(Side::Left)?;
        let prhs = self.setup_pruner(Side::Right)?;

        let snapper = IntervalAutosnap::new(
            self.mapping.as_filter(),
            self.snapshot_prefix.clone(),
            self.interval,
            Arc::clone(&self.store),
        );
        let (did_snaps_tx, mut did_snaps) = mpsc::channel(1);
        let snapper_handle = tokio::spawn(
            snapper
                .run(ctx.clone(), did_snaps_tx)
                .instrument(info_span!("snap", job = %self.name)),
        );

        info!(
            job = %self.name,
            interval = ?self.interval,
            prefix = %self.snapshot_prefix,
            "Job started"
        );

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    info!(job = %self.name, "Job cancelled");
                    break;
                }
                signal = did_snaps.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    debug!(job = %self.name, "Finished taking snapshots");
                }
            }

            info!(job = %self.name, "Starting replication procedure");
            self.replicate(ctx, &sender, &receiver)
                .instrument(info_span!("replication", job = %self.name))
                .await;

            let now = Utc::now();
            let mut lhs = self.spawn_pruner(ctx, plhs.clone().with_reference_time(now), Side::Left);
            let mut rhs = self.spawn_pruner(ctx, prhs.clone().with_reference_time(now), Side::Right);
            let (lhs, rhs) = tokio::select! {
                joined = async { tokio::join!(&mut lhs, &mut rhs) } => joined,
                _ = ctx.cancelled() => {
                    info!(job = %self.name, "Job cancelled while pruning, stopping pruners");
                    lhs.abort();
                    rhs.abort();
                    tokio::join!(lhs, rhs)
                }
            };
            for (side, joined) in [(Side::Left, lhs), (Side::Right, rhs)] {
                match joined {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {
                        debug!(job = %self.name, side = %side, "Pruning task aborted");
                    }
                    Err(e) => {
                        error!(job = %self.name, side = %side, error = %e, "Pruning task failed");
                    }
                }
            }

            info!(job = %self.name, metrics = %self.metrics.summary(), "Cycle completed");
        }

        drop(did_snaps);
        let snapper_result = snapper_handle.await;
        if ctx.is_cancelled() {
            if let Err(e) = snapper_result {
                error!(job = %self.name, error = %e, "Snapshotter task failed");
            }
            return Ok(());
        }

        // The loop only ends uncancelled when the snapshotter is gone.
        let reason = match snapper_result {
            Ok(()) => "stopped without cancellation".to_string(),
            Err(e) => e.to_string(),
        };
        Err(JobError::SnapshotterExited {
            job: self.name.clone(),
            reason,
        })
    }

    fn setup_pruner(&self, side: Side) -> Result<Pruner, JobError> {
        self.pruner(side, false).map_err(|source| JobError::Pruner {
            job: self.name.clone(),
            side,
            source,
        })
    }

    async fn replicate(&self, ctx: &CancellationToken, sender: &Sender, receiver: &Receiver) {
        match self.replication.drive(ctx, sender, receiver).await {
            Ok(report) => self.log_report(&report),
            Err(e) => error!(error = %e, "Replication failed"),
        }
    }

    fn log_report(&self, report: &ReplicationReport) {
        for dataset in &report.datasets {
            for step in &dataset.steps {
                if self.debug.rpc.log {
                    info!(source = %dataset.source, step = %step, "Replication step");
                } else {
                    debug!(source = %dataset.source, step = %step, "Replication step");
                }
            }
        }
        for dataset in report.failed() {
            warn!(
                source = %dataset.source,
                status = ?dataset.status,
                error = dataset.error.as_deref().unwrap_or(""),
                "Dataset not replicated"
            );
        }
    }

    fn spawn_pruner(
        &self,
        ctx: &CancellationToken,
        pruner: Pruner,
        side: Side,
    ) -> tokio::task::JoinHandle<()> {
        let span = match side {
            Side::Left => info_span!("prune_lhs", job = %self.name),
            Side::Right => info_span!("prune_rhs", job = %self.name),
        };
        let ctx = ctx.clone();
        let store = Arc::clone(&self.store);
        tokio::spawn(
            async move {
                pruner.run(&ctx, store.as_ref()).await;
            }
            .instrument(span),
        )
    }
}

#[async_trait]
impl Job for LocalJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn job_type(&self) -> JobType {
        JobType::LocalReplication
    }

    async fn start(&self, ctx: CancellationToken) {
        if let Err(e) = self.run(&ctx).await {
            error!(job = %self.name, error = %e, "Job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::testing::{InMemoryStore, TestJobBuilder};
    use replication::LocalReplication;

    fn job(config: &LocalJobConfig) -> Result<LocalJob, JobError> {
        LocalJob::from_config(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(LocalReplication::new()),
        )
    }

    #[test]
    fn test_identity() {
        let job = job(&TestJobBuilder::new().with_name("mirror").build()).unwrap();
        assert_eq!(job.name(), "mirror");
        assert_eq!(job.job_type(), JobType::LocalReplication);
        assert_eq!(job.job_type().to_string(), "local-replication");
    }

    #[test]
    fn test_side_from_str() {
        assert_eq!("left".parse::<Side>().unwrap(), Side::Left);
        assert_eq!("RHS".parse::<Side>().unwrap(), Side::Right);
        assert!(matches!(
            "middle".parse::<Side>(),
            Err(PrunerError::UnknownSide(s)) if s == "middle"
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TestJobBuilder::new().with_prefix("").build();
        assert!(matches!(job(&config), Err(JobError::Config(_))));
    }

    #[test]
    fn test_pruner_sides_use_their_filter_and_policy() {
        let config = TestJobBuilder::new()
            .with_mapping("pool<", "backup")
            .with_prune_lhs_max_age(Duration::from_secs(3600), 1)
            .build();
        let job = job(&config).unwrap();

        let left = job.pruner(Side::Left, false).unwrap();
        let right = job.pruner(Side::Right, true).unwrap();

        assert_eq!(left.policy().name(), "max_age");
        assert!(!left.is_dry_run());
        assert_eq!(right.policy().name(), "noprune");
        assert!(right.is_dry_run());
    }

    #[test]
    fn test_right_pruner_fails_when_mapping_is_not_invertible() {
        let config = TestJobBuilder::new()
            .with_mapping("pool/a", "backup/x")
            .with_mapping("pool/b", "backup/x")
            .build();
        let job = job(&config).unwrap();

        assert!(job.pruner(Side::Left, false).is_ok());
        assert!(matches!(
            job.pruner(Side::Right, false),
            Err(PrunerError::InvertMapping(MappingError::NotInvertible(_)))
        ));
    }

    #[test]
    fn test_pruner_reference_time_is_construction_time() {
        let job = job(&TestJobBuilder::new().build()).unwrap();
        let before = Utc::now();
        let pruner = job.pruner(Side::Left, true).unwrap();
        let after = Utc::now();

        assert!(pruner.now() >= before && pruner.now() <= after);
    }
}
