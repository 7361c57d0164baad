//! One pruning pass over the datasets of one side.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{DatasetFilter, DatasetPath, PrefixFilter, SnapshotStore, StoreError};

use crate::metrics::PruneMetrics;
use crate::policy::{PolicyError, PruneDecision, PrunePolicy};

/// Result of pruning a single dataset
#[derive(Debug, Clone, Default)]
pub struct DatasetPruneResult {
    pub dataset: DatasetPath,
    pub kept: Vec<String>,
    /// Snapshots the policy selected for removal
    pub removed: Vec<String>,
    /// How many of `removed` were actually destroyed (0 in dry-run)
    pub destroyed: usize,
    pub errors: Vec<String>,
}

/// Result of a complete pruning pass
#[derive(Debug, Clone)]
pub struct PruneRunResult {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub dry_run: bool,
    /// Set when the pass stopped early because the job was cancelled
    pub cancelled: bool,
    pub datasets: Vec<DatasetPruneResult>,
    /// Failures not tied to one dataset (e.g. listing datasets)
    pub errors: Vec<String>,
}

impl PruneRunResult {
    pub fn total_removed(&self) -> usize {
        self.datasets.iter().map(|d| d.removed.len()).sum()
    }

    pub fn total_destroyed(&self) -> usize {
        self.datasets.iter().map(|d| d.destroyed).sum()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len() + self.datasets.iter().map(|d| d.errors.len()).sum::<usize>()
    }
}

#[derive(Error, Debug)]
enum DatasetFailure {
    #[error("cannot list snapshots: {0}")]
    Store(#[from] StoreError),
    #[error("policy failed: {0}")]
    Policy(#[from] PolicyError),
}

/// A pruning pass bound to one side of a job.
///
/// `now` is fixed at construction; every age decision in [`Pruner::run`]
/// is made relative to it.
#[derive(Debug, Clone)]
pub struct Pruner {
    now: DateTime<Utc>,
    dry_run: bool,
    filter: Arc<dyn DatasetFilter>,
    prefix: PrefixFilter,
    policy: Arc<dyn PrunePolicy>,
    metrics: Option<PruneMetrics>,
}

impl Pruner {
    pub fn new(
        now: DateTime<Utc>,
        dry_run: bool,
        filter: Arc<dyn DatasetFilter>,
        prefix: PrefixFilter,
        policy: Arc<dyn PrunePolicy>,
    ) -> Self {
        Self {
            now,
            dry_run,
            filter,
            prefix,
            policy,
            metrics: None,
        }
    }

    /// Record pass results into `metrics`.
    pub fn with_metrics(mut self, metrics: PruneMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Same pruner, evaluating ages relative to `now`.
    pub fn with_reference_time(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn policy(&self) -> &dyn PrunePolicy {
        self.policy.as_ref()
    }

    /// Run one pass. Failures are logged and collected in the result.
    pub async fn run(&self, ctx: &CancellationToken, store: &dyn SnapshotStore) -> PruneRunResult {
        let started_at = Utc::now();
        info!(
            reference_time = %self.now.to_rfc3339(),
            policy = self.policy.name(),
            prefix = self.prefix.prefix(),
            dry_run = self.dry_run,
            "Starting pruning pass"
        );

        let mut result = PruneRunResult {
            started_at,
            completed_at: started_at,
            dry_run: self.dry_run,
            cancelled: false,
            datasets: Vec::new(),
            errors: Vec::new(),
        };

        let Some(listed) = until_cancelled(ctx, store.list_datasets(self.filter.as_ref())).await
        else {
            info!("Pruning pass cancelled");
            result.cancelled = true;
            return self.finish(result);
        };
        let datasets = match listed {
            Ok(datasets) => datasets,
            Err(e) => {
                warn!(error = %e, "Failed to list datasets for pruning");
                result.errors.push(format!("cannot list datasets: {e}"));
                return self.finish(result);
            }
        };

        for dataset in datasets {
            if ctx.is_cancelled() {
                info!("Pruning pass cancelled");
                result.cancelled = true;
                break;
            }

            let Some(dataset_result) = self.prune_dataset(ctx, store, dataset).await else {
                continue;
            };
            if !dataset_result.errors.is_empty() {
                warn!(
                    dataset = %dataset_result.dataset,
                    errors = dataset_result.errors.len(),
                    "Pruning dataset failed"
                );
            }
            result.datasets.push(dataset_result);
        }

        if ctx.is_cancelled() && !result.cancelled {
            info!("Pruning pass cancelled");
            result.cancelled = true;
        }

        self.finish(result)
    }

    /// Prune one dataset. `None` if cancelled before the policy decided.
    async fn prune_dataset(
        &self,
        ctx: &CancellationToken,
        store: &dyn SnapshotStore,
        dataset: DatasetPath,
    ) -> Option<DatasetPruneResult> {
        let mut result = DatasetPruneResult {
            dataset,
            ..Default::default()
        };

        let decision = match until_cancelled(ctx, self.decide(store, &result.dataset)).await? {
            Ok(decision) => decision,
            Err(e) => {
                result.errors.push(e.to_string());
                return Some(result);
            }
        };

        result.kept = decision.keep.into_iter().map(|s| s.name).collect();
        result.removed = decision.remove.into_iter().map(|s| s.name).collect();

        debug!(
            dataset = %result.dataset,
            keep = result.kept.len(),
            remove = result.removed.len(),
            "Policy decision"
        );

        for name in &result.removed {
            if self.dry_run {
                info!(
                    dataset = %result.dataset,
                    snapshot = %name,
                    "[DRY-RUN] Would destroy snapshot"
                );
                continue;
            }

            let Some(destroyed) =
                until_cancelled(ctx, store.destroy_snapshot(&result.dataset, name)).await
            else {
                break;
            };
            match destroyed {
                Ok(()) => {
                    info!(dataset = %result.dataset, snapshot = %name, "Destroyed snapshot");
                    result.destroyed += 1;
                }
                Err(e) => {
                    warn!(
                        dataset = %result.dataset,
                        snapshot = %name,
                        error = %e,
                        "Failed to destroy snapshot"
                    );
                    result.errors.push(format!("cannot destroy {name}: {e}"));
                }
            }
        }

        Some(result)
    }

    async fn decide(
        &self,
        store: &dyn SnapshotStore,
        dataset: &DatasetPath,
    ) -> Result<PruneDecision, DatasetFailure> {
        let snapshots = store.list_snapshots(dataset, &self.prefix).await?;
        Ok(self.policy.prune(self.now, dataset, &snapshots)?)
    }

    fn finish(&self, mut result: PruneRunResult) -> PruneRunResult {
        result.completed_at = Utc::now();
        let duration_ms = (result.completed_at - result.started_at)
            .num_milliseconds()
            .max(0) as u64;

        if let Some(metrics) = &self.metrics {
            metrics.record_pass();
            metrics.record_datasets_evaluated(result.datasets.len());
            metrics.record_snapshots_selected(result.total_removed());
            metrics.record_snapshots_destroyed(result.total_destroyed());
            metrics.record_errors(result.error_count());
            metrics.record_duration_ms(duration_ms);
        }

        info!(
            datasets = result.datasets.len(),
            removed = result.total_removed(),
            destroyed = result.total_destroyed(),
            errors = result.error_count(),
            cancelled = result.cancelled,
            dry_run = self.dry_run,
            duration_ms,
            "Pruning pass completed"
        );
        result
    }
}

/// Drive `fut` unless `ctx` is cancelled first.
async fn until_cancelled<F: Future>(ctx: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => None,
        output = fut => Some(output),
    }
}
