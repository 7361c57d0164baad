//! Periodic snapshot creation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{DatasetFilter, PrefixFilter, SnapshotStore};

/// Name of a snapshot taken at `now`: `<prefix>YYYYmmdd_HHMMSS_mmm` in UTC.
pub fn snapshot_name(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{prefix}{}", now.format("%Y%m%d_%H%M%S_%3f"))
}

/// Snapshots every dataset admitted by `filter` once per `interval`.
pub struct IntervalAutosnap {
    filter: Arc<dyn DatasetFilter>,
    prefix: String,
    interval: Duration,
    store: Arc<dyn SnapshotStore>,
}

impl IntervalAutosnap {
    pub fn new(
        filter: Arc<dyn DatasetFilter>,
        prefix: impl Into<String>,
        interval: Duration,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            filter,
            prefix: prefix.into(),
            interval,
            store,
        }
    }

    /// Run until `ctx` is cancelled or the receiving end of `did_snaps`
    /// is dropped.
    ///
    /// After each round one notification is offered on `did_snaps`. If the
    /// previous one has not been consumed yet the new one is dropped.
    pub async fn run(self, ctx: CancellationToken, did_snaps: mpsc::Sender<()>) {
        let delay = self.sync_up_delay().await;
        if !delay.is_zero() {
            info!(delay = ?delay, "Waiting for next snapshot slot");
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    debug!("Snapshotter stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            self.snapshot_all().await;

            match did_snaps.try_send(()) {
                Ok(()) => {}
                Err(TrySendError::Full(())) => {
                    warn!("Previous snapshot round not yet handled, dropping notification");
                }
                Err(TrySendError::Closed(())) => {
                    debug!("Snapshot listener gone, stopping snapshotter");
                    return;
                }
            }
        }
    }

    /// How long to wait so the first round lands one interval after the
    /// newest existing snapshot of this job.
    async fn sync_up_delay(&self) -> Duration {
        let datasets = match self.store.list_datasets(self.filter.as_ref()).await {
            Ok(datasets) => datasets,
            Err(e) => {
                warn!(error = %e, "Cannot list datasets, snapshotting immediately");
                return Duration::ZERO;
            }
        };

        let prefix = PrefixFilter::new(self.prefix.clone());
        let mut newest: Option<DateTime<Utc>> = None;
        for dataset in &datasets {
            match self.store.list_snapshots(dataset, &prefix).await {
                Ok(snapshots) => {
                    let latest = snapshots.iter().map(|s| s.creation).max();
                    newest = newest.max(latest);
                }
                Err(e) => warn!(dataset = %dataset, error = %e, "Cannot list snapshots"),
            }
        }

        let Some(newest) = newest else {
            return Duration::ZERO;
        };
        let Ok(interval) = chrono::Duration::from_std(self.interval) else {
            return Duration::ZERO;
        };
        ((newest + interval) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Take one snapshot on every dataset; returns how many succeeded.
    async fn snapshot_all(&self) -> usize {
        let datasets = match self.store.list_datasets(self.filter.as_ref()).await {
            Ok(datasets) => datasets,
            Err(e) => {
                warn!(error = %e, "Cannot list datasets to snapshot");
                return 0;
            }
        };

        let name = snapshot_name(&self.prefix, Utc::now());
        let mut created = 0;
        for dataset in &datasets {
            match self.store.create_snapshot(dataset, &name).await {
                Ok(()) => {
                    debug!(dataset = %dataset, snapshot = %name, "Created snapshot");
                    created += 1;
                }
                Err(e) => {
                    warn!(
                        dataset = %dataset,
                        snapshot = %name,
                        error = %e,
                        "Failed to create snapshot"
                    );
                }
            }
        }

        info!(
            snapshot = %name,
            datasets = datasets.len(),
            created,
            "Finished taking snapshots"
        );
        created
    }
}
