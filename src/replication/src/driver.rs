//! Replication driver: one synchronization pass from sender to receiver.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{DatasetPath, Snapshot, StoreError};

use crate::endpoint::{Receiver, Sender};

/// One transfer: a full send when `from` is `None`, incremental otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStep {
    pub from: Option<Snapshot>,
    pub to: Snapshot,
}

impl fmt::Display for ReplicationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.from {
            Some(from) => write!(f, "incremental @{} -> @{}", from.name, self.to.name),
            None => write!(f, "full @{}", self.to.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetStatus {
    /// At least one step was transferred
    Replicated,
    /// Receiver already has the newest snapshot
    UpToDate,
    /// Sender has no prefixed snapshots yet
    NoSnapshots,
    /// The mapping excludes the dataset
    Unmapped,
    /// Receiver has snapshots but none in common with the sender
    Conflict,
    Failed,
    Cancelled,
}

/// Outcome for a single source dataset
#[derive(Debug, Clone)]
pub struct DatasetReport {
    pub source: DatasetPath,
    pub target: Option<DatasetPath>,
    pub status: DatasetStatus,
    /// Steps that completed, in order
    pub steps: Vec<ReplicationStep>,
    pub error: Option<String>,
}

impl DatasetReport {
    fn new(source: DatasetPath) -> Self {
        Self {
            source,
            target: None,
            status: DatasetStatus::Failed,
            steps: Vec::new(),
            error: None,
        }
    }

    fn fail(mut self, status: DatasetStatus, error: impl ToString) -> Self {
        self.status = status;
        self.error = Some(error.to_string());
        self
    }

    fn cancelled(mut self) -> Self {
        self.status = DatasetStatus::Cancelled;
        self
    }
}

/// Result of one replication pass
#[derive(Debug, Clone)]
pub struct ReplicationReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub cancelled: bool,
    pub datasets: Vec<DatasetReport>,
}

impl ReplicationReport {
    pub fn step_count(&self) -> usize {
        self.datasets.iter().map(|d| d.steps.len()).sum()
    }

    pub fn failed(&self) -> impl Iterator<Item = &DatasetReport> {
        self.datasets
            .iter()
            .filter(|d| matches!(d.status, DatasetStatus::Failed | DatasetStatus::Conflict))
    }

    pub fn count(&self, status: DatasetStatus) -> usize {
        self.datasets.iter().filter(|d| d.status == status).count()
    }
}

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("cannot list sender datasets: {0}")]
    ListDatasets(#[source] StoreError),

    #[error("no common snapshot, receiver already has {receiver_snapshots} snapshot(s)")]
    NoCommonAncestor { receiver_snapshots: usize },

    #[error("'{dataset}' maps to '{target}' but the inverse mapping gives {inverse:?}")]
    InverseMismatch {
        dataset: DatasetPath,
        target: DatasetPath,
        inverse: Option<DatasetPath>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Compute the transfers that bring `receiver` up to date with `sender`.
///
/// Both lists are ordered oldest first. The common ancestor is the newest
/// sender snapshot whose guid the receiver has; every newer sender snapshot
/// becomes an incremental step. Without a common ancestor an empty receiver
/// gets a full send of the newest snapshot.
pub fn plan(
    sender: &[Snapshot],
    receiver: &[Snapshot],
) -> Result<Vec<ReplicationStep>, ReplicationError> {
    let Some(newest) = sender.last() else {
        return Ok(Vec::new());
    };

    let ancestor = sender
        .iter()
        .rposition(|s| receiver.iter().any(|r| r.guid == s.guid));

    match ancestor {
        Some(index) => Ok(sender[index..]
            .windows(2)
            .map(|pair| ReplicationStep {
                from: Some(pair[0].clone()),
                to: pair[1].clone(),
            })
            .collect()),
        None if receiver.is_empty() => Ok(vec![ReplicationStep {
            from: None,
            to: newest.clone(),
        }]),
        None => Err(ReplicationError::NoCommonAncestor {
            receiver_snapshots: receiver.len(),
        }),
    }
}

/// Drives one synchronization pass.
#[async_trait]
pub trait Replication: Send + Sync {
    /// Replicate every dataset the sender exposes. Per-dataset failures end
    /// up in the report; only a failure to enumerate the sender is an error.
    async fn drive(
        &self,
        ctx: &CancellationToken,
        sender: &Sender,
        receiver: &Receiver,
    ) -> Result<ReplicationReport, ReplicationError>;
}

/// Replication within one host, both endpoints backed by local storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalReplication;

impl LocalReplication {
    pub fn new() -> Self {
        Self
    }

    async fn replicate_dataset(
        &self,
        ctx: &CancellationToken,
        sender: &Sender,
        receiver: &Receiver,
        source: DatasetPath,
    ) -> DatasetReport {
        let mut report = DatasetReport::new(source);

        let target = match receiver.target(&report.source) {
            Ok(Some(target)) => target,
            Ok(None) => {
                report.status = DatasetStatus::Unmapped;
                return report;
            }
            Err(e) => return report.fail(DatasetStatus::Failed, e),
        };
        report.target = Some(target.clone());

        let Some(sent) = until_cancelled(ctx, sender.list_snapshots(&report.source)).await else {
            return report.cancelled();
        };
        let sent = match sent {
            Ok(snapshots) => snapshots,
            Err(e) => return report.fail(DatasetStatus::Failed, e),
        };
        let Some(received) = until_cancelled(ctx, receiver.list_snapshots(&target)).await else {
            return report.cancelled();
        };
        let received = match received {
            Ok(snapshots) => snapshots,
            Err(e) => return report.fail(DatasetStatus::Failed, e),
        };

        let steps = match plan(&sent, &received) {
            Ok(steps) => steps,
            Err(e) => return report.fail(DatasetStatus::Conflict, e),
        };

        if steps.is_empty() {
            report.status = if sent.is_empty() {
                DatasetStatus::NoSnapshots
            } else {
                DatasetStatus::UpToDate
            };
            return report;
        }

        for step in steps {
            if ctx.is_cancelled() {
                return report.cancelled();
            }

            debug!(
                source = %report.source,
                target = %target,
                step = %step,
                "Replicating snapshot"
            );
            let received = until_cancelled(
                ctx,
                receiver.receive(&report.source, &step.to, step.from.as_ref(), &target),
            )
            .await;
            match received {
                None => return report.cancelled(),
                Some(Err(e)) => {
                    return report.fail(DatasetStatus::Failed, format!("{step}: {e}"));
                }
                Some(Ok(())) => {}
            }
            report.steps.push(step);
        }

        report.status = DatasetStatus::Replicated;
        report
    }
}

#[async_trait]
impl Replication for LocalReplication {
    async fn drive(
        &self,
        ctx: &CancellationToken,
        sender: &Sender,
        receiver: &Receiver,
    ) -> Result<ReplicationReport, ReplicationError> {
        let started_at = Utc::now();
        let mut report = ReplicationReport {
            started_at,
            completed_at: started_at,
            cancelled: false,
            datasets: Vec::new(),
        };

        let Some(sources) = until_cancelled(ctx, sender.list_datasets()).await else {
            report.cancelled = true;
            report.completed_at = Utc::now();
            info!("Replication pass cancelled");
            return Ok(report);
        };
        let sources = sources.map_err(ReplicationError::ListDatasets)?;

        info!(datasets = sources.len(), "Starting replication pass");

        for source in sources {
            if ctx.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let dataset = self.replicate_dataset(ctx, sender, receiver, source).await;
            if let Some(error) = &dataset.error {
                warn!(
                    source = %dataset.source,
                    status = ?dataset.status,
                    error = %error,
                    "Dataset replication failed"
                );
            }
            report.cancelled |= dataset.status == DatasetStatus::Cancelled;
            report.datasets.push(dataset);
        }

        report.completed_at = Utc::now();
        info!(
            datasets = report.datasets.len(),
            steps = report.step_count(),
            failed = report.failed().count(),
            cancelled = report.cancelled,
            duration_ms = (report.completed_at - report.started_at).num_milliseconds(),
            "Replication pass completed"
        );
        Ok(report)
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

#[cfg(test)]
mod tests {
    use super::*;
    use common::testing::InMemoryStore;
    use common::{DatasetMapFilter, PrefixFilter, SnapshotStore};
    use std::sync::Arc;

    fn snap(name: &str, guid: u64) -> Snapshot {
        Snapshot {
            name: name.to_string(),
            guid,
            creation: Utc::now(),
        }
    }

    fn step_names(steps: &[ReplicationStep]) -> Vec<String> {
        steps.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_plan_full_send_of_newest() {
        let sender = vec![snap("zrepl_1", 1), snap("zrepl_2", 2)];

        let steps = plan(&sender, &[]).unwrap();
        assert_eq!(step_names(&steps), vec!["full @zrepl_2"]);
    }

    #[test]
    fn test_plan_incremental_after_common_ancestor() {
        let sender = vec![snap("zrepl_1", 1), snap("zrepl_2", 2), snap("zrepl_3", 3)];
        let receiver = vec![snap("zrepl_1", 1)];

        let steps = plan(&sender, &receiver).unwrap();
        assert_eq!(
            step_names(&steps),
            vec!["incremental @zrepl_1 -> @zrepl_2", "incremental @zrepl_2 -> @zrepl_3"]
        );
    }

    #[test]
    fn test_plan_matches_by_guid_not_name() {
        let sender = vec![snap("zrepl_1", 1), snap("zrepl_2", 2)];
        let receiver = vec![snap("zrepl_2", 99)];

        assert!(matches!(
            plan(&sender, &receiver),
            Err(ReplicationError::NoCommonAncestor { receiver_snapshots: 1 })
        ));
    }

    #[test]
    fn test_plan_up_to_date_and_empty() {
        let sender = vec![snap("zrepl_1", 1)];
        assert!(plan(&sender, &sender).unwrap().is_empty());
        assert!(plan(&[], &[]).unwrap().is_empty());
    }

    struct Fixture {
        store: InMemoryStore,
        sender: Sender,
        receiver: Receiver,
    }

    fn fixture(rules: &[(&str, &str)]) -> Fixture {
        let store = InMemoryStore::new();
        let shared: Arc<dyn SnapshotStore> = Arc::new(store.clone());
        let mapping = Arc::new(DatasetMapFilter::from_rules(rules.iter().copied(), false).unwrap());
        let sender = Sender::new(
            Arc::new(DatasetMapFilter::wildcard()).as_filter(),
            PrefixFilter::new("zrepl_"),
            Arc::clone(&shared),
        );
        let receiver = Receiver::new(mapping, PrefixFilter::new("zrepl_"), shared).unwrap();
        Fixture {
            store,
            sender,
            receiver,
        }
    }

    #[tokio::test]
    async fn test_drive_full_then_incremental() {
        let f = fixture(&[("pool<", "backup")]);
        let now = Utc::now();
        f.store
            .add_snapshot("pool/data", "zrepl_1", now - chrono::Duration::minutes(2))
            .await;
        f.store
            .add_snapshot("pool/data", "zrepl_2", now - chrono::Duration::minutes(1))
            .await;
        let ctx = CancellationToken::new();

        let report = LocalReplication.drive(&ctx, &f.sender, &f.receiver).await.unwrap();
        assert_eq!(report.count(DatasetStatus::Replicated), 1);
        assert_eq!(f.store.snapshot_names("backup/data").await, vec!["zrepl_2"]);

        f.store.add_snapshot("pool/data", "zrepl_3", now).await;
        let report = LocalReplication.drive(&ctx, &f.sender, &f.receiver).await.unwrap();
        assert_eq!(step_names(&report.datasets[0].steps), vec!["incremental @zrepl_2 -> @zrepl_3"]);
        assert_eq!(
            f.store.snapshot_names("backup/data").await,
            vec!["zrepl_2", "zrepl_3"]
        );
    }

    #[tokio::test]
    async fn test_drive_skips_unmapped_and_received_datasets() {
        let f = fixture(&[("pool<", "backup")]);
        f.store.add_snapshot("pool/data", "zrepl_1", Utc::now()).await;
        f.store.add_snapshot("tank/other", "zrepl_1", Utc::now()).await;
        let ctx = CancellationToken::new();

        let report = LocalReplication.drive(&ctx, &f.sender, &f.receiver).await.unwrap();
        assert_eq!(report.count(DatasetStatus::Replicated), 1);
        assert_eq!(report.count(DatasetStatus::Unmapped), 1);

        // backup/data now exists and is outside the mapping's source side
        let report = LocalReplication.drive(&ctx, &f.sender, &f.receiver).await.unwrap();
        assert_eq!(report.count(DatasetStatus::UpToDate), 1);
        assert_eq!(report.count(DatasetStatus::Unmapped), 2);
    }

    #[tokio::test]
    async fn test_conflict_is_isolated_per_dataset() {
        let f = fixture(&[("pool<", "backup")]);
        let now = Utc::now();
        f.store.add_snapshot("pool/a", "zrepl_1", now).await;
        f.store.add_snapshot("pool/b", "zrepl_1", now).await;
        f.store.add_snapshot("backup/a", "zrepl_0", now).await;
        let ctx = CancellationToken::new();

        let report = LocalReplication.drive(&ctx, &f.sender, &f.receiver).await.unwrap();

        let a = report.datasets.iter().find(|d| d.source.to_string() == "pool/a").unwrap();
        assert_eq!(a.status, DatasetStatus::Conflict);
        assert!(a.error.is_some());
        assert_eq!(f.store.snapshot_names("backup/b").await, vec!["zrepl_1"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let f = fixture(&[("pool<", "backup")]);
        f.store.add_snapshot("pool/data", "zrepl_1", Utc::now()).await;
        let ctx = CancellationToken::new();
        ctx.cancel();

        let report = LocalReplication.drive(&ctx, &f.sender, &f.receiver).await.unwrap();
        assert!(report.cancelled);
        assert!(f.store.snapshots("backup/data").await.is_empty());
    }
}
