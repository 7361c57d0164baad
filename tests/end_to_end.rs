use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ntest::timeout;
use tokio_util::sync::CancellationToken;

use common::config::{Configuration, JobConfig};
use common::testing::{InMemoryStore, TestJobBuilder};
use job::{Job, LocalJob, build_jobs, run_jobs};
use replication::{
    LocalReplication, Receiver, Replication, ReplicationError, ReplicationReport, Sender,
};

#[derive(Default)]
struct CountingReplication {
    inner: LocalReplication,
    calls: AtomicUsize,
}

#[async_trait]
impl Replication for CountingReplication {
    async fn drive(
        &self,
        ctx: &CancellationToken,
        sender: &Sender,
        receiver: &Receiver,
    ) -> Result<ReplicationReport, ReplicationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.drive(ctx, sender, receiver).await
    }
}

fn identity_job() -> common::config::LocalJobConfig {
    TestJobBuilder::new()
        .with_name("identity")
        .with_mapping("<", "<")
        .with_prefix("zrepl_")
        .with_interval(Duration::from_secs(1))
        .with_rpc_log()
        .build()
}

#[tokio::test]
#[timeout(10000)]
async fn test_identity_mapping_runs_one_full_cycle() {
    let store = InMemoryStore::new();
    store.add_dataset("pool/data").await;
    let replication = Arc::new(CountingReplication::default());
    let job = Arc::new(
        LocalJob::from_config(&identity_job(), Arc::new(store.clone()), replication.clone())
            .unwrap(),
    );

    let ctx = CancellationToken::new();
    let runner = {
        let job = Arc::clone(&job);
        let ctx = ctx.clone();
        tokio::spawn(async move { job.start(ctx).await })
    };

    tokio::time::sleep(Duration::from_millis(1200)).await;
    ctx.cancel();
    runner.await.unwrap();

    let calls = replication.calls.load(Ordering::SeqCst);
    assert!(calls >= 1);
    // every replication pass was followed by one pruning pass per side
    assert_eq!(job.metrics().passes(), 2 * calls);

    let snapshots = store.snapshot_names("pool/data").await;
    assert!(!snapshots.is_empty());
    assert!(snapshots.iter().all(|name| name.starts_with("zrepl_")));
}

#[tokio::test]
#[timeout(10000)]
async fn test_supervisor_runs_configured_jobs_until_cancelled() {
    let store = InMemoryStore::new();
    store.add_dataset("pool/data").await;
    store.add_dataset("tank/vm").await;

    let config = Configuration {
        jobs: vec![
            JobConfig::Local(
                TestJobBuilder::new()
                    .with_name("pool")
                    .with_mapping("pool<", "backup/pool")
                    .with_interval(Duration::from_millis(100))
                    .build(),
            ),
            JobConfig::Local(
                TestJobBuilder::new()
                    .with_name("tank")
                    .with_mapping("tank<", "backup/tank")
                    .with_prefix("tank_")
                    .with_interval(Duration::from_millis(100))
                    .build(),
            ),
        ],
        ..Configuration::default()
    };
    config.validate().unwrap();

    let jobs = build_jobs(
        &config,
        Arc::new(store.clone()),
        Arc::new(LocalReplication::new()),
    )
    .unwrap();
    let ctx = CancellationToken::new();
    let supervisor = tokio::spawn(run_jobs(jobs, ctx.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    ctx.cancel();
    supervisor.await.unwrap();

    let pool = store.snapshot_names("backup/pool/data").await;
    let tank = store.snapshot_names("backup/tank/vm").await;
    assert!(!pool.is_empty() && pool.iter().all(|n| n.starts_with("zrepl_")));
    assert!(!tank.is_empty() && tank.iter().all(|n| n.starts_with("tank_")));
}
