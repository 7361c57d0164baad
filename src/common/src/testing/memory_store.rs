//! In-memory [`SnapshotStore`] with failure injection.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::dataset::DatasetPath;
use crate::mapping::{DatasetFilter, PrefixFilter};
use crate::store::{Snapshot, SnapshotStore, StoreError};

#[derive(Debug, Default)]
struct State {
    datasets: BTreeMap<DatasetPath, Vec<Snapshot>>,
    next_guid: u64,
    failing: HashSet<DatasetPath>,
    destroyed: Vec<(DatasetPath, String)>,
}

impl State {
    fn check_failing(&self, dataset: &DatasetPath) -> Result<(), StoreError> {
        if self.failing.contains(dataset) {
            return Err(StoreError::Unavailable(format!(
                "injected failure for '{dataset}'"
            )));
        }
        Ok(())
    }

    fn snapshots_mut(&mut self, dataset: &DatasetPath) -> Result<&mut Vec<Snapshot>, StoreError> {
        self.datasets
            .get_mut(dataset)
            .ok_or_else(|| StoreError::DatasetNotFound(dataset.clone()))
    }

    fn next_guid(&mut self) -> u64 {
        self.next_guid += 1;
        self.next_guid
    }
}

/// Dataset tree kept in memory.
///
/// Guids are handed out from a counter, so two snapshots only share a guid
/// when one was received from the other.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

fn path(dataset: &str) -> DatasetPath {
    match DatasetPath::parse(dataset) {
        Ok(path) => path,
        Err(e) => panic!("invalid dataset path '{dataset}' in test: {e}"),
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_dataset(&self, dataset: &str) {
        let mut state = self.state.lock().await;
        state.datasets.entry(path(dataset)).or_default();
    }

    /// Add a snapshot with an explicit creation time, creating the dataset
    /// if needed. Returns the snapshot's guid.
    pub async fn add_snapshot(&self, dataset: &str, name: &str, creation: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock().await;
        let guid = state.next_guid();
        let snapshots = state.datasets.entry(path(dataset)).or_default();
        snapshots.push(Snapshot {
            name: name.to_string(),
            guid,
            creation,
        });
        snapshots.sort_by_key(|s| s.creation);
        guid
    }

    /// Snapshots of a dataset, oldest first; empty if the dataset is missing.
    pub async fn snapshots(&self, dataset: &str) -> Vec<Snapshot> {
        self.state
            .lock()
            .await
            .datasets
            .get(&path(dataset))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn snapshot_names(&self, dataset: &str) -> Vec<String> {
        self.snapshots(dataset)
            .await
            .into_iter()
            .map(|s| s.name)
            .collect()
    }

    /// Make every operation on `dataset` fail.
    pub async fn fail_dataset(&self, dataset: &str) {
        self.state.lock().await.failing.insert(path(dataset));
    }

    /// Destroyed snapshots in the order they were destroyed.
    pub async fn destroyed(&self) -> Vec<(DatasetPath, String)> {
        self.state.lock().await.destroyed.clone()
    }
}

#[async_trait]
impl SnapshotStore for InMemoryStore {
    async fn list_datasets(
        &self,
        filter: &dyn DatasetFilter,
    ) -> Result<Vec<DatasetPath>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .datasets
            .keys()
            .filter(|d| filter.filter(d))
            .cloned()
            .collect())
    }

    async fn list_snapshots(
        &self,
        dataset: &DatasetPath,
        filter: &PrefixFilter,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let state = self.state.lock().await;
        state.check_failing(dataset)?;
        let snapshots = state
            .datasets
            .get(dataset)
            .ok_or_else(|| StoreError::DatasetNotFound(dataset.clone()))?;
        Ok(snapshots
            .iter()
            .filter(|s| filter.matches(&s.name))
            .cloned()
            .collect())
    }

    async fn create_snapshot(&self, dataset: &DatasetPath, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_failing(dataset)?;
        let guid = state.next_guid();
        let snapshots = state.snapshots_mut(dataset)?;
        if snapshots.iter().any(|s| s.name == name) {
            return Err(StoreError::SnapshotExists {
                dataset: dataset.clone(),
                name: name.to_string(),
            });
        }
        snapshots.push(Snapshot {
            name: name.to_string(),
            guid,
            creation: Utc::now(),
        });
        Ok(())
    }

    async fn destroy_snapshot(&self, dataset: &DatasetPath, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_failing(dataset)?;
        let snapshots = state.snapshots_mut(dataset)?;
        let position = snapshots.iter().position(|s| s.name == name).ok_or_else(|| {
            StoreError::SnapshotNotFound {
                dataset: dataset.clone(),
                name: name.to_string(),
            }
        })?;
        snapshots.remove(position);
        state.destroyed.push((dataset.clone(), name.to_string()));
        Ok(())
    }

    async fn receive_snapshot(
        &self,
        source: &DatasetPath,
        snapshot: &Snapshot,
        base: Option<&Snapshot>,
        target: &DatasetPath,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_failing(source)?;
        state.check_failing(target)?;

        let on_source = state
            .datasets
            .get(source)
            .ok_or_else(|| StoreError::DatasetNotFound(source.clone()))?;
        let sent = on_source
            .iter()
            .find(|s| s.guid == snapshot.guid)
            .cloned()
            .ok_or_else(|| StoreError::SnapshotNotFound {
                dataset: source.clone(),
                name: snapshot.name.clone(),
            })?;

        match base {
            None => {
                let existing = state.datasets.entry(target.clone()).or_default();
                if !existing.is_empty() {
                    return Err(StoreError::DatasetExists(target.clone()));
                }
                existing.push(sent);
            }
            Some(base) => {
                let existing = state.snapshots_mut(target)?;
                if !existing.iter().any(|s| s.guid == base.guid) {
                    return Err(StoreError::SnapshotNotFound {
                        dataset: target.clone(),
                        name: base.name.clone(),
                    });
                }
                if existing.iter().any(|s| s.guid == sent.guid) {
                    return Err(StoreError::SnapshotExists {
                        dataset: target.clone(),
                        name: sent.name,
                    });
                }
                existing.push(sent);
            }
        }
        Ok(())
    }
}
