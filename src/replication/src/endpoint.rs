//! Sender and receiver endpoints over a [`SnapshotStore`].

use std::sync::Arc;

use common::{
    DatasetFilter, DatasetMapFilter, DatasetPath, MappingError, PrefixFilter, Snapshot,
    SnapshotStore, StoreError,
};

use crate::driver::ReplicationError;

/// The sending side: which datasets exist and what snapshots they carry.
pub struct Sender {
    filter: Arc<dyn DatasetFilter>,
    prefix: PrefixFilter,
    store: Arc<dyn SnapshotStore>,
}

impl Sender {
    pub fn new(
        filter: Arc<dyn DatasetFilter>,
        prefix: PrefixFilter,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            filter,
            prefix,
            store,
        }
    }

    pub fn prefix(&self) -> &PrefixFilter {
        &self.prefix
    }

    pub async fn list_datasets(&self) -> Result<Vec<DatasetPath>, StoreError> {
        self.store.list_datasets(self.filter.as_ref()).await
    }

    pub async fn list_snapshots(&self, dataset: &DatasetPath) -> Result<Vec<Snapshot>, StoreError> {
        self.store.list_snapshots(dataset, &self.prefix).await
    }
}

/// The receiving side: places source datasets through the job's mapping.
pub struct Receiver {
    mapping: Arc<DatasetMapFilter>,
    inverse: DatasetMapFilter,
    prefix: PrefixFilter,
    store: Arc<dyn SnapshotStore>,
}

impl Receiver {
    /// Fails if the mapping cannot be inverted.
    pub fn new(
        mapping: Arc<DatasetMapFilter>,
        prefix: PrefixFilter,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self, MappingError> {
        let inverse = mapping.invert()?;
        Ok(Self {
            mapping,
            inverse,
            prefix,
            store,
        })
    }

    pub fn prefix(&self) -> &PrefixFilter {
        &self.prefix
    }

    /// Where `source` is received, `None` if the mapping excludes it.
    ///
    /// The target must map back onto `source` through the inverse mapping.
    pub fn target(&self, source: &DatasetPath) -> Result<Option<DatasetPath>, ReplicationError> {
        let Some(target) = self.mapping.map(source) else {
            return Ok(None);
        };
        match self.inverse.map(&target) {
            Some(back) if back == *source => Ok(Some(target)),
            back => Err(ReplicationError::InverseMismatch {
                dataset: source.clone(),
                target,
                inverse: back,
            }),
        }
    }

    /// Prefixed snapshots on `target`; a missing dataset has none.
    pub async fn list_snapshots(&self, target: &DatasetPath) -> Result<Vec<Snapshot>, StoreError> {
        match self.store.list_snapshots(target, &self.prefix).await {
            Err(StoreError::DatasetNotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    pub async fn receive(
        &self,
        source: &DatasetPath,
        snapshot: &Snapshot,
        base: Option<&Snapshot>,
        target: &DatasetPath,
    ) -> Result<(), StoreError> {
        self.store
            .receive_snapshot(source, snapshot, base, target)
            .await
    }
}
