//! Storage backend seam: datasets and their snapshots.

pub mod zfs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::dataset::DatasetPath;
use crate::mapping::{DatasetFilter, PrefixFilter};

pub use zfs::ZfsCli;

/// A snapshot of one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Name after the `@`.
    pub name: String,
    /// Identity that survives send/receive; equal guids on two datasets
    /// denote the same snapshot.
    pub guid: u64,
    pub creation: DateTime<Utc>,
}

/// Operations the job needs from the storage layer.
///
/// Listings are sorted: datasets by path, snapshots by creation time.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn list_datasets(
        &self,
        filter: &dyn DatasetFilter,
    ) -> Result<Vec<DatasetPath>, StoreError>;

    async fn list_snapshots(
        &self,
        dataset: &DatasetPath,
        filter: &PrefixFilter,
    ) -> Result<Vec<Snapshot>, StoreError>;

    async fn create_snapshot(&self, dataset: &DatasetPath, name: &str) -> Result<(), StoreError>;

    async fn destroy_snapshot(&self, dataset: &DatasetPath, name: &str) -> Result<(), StoreError>;

    /// Transfer `source@snapshot` into `target`.
    ///
    /// With a `base` the transfer is incremental and `base` must exist on
    /// both sides. Without one it is a full transfer that creates `target`.
    async fn receive_snapshot(
        &self,
        source: &DatasetPath,
        snapshot: &Snapshot,
        base: Option<&Snapshot>,
        target: &DatasetPath,
    ) -> Result<(), StoreError>;
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("dataset '{0}' does not exist")]
    DatasetNotFound(DatasetPath),

    #[error("dataset '{0}' already exists")]
    DatasetExists(DatasetPath),

    #[error("snapshot '{dataset}@{name}' does not exist")]
    SnapshotNotFound { dataset: DatasetPath, name: String },

    #[error("snapshot '{dataset}@{name}' already exists")]
    SnapshotExists { dataset: DatasetPath, name: String },

    #[error("'{command}' failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to run '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse '{line}': {reason}")]
    Parse { line: String, reason: String },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
