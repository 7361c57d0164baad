pub mod cli;
pub mod config;
pub mod dataset;
pub mod mapping;
pub mod shutdown;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use dataset::{DatasetPath, DatasetPathError};
pub use mapping::{DatasetFilter, DatasetMapFilter, MappingError, PrefixFilter};
pub use store::{Snapshot, SnapshotStore, StoreError};
