//! Test utilities for dsrepl.
//!
//! This module provides an in-memory [`SnapshotStore`](crate::store::SnapshotStore)
//! and a builder for job configurations, so jobs can be exercised without a
//! ZFS pool.
//!
//! # Feature Flag
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use common::testing::{InMemoryStore, TestJobBuilder};
//!
//! let store = InMemoryStore::new();
//! store.add_dataset("pool/data").await;
//!
//! let job = TestJobBuilder::new()
//!     .with_mapping("pool<", "backup")
//!     .build();
//! ```

mod job_builder;
mod memory_store;

pub use job_builder::TestJobBuilder;
pub use memory_store::InMemoryStore;
