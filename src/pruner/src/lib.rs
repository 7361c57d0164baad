//! Snapshot pruning
//!
//! A [`Pruner`] binds one side of a job (its dataset filter, the snapshot
//! prefix and a [`PrunePolicy`]) to a reference instant and applies the
//! policy's decisions to a [`SnapshotStore`](common::SnapshotStore).
//!
//! ## Safety Guarantees
//!
//! - Dry-run passes never destroy anything
//! - A failing dataset is logged and skipped, the pass continues
//! - All age decisions in a pass use the instant the pruner was built with

pub mod metrics;
pub mod pass;
pub mod policy;

pub use metrics::PruneMetrics;
pub use pass::{DatasetPruneResult, PruneRunResult, Pruner};
pub use policy::{MaxAge, NoPrune, PolicyError, PruneDecision, PrunePolicy};
