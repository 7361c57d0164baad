//! Jobs: the long-running units the daemon supervises.
//!
//! A [`LocalJob`] snapshots the datasets selected by its mapping on a
//! fixed interval, replicates them to the mapped targets and prunes both
//! sides. [`run_jobs`] runs a set of jobs until the shared token is
//! cancelled.

pub mod daemon;
pub mod local;
pub mod snapper;

pub use daemon::{build_jobs, run_jobs};
pub use local::{Job, JobError, JobType, LocalJob, PrunerError, Side};
pub use snapper::{IntervalAutosnap, snapshot_name};
