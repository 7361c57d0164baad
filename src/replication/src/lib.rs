//! Replication between the two sides of a job
//!
//! The [`Sender`] sees every dataset its filter admits; the [`Receiver`]
//! decides where each one lands through the job's mapping. A
//! [`Replication`] driver moves snapshots from one to the other.

pub mod driver;
pub mod endpoint;

pub use driver::{
    DatasetReport, DatasetStatus, LocalReplication, Replication, ReplicationError,
    ReplicationReport, ReplicationStep, plan,
};
pub use endpoint::{Receiver, Sender};
