//! Retention policies deciding which snapshots a pruning pass removes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use common::config::PrunePolicyConfig;
use common::{DatasetPath, Snapshot};

/// Outcome of applying a policy to the snapshots of one dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneDecision {
    pub keep: Vec<Snapshot>,
    pub remove: Vec<Snapshot>,
}

/// Decides, for one dataset, which of its snapshots to destroy.
///
/// `snapshots` are the dataset's prefixed snapshots, oldest first. `now`
/// is the pass's reference instant, not the wall clock.
pub trait PrunePolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn prune(
        &self,
        now: DateTime<Utc>,
        dataset: &DatasetPath,
        snapshots: &[Snapshot],
    ) -> Result<PruneDecision, PolicyError>;
}

/// Build the policy configured for one side of a job.
pub fn from_config(config: &PrunePolicyConfig) -> Arc<dyn PrunePolicy> {
    match config {
        PrunePolicyConfig::NoPrune => Arc::new(NoPrune),
        PrunePolicyConfig::MaxAge {
            max_age,
            grace_period,
            keep_min,
        } => Arc::new(MaxAge {
            max_age: *max_age,
            grace_period: *grace_period,
            keep_min: *keep_min,
        }),
    }
}

/// Keeps every snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrune;

impl PrunePolicy for NoPrune {
    fn name(&self) -> &'static str {
        "noprune"
    }

    fn prune(
        &self,
        _now: DateTime<Utc>,
        _dataset: &DatasetPath,
        snapshots: &[Snapshot],
    ) -> Result<PruneDecision, PolicyError> {
        Ok(PruneDecision {
            keep: snapshots.to_vec(),
            remove: Vec::new(),
        })
    }
}

/// Removes snapshots older than `max_age + grace_period`.
///
/// The newest `keep_min` snapshots survive regardless of age so the
/// receiving side always has a base for the next incremental step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxAge {
    pub max_age: Duration,
    pub grace_period: Duration,
    pub keep_min: usize,
}

impl MaxAge {
    /// Snapshots created before the returned instant are expired.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, PolicyError> {
        let effective = self
            .max_age
            .checked_add(self.grace_period)
            .ok_or(PolicyError::RetentionPeriodOverflow {
                max_age: self.max_age,
                grace_period: self.grace_period,
            })?;

        let effective_signed =
            chrono::Duration::from_std(effective).map_err(|e| PolicyError::DurationConversion {
                duration: effective,
                message: e.to_string(),
            })?;

        now.checked_sub_signed(effective_signed)
            .ok_or(PolicyError::CutoffUnderflow { effective })
    }

    /// Human-readable representation for logging.
    pub fn display(&self) -> String {
        format!(
            "max_age={}, grace={}, keep_min={}",
            humantime::format_duration(self.max_age),
            humantime::format_duration(self.grace_period),
            self.keep_min
        )
    }
}

impl PrunePolicy for MaxAge {
    fn name(&self) -> &'static str {
        "max_age"
    }

    fn prune(
        &self,
        now: DateTime<Utc>,
        dataset: &DatasetPath,
        snapshots: &[Snapshot],
    ) -> Result<PruneDecision, PolicyError> {
        let cutoff = self.cutoff(now)?;

        let mut by_age: Vec<&Snapshot> = snapshots.iter().collect();
        by_age.sort_by(|a, b| b.creation.cmp(&a.creation));
        let protected: Vec<u64> = by_age.iter().take(self.keep_min).map(|s| s.guid).collect();

        let (keep, remove): (Vec<Snapshot>, Vec<Snapshot>) = snapshots
            .iter()
            .cloned()
            .partition(|s| protected.contains(&s.guid) || s.creation >= cutoff);

        tracing::trace!(
            dataset = %dataset,
            cutoff = %cutoff.to_rfc3339(),
            policy = %self.display(),
            keep = keep.len(),
            remove = remove.len(),
            "Evaluated max_age policy"
        );

        Ok(PruneDecision { keep, remove })
    }
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("max_age {max_age:?} plus grace period {grace_period:?} overflows")]
    RetentionPeriodOverflow {
        max_age: Duration,
        grace_period: Duration,
    },

    #[error("cannot convert {duration:?} to a signed duration: {message}")]
    DurationConversion { duration: Duration, message: String },

    #[error("cutoff of {effective:?} before the reference time underflows")]
    CutoffUnderflow { effective: Duration },
}
