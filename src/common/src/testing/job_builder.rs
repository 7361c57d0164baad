//! Builder for local job configurations used in tests.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::{JobDebugConfig, LocalJobConfig, PrunePolicyConfig};

/// Builder for [`LocalJobConfig`] with defaults suited to tests.
///
/// Without further calls the job is named `test`, replicates `pool<` into
/// `backup`, uses the prefix `zrepl_`, snapshots every 100ms and never prunes.
#[derive(Debug, Clone)]
pub struct TestJobBuilder {
    config: LocalJobConfig,
    default_mapping: bool,
}

impl Default for TestJobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestJobBuilder {
    pub fn new() -> Self {
        Self {
            config: LocalJobConfig {
                name: "test".to_string(),
                mapping: BTreeMap::from([("pool<".to_string(), "backup".to_string())]),
                snapshot_prefix: "zrepl_".to_string(),
                interval: Duration::from_millis(100),
                prune_lhs: PrunePolicyConfig::NoPrune,
                prune_rhs: PrunePolicyConfig::NoPrune,
                debug: JobDebugConfig::default(),
            },
            default_mapping: true,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }

    /// Add a mapping rule. The first call replaces the default mapping.
    pub fn with_mapping(mut self, pattern: &str, target: &str) -> Self {
        if self.default_mapping {
            self.config.mapping.clear();
            self.default_mapping = false;
        }
        self.config
            .mapping
            .insert(pattern.to_string(), target.to_string());
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.config.snapshot_prefix = prefix.to_string();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Prune the left side with `max_age`, keeping at least `keep_min`.
    pub fn with_prune_lhs_max_age(mut self, max_age: Duration, keep_min: usize) -> Self {
        self.config.prune_lhs = PrunePolicyConfig::MaxAge {
            max_age,
            grace_period: Duration::ZERO,
            keep_min,
        };
        self
    }

    /// Prune the right side with `max_age`, keeping at least `keep_min`.
    pub fn with_prune_rhs_max_age(mut self, max_age: Duration, keep_min: usize) -> Self {
        self.config.prune_rhs = PrunePolicyConfig::MaxAge {
            max_age,
            grace_period: Duration::ZERO,
            keep_min,
        };
        self
    }

    pub fn with_rpc_log(mut self) -> Self {
        self.config.debug.rpc.log = true;
        self
    }

    pub fn build(self) -> LocalJobConfig {
        self.config
    }
}
