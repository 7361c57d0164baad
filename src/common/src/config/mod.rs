use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::mapping::{DatasetMapFilter, MappingError};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "dsrepl.toml";

/// Prefix for environment overrides, nested keys separated by `__`.
pub const ENV_PREFIX: &str = "DSREPL__";

/// Characters ZFS does not allow in a snapshot name (besides whitespace).
const INVALID_PREFIX_CHARS: &[char] = &['@', '#', '/'];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZfsConfig {
    /// Path or name of the `zfs` binary
    ///
    /// Env: DSREPL__ZFS__BINARY
    pub binary: String,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            binary: String::from("zfs"),
        }
    }
}

/// Retention policy for one side of a job.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PrunePolicyConfig {
    /// Never destroy anything.
    #[serde(rename = "noprune")]
    NoPrune,
    /// Destroy snapshots older than `max_age + grace_period`, always
    /// keeping the newest `keep_min`.
    MaxAge {
        #[serde(with = "humantime_serde")]
        max_age: Duration,
        #[serde(with = "humantime_serde", default)]
        grace_period: Duration,
        #[serde(default = "default_keep_min")]
        keep_min: usize,
    },
}

fn default_keep_min() -> usize {
    1
}

impl PrunePolicyConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            PrunePolicyConfig::NoPrune => Ok(()),
            PrunePolicyConfig::MaxAge { max_age, .. } if max_age.is_zero() => {
                Err(format!("max_age {max_age:?} must be positive"))
            }
            PrunePolicyConfig::MaxAge { .. } => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RpcDebugConfig {
    /// Log every replication step at info level
    #[serde(default)]
    pub log: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct JobDebugConfig {
    #[serde(default)]
    pub rpc: RpcDebugConfig,
}

/// A job replicating between two parts of the local dataset namespace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalJobConfig {
    pub name: String,
    /// Source pattern to target, e.g. `"pool/data<" = "backup/data"`
    pub mapping: BTreeMap<String, String>,
    pub snapshot_prefix: String,
    /// Snapshot interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub prune_lhs: PrunePolicyConfig,
    pub prune_rhs: PrunePolicyConfig,
    #[serde(default)]
    pub debug: JobDebugConfig,
}

impl LocalJobConfig {
    /// Parse the mapping table.
    pub fn build_mapping(&self) -> Result<DatasetMapFilter, ConfigError> {
        if self.mapping.is_empty() {
            return Err(ConfigError::EmptyMapping {
                job: self.name.clone(),
            });
        }
        DatasetMapFilter::from_rules(
            self.mapping.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            false,
        )
        .map_err(|source| ConfigError::InvalidMapping {
            job: self.name.clone(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyJobName);
        }

        validate_snapshot_prefix(&self.name, &self.snapshot_prefix)?;

        if self.interval.is_zero() {
            return Err(ConfigError::NonPositiveInterval {
                job: self.name.clone(),
            });
        }

        for (side, policy) in [("prune_lhs", &self.prune_lhs), ("prune_rhs", &self.prune_rhs)] {
            policy
                .validate()
                .map_err(|reason| ConfigError::InvalidPrunePolicy {
                    job: self.name.clone(),
                    side,
                    reason,
                })?;
        }

        self.build_mapping()?;
        Ok(())
    }
}

fn validate_snapshot_prefix(job: &str, prefix: &str) -> Result<(), ConfigError> {
    if prefix.is_empty() {
        return Err(ConfigError::EmptySnapshotPrefix {
            job: job.to_string(),
        });
    }
    if let Some(character) = prefix
        .chars()
        .find(|c| INVALID_PREFIX_CHARS.contains(c) || c.is_whitespace())
    {
        return Err(ConfigError::InvalidSnapshotPrefix {
            job: job.to_string(),
            prefix: prefix.to_string(),
            character,
        });
    }
    Ok(())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobConfig {
    Local(LocalJobConfig),
}

impl JobConfig {
    pub fn name(&self) -> &str {
        match self {
            JobConfig::Local(job) => &job.name,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            JobConfig::Local(job) => job.validate(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// ZFS backend configuration
    #[serde(default)]
    pub zfs: ZfsConfig,
    /// Jobs run by the daemon
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl Configuration {
    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
    }

    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Self::figment()
            .merge(Toml::file(DEFAULT_CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Self::figment()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|job| job.name() == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zfs.binary.trim().is_empty() {
            return Err(ConfigError::EmptyZfsBinary);
        }

        let mut names = HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            if !names.insert(job.name()) {
                return Err(ConfigError::DuplicateJobName(job.name().to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("job name must not be empty")]
    EmptyJobName,

    #[error("duplicate job name '{0}'")]
    DuplicateJobName(String),

    #[error("job '{job}': snapshot prefix must not be empty string")]
    EmptySnapshotPrefix { job: String },

    #[error("job '{job}': snapshot prefix '{prefix}' contains invalid character '{character}'")]
    InvalidSnapshotPrefix {
        job: String,
        prefix: String,
        character: char,
    },

    #[error("job '{job}': interval must be positive")]
    NonPositiveInterval { job: String },

    #[error("job '{job}': cannot parse '{side}': {reason}")]
    InvalidPrunePolicy {
        job: String,
        side: &'static str,
        reason: String,
    },

    #[error("job '{job}': mapping must not be empty")]
    EmptyMapping { job: String },

    #[error("job '{job}': invalid mapping: {source}")]
    InvalidMapping {
        job: String,
        #[source]
        source: MappingError,
    },

    #[error("zfs binary must not be empty")]
    EmptyZfsBinary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const LOCAL_JOB: &str = r#"
        [[jobs]]
        type = "local"
        name = "mirror"
        snapshot_prefix = "zrepl_"
        interval = "10m"

        [jobs.mapping]
        "pool/data<" = "backup/data"
        "pool/data/tmp" = "!"

        [jobs.prune_lhs]
        policy = "max_age"
        max_age = "7days"
        keep_min = 3

        [jobs.prune_rhs]
        policy = "noprune"
    "#;

    fn local_job() -> LocalJobConfig {
        LocalJobConfig {
            name: "mirror".to_string(),
            mapping: BTreeMap::from([("<".to_string(), "<".to_string())]),
            snapshot_prefix: "zrepl_".to_string(),
            interval: Duration::from_secs(60),
            prune_lhs: PrunePolicyConfig::NoPrune,
            prune_rhs: PrunePolicyConfig::NoPrune,
            debug: JobDebugConfig::default(),
        }
    }

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();
        assert_eq!(config.zfs.binary, "zfs");
        assert!(config.jobs.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_local_job_from_toml() {
        Jail::expect_with(|jail| {
            jail.create_file(DEFAULT_CONFIG_FILE, LOCAL_JOB)?;

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.jobs.len(), 1);

            let JobConfig::Local(job) = config.job("mirror").expect("job present");
            assert_eq!(job.snapshot_prefix, "zrepl_");
            assert_eq!(job.interval, Duration::from_secs(600));
            assert_eq!(job.mapping.len(), 2);
            assert_eq!(
                job.prune_lhs,
                PrunePolicyConfig::MaxAge {
                    max_age: Duration::from_secs(7 * 24 * 3600),
                    grace_period: Duration::ZERO,
                    keep_min: 3,
                }
            );
            assert_eq!(job.prune_rhs, PrunePolicyConfig::NoPrune);
            assert!(!job.debug.rpc.log);
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_env_var_override() {
        Jail::expect_with(|jail| {
            jail.set_env("DSREPL__ZFS__BINARY", "/usr/sbin/zfs");

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.zfs.binary, "/usr/sbin/zfs");
            Ok(())
        });
    }

    #[test]
    fn test_load_from_path() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", LOCAL_JOB)?;

            let config = Configuration::load_from_path(Path::new("custom.toml")).map_err(|e| *e)?;
            assert!(config.job("mirror").is_some());
            assert!(config.job("other").is_none());
            Ok(())
        });
    }

    #[test]
    fn test_unknown_prune_policy_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                &LOCAL_JOB.replace("policy = \"noprune\"", "policy = \"grid\""),
            )?;

            assert!(Configuration::load().is_err());
            Ok(())
        });
    }

    #[test]
    fn test_snapshot_prefix_validation() {
        let mut job = local_job();
        job.snapshot_prefix = String::new();
        assert!(matches!(
            job.validate(),
            Err(ConfigError::EmptySnapshotPrefix { .. })
        ));

        job.snapshot_prefix = "bad@prefix".to_string();
        assert!(matches!(
            job.validate(),
            Err(ConfigError::InvalidSnapshotPrefix { character: '@', .. })
        ));
    }

    #[test]
    fn test_zero_interval_is_invalid() {
        let mut job = local_job();
        job.interval = Duration::ZERO;
        assert!(matches!(
            job.validate(),
            Err(ConfigError::NonPositiveInterval { .. })
        ));
    }

    #[test]
    fn test_invalid_policy_names_side() {
        let mut job = local_job();
        job.prune_rhs = PrunePolicyConfig::MaxAge {
            max_age: Duration::ZERO,
            grace_period: Duration::ZERO,
            keep_min: 1,
        };

        let err = job.validate().unwrap_err();
        assert!(err.to_string().contains("prune_rhs"));
    }

    #[test]
    fn test_invalid_mapping_is_rejected() {
        let mut job = local_job();
        job.mapping = BTreeMap::from([("pool//x".to_string(), "backup".to_string())]);
        assert!(matches!(
            job.validate(),
            Err(ConfigError::InvalidMapping { .. })
        ));

        job.mapping.clear();
        assert!(matches!(job.validate(), Err(ConfigError::EmptyMapping { .. })));
    }

    #[test]
    fn test_duplicate_job_names() {
        let config = Configuration {
            zfs: ZfsConfig::default(),
            jobs: vec![JobConfig::Local(local_job()), JobConfig::Local(local_job())],
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateJobName(name)) if name == "mirror"
        ));
    }
}
