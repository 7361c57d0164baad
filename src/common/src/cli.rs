use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared across all binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Common subcommands
#[derive(Subcommand, Debug, Clone, Default)]
pub enum CommonCommands {
    /// Run all configured jobs until interrupted (default behavior)
    #[default]
    Start,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::{Configuration, JobConfig, PrunePolicyConfig};
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Log level selected by the CLI flags.
    pub fn log_level(args: &CommonArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Initialize logging based on CLI arguments; `RUST_LOG` takes precedence
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level(args)));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    fn describe_policy(policy: &PrunePolicyConfig) -> String {
        match policy {
            PrunePolicyConfig::NoPrune => "noprune".to_string(),
            PrunePolicyConfig::MaxAge {
                max_age,
                grace_period,
                keep_min,
            } => format!(
                "max_age {} (grace {}, keep at least {keep_min})",
                humantime::format_duration(*max_age),
                humantime::format_duration(*grace_period)
            ),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
            return Ok(());
        }

        println!("dsrepl configuration:");
        println!("=====================");
        println!("zfs binary: {}", config.zfs.binary);
        if config.jobs.is_empty() {
            println!("No jobs configured");
        }
        for job in &config.jobs {
            match job {
                JobConfig::Local(local) => {
                    println!();
                    println!("Job '{}' (local)", local.name);
                    println!("  snapshot prefix: {}", local.snapshot_prefix);
                    println!(
                        "  interval: {}",
                        humantime::format_duration(local.interval)
                    );
                    for (pattern, target) in &local.mapping {
                        println!("  map {pattern} => {target}");
                    }
                    println!("  prune_lhs: {}", describe_policy(&local.prune_lhs));
                    println!("  prune_rhs: {}", describe_policy(&local.prune_rhs));
                }
            }
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        tracing::info!("Validating configuration...");
        config.validate().context("Invalid configuration")?;
        tracing::info!(jobs = config.jobs.len(), "Configuration validation passed");
        Ok(())
    }

    /// Handle common CLI commands that don't require starting jobs
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                Ok(true)
            }
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(true)
            }
            CommonCommands::Start => Ok(false),
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    #[test]
    fn test_common_commands_default() {
        let default_cmd = CommonCommands::default();
        assert!(matches!(default_cmd, CommonCommands::Start));
    }

    #[test]
    fn test_version_info() {
        let version = utils::version_info();
        assert!(version.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_log_level_flags() {
        let mut args = CommonArgs {
            config: None,
            verbose: false,
            quiet: false,
        };
        assert_eq!(utils::log_level(&args), "info");

        args.verbose = true;
        assert_eq!(utils::log_level(&args), "debug");

        args.quiet = true;
        assert_eq!(utils::log_level(&args), "warn");
    }

    #[test]
    fn test_start_is_not_handled_as_common_command() {
        let config = Configuration::default();
        assert!(!utils::handle_common_command(&CommonCommands::Start, &config).unwrap());
        assert!(utils::handle_common_command(&CommonCommands::Validate, &config).unwrap());
    }
}
