//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Modcheck - incremental validation cache for content packages
///
/// Inspects and maintains the persistent validation cache and its
/// configuration.
#[derive(Parser, Debug)]
#[command(name = "modcheck")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "MODCHECK_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect and maintain the validation cache
    Cache(CacheArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show entry counts and disk usage
    Stats {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove unreadable, expired, and over-budget entries
    Prune {
        /// Also remove entries written by any other validator version
        #[arg(long)]
        validator_version: Option<String>,
    },

    /// Remove every cached entry
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_cache_stats() {
        let cli = Cli::parse_from(["modcheck", "cache", "stats", "--format", "json"]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Stats { format },
            }) => assert!(matches!(format, OutputFormat::Json)),
            _ => panic!("expected cache stats"),
        }
    }

    #[test]
    fn cli_parses_cache_clear_yes() {
        let cli = Cli::parse_from(["modcheck", "cache", "clear", "-y"]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Clear { yes },
            }) => assert!(yes),
            _ => panic!("expected cache clear"),
        }
    }

    #[test]
    fn cli_parses_prune_version() {
        let cli = Cli::parse_from([
            "modcheck",
            "cache",
            "prune",
            "--validator-version",
            "3",
        ]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Prune { validator_version },
            }) => assert_eq!(validator_version.as_deref(), Some("3")),
            _ => panic!("expected cache prune"),
        }
    }

    #[test]
    fn cli_parses_config_default_action() {
        let cli = Cli::parse_from(["modcheck", "config"]);
        match cli.command {
            Commands::Config(args) => assert!(args.action.is_none()),
            _ => panic!("expected config"),
        }
    }

    #[test]
    fn cli_verbose_count() {
        let cli = Cli::parse_from(["modcheck", "-vv", "config", "path"]);
        assert_eq!(cli.verbose, 2);
    }
}
