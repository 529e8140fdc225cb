//! Modcheck - incremental validation cache for content packages
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use modcheck::cli::{Cli, Commands};
use modcheck::config::ConfigManager;
use modcheck::error::ModcheckResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> ModcheckResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug; RUST_LOG wins when set
    let level = match (cli.verbose, config.general.verbose) {
        (0, false) => "warn",
        (0, true) | (1, _) => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("modcheck={level}")));

    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init();
    }

    debug!("Loaded configuration from {}", config_manager.path().display());

    match cli.command {
        Commands::Cache(args) => modcheck::cli::commands::cache(args, &config).await,
        Commands::Config(args) => {
            modcheck::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
