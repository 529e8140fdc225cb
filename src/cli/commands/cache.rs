//! Cache command - inspect and maintain the validation cache

use crate::cache::inspect::{self, DiskUsage, PruneOptions};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::ModcheckResult;
use console::style;
use std::io::{self, Write};
use std::path::Path;
use tracing::debug;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> ModcheckResult<()> {
    let dir = ConfigManager::cache_dir(config);
    debug!("Using cache directory {}", dir.display());

    match args.action {
        CacheAction::Stats { format } => show_stats(&dir, config, format).await,
        CacheAction::Prune { validator_version } => {
            prune_cache(&dir, config, validator_version).await
        }
        CacheAction::Clear { yes } => clear_cache(&dir, yes).await,
    }
}

async fn show_stats(dir: &Path, config: &Config, format: OutputFormat) -> ModcheckResult<()> {
    let usage = inspect::inspect(dir).await?;

    match format {
        OutputFormat::Table => print_stats_table(&usage, config),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&usage)?),
    }
    Ok(())
}

fn print_stats_table(usage: &DiskUsage, config: &Config) {
    println!("{:<16} {}", "DIRECTORY", usage.dir.display());
    if !usage.exists {
        println!();
        println!("No cache directory yet.");
        return;
    }

    let persistence = if config.cache.persistent {
        style("enabled").green().to_string()
    } else {
        style("disabled").yellow().to_string()
    };
    println!("{:<16} {}", "PERSISTENCE", persistence);
    println!("{:<16} {}", "ENTRIES", usage.entries);
    if usage.corrupt > 0 {
        println!("{:<16} {}", "UNREADABLE", style(usage.corrupt).red());
    }
    println!(
        "{:<16} {} / {}",
        "DISK",
        format_bytes(usage.bytes),
        format_budget(config.cache.max_disk_bytes)
    );

    if let (Some(oldest), Some(newest)) = (usage.oldest, usage.newest) {
        println!("{:<16} {}", "OLDEST", oldest.format("%Y-%m-%d %H:%M"));
        println!("{:<16} {}", "NEWEST", newest.format("%Y-%m-%d %H:%M"));
    }

    if !usage.versions.is_empty() {
        println!();
        println!("{:<24} {:>8}", "VALIDATOR VERSION", "ENTRIES");
        println!("{}", "-".repeat(33));
        for (version, count) in &usage.versions {
            println!("{:<24} {:>8}", version, count);
        }
    }
}

async fn prune_cache(
    dir: &Path,
    config: &Config,
    validator_version: Option<String>,
) -> ModcheckResult<()> {
    let options = PruneOptions {
        max_age: config.cache.max_age(),
        validator_version,
        max_disk_bytes: config.cache.max_disk_bytes,
    };

    print!("Pruning cache... ");
    let _ = io::stdout().flush();

    let report = inspect::prune(dir, &options).await?;
    println!(
        "{} removed {} of {} file(s)",
        style("✓").green(),
        report.removed(),
        report.scanned
    );
    if report.removed() > 0 {
        println!(
            "  {} unreadable, {} stale, {} over budget",
            report.removed_corrupt, report.removed_stale, report.removed_for_budget
        );
    }
    println!("  {} left on disk", format_bytes(report.disk_bytes));

    Ok(())
}

async fn clear_cache(dir: &Path, skip_confirm: bool) -> ModcheckResult<()> {
    let usage = inspect::inspect(dir).await?;
    let total = usage.entries + usage.corrupt;

    if total == 0 {
        println!("No cached entries to clear.");
        return Ok(());
    }

    println!(
        "This will remove {} cached entr{} ({}) from {}",
        total,
        if total == 1 { "y" } else { "ies" },
        format_bytes(usage.bytes),
        dir.display()
    );

    if !skip_confirm {
        print!("Are you sure? [y/N] ");
        let _ = io::stdout().flush();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            println!("Failed to read input, aborting.");
            return Ok(());
        }

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let removed = inspect::clear(dir).await?;
    println!("{} cleared {} entr{}", style("✓").green(), removed, if removed == 1 { "y" } else { "ies" });

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn format_budget(bytes: u64) -> String {
    if bytes == 0 {
        "unbounded".to_string()
    } else {
        format_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(64 * 1024 * 1024), "64.0 MiB");
    }

    #[test]
    fn zero_budget_is_unbounded() {
        assert_eq!(format_budget(0), "unbounded");
    }
}
