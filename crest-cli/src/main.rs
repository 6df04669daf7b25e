//! crestmarket CLI: price estimation, history refresh, reports and cache care.
//!
//! Commands:
//! - `prices`: refresh stale history, then estimate prices per region
//! - `history`: recompute weekly averages for every configured item
//! - `report`: export stored estimates as CSV
//! - `names`: show (or reload) region and item names
//! - `cache status`: report response cache size and entry count
//! - `cache purge`: drop expired cache entries

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crest_core::Gatherer;
use crest_market::{
    latest_estimates, save_estimates_csv, AppConfig, CacheBackend, JsonlStore, MarketProcessor,
    NameKind, NameLookup, RegionStatus, RunSummary,
};

const DEFAULT_CONFIG: &str = "crest-market.toml";

#[derive(Parser)]
#[command(
    name = "crestmarket",
    about = "Realistic market prices from CREST order books"
)]
struct Cli {
    /// Path to the TOML config file. Defaults are used when it is absent.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh stale history, then estimate prices.
    Prices {
        /// Regions to process. Defaults to the configured regions.
        #[arg(long = "region")]
        regions: Vec<u64>,

        /// Items to price. Defaults to the configured items.
        #[arg(long = "item")]
        items: Vec<u64>,
    },
    /// Recompute weekly history averages.
    History {
        /// Regions to process. Defaults to the configured regions.
        #[arg(long = "region")]
        regions: Vec<u64>,

        /// Items to refresh. Defaults to the configured items.
        #[arg(long = "item")]
        items: Vec<u64>,
    },
    /// Export stored estimates as CSV.
    Report {
        /// Output file. Prints to stdout when omitted.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Skip name lookups (no network access).
        #[arg(long, default_value_t = false)]
        offline: bool,
    },
    /// Show region and item names for the configured ids.
    Names {
        /// Drop the cached name collections and reload them.
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },
    /// Response cache management.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report cache directory size and entry count.
    Status,
    /// Remove expired entries.
    Purge,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Prices { regions, items } => run_prices(config, regions, items),
        Commands::History { regions, items } => run_history(config, regions, items),
        Commands::Report { output, offline } => run_report(&config, output.as_deref(), offline),
        Commands::Names { refresh } => run_names(&config, refresh),
        Commands::Cache { action } => match action {
            CacheAction::Status => run_cache_status(&config),
            CacheAction::Purge => run_cache_purge(&config),
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        return AppConfig::load(path).with_context(|| format!("failed to load {}", path.display()));
    }
    tracing::info!(path = %path.display(), "no config file, using defaults");
    let mut config = AppConfig::default();
    config.apply_env(|name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

fn processor(config: &AppConfig) -> Result<MarketProcessor<JsonlStore>> {
    let executor = config.connect()?;
    let store = Arc::new(JsonlStore::open(&config.store.path)?);
    Ok(MarketProcessor::new(executor, store, config.market.clone()))
}

fn run_prices(mut config: AppConfig, regions: Vec<u64>, items: Vec<u64>) -> Result<()> {
    if !items.is_empty() {
        config.market.items = items;
    }
    let regions = if regions.is_empty() { config.market.regions.clone() } else { regions };
    let mut processor = processor(&config)?;
    let summary = processor.run_prices(&regions)?;
    print_summary(&summary);
    exit_on_abort(&summary);
    Ok(())
}

fn run_history(mut config: AppConfig, regions: Vec<u64>, items: Vec<u64>) -> Result<()> {
    if !items.is_empty() {
        config.market.items = items;
    }
    let regions = if regions.is_empty() { config.market.regions.clone() } else { regions };
    let mut processor = processor(&config)?;
    let summary = processor.refresh_history(&regions)?;
    print_summary(&summary);
    exit_on_abort(&summary);
    Ok(())
}

fn run_report(config: &AppConfig, output: Option<&Path>, offline: bool) -> Result<()> {
    let store = JsonlStore::open(&config.store.path)?;
    let estimates = latest_estimates(&store)?;
    if estimates.is_empty() {
        eprintln!("No estimates stored in {}", config.store.path.display());
        return Ok(());
    }

    let names = if offline {
        None
    } else {
        let mut names = name_lookup(config)?;
        for e in &estimates {
            names.region(e.region_id);
            names.item(e.item_id);
        }
        Some(names)
    };

    match output {
        Some(path) => {
            save_estimates_csv(&estimates, names.as_ref(), path)?;
            println!("Wrote {} estimate(s) to {}", estimates.len(), path.display());
        }
        None => print!("{}", crest_market::export_estimates_csv(&estimates, names.as_ref())?),
    }
    Ok(())
}

fn name_lookup(config: &AppConfig) -> Result<NameLookup> {
    let executor = config.connect()?;
    Ok(NameLookup::new(
        Gatherer::new(executor),
        config.market.regions_url(),
        config.market.types_url(),
        config.market.names_ttl(),
    ))
}

fn run_names(config: &AppConfig, refresh: bool) -> Result<()> {
    let mut names = name_lookup(config)?;
    if refresh {
        for kind in [NameKind::Region, NameKind::Item] {
            let count = names.refresh(kind)?;
            println!("Reloaded {count} {kind:?} name(s)");
        }
    }

    println!("{:<12} Region", "Id");
    println!("{}", "-".repeat(40));
    for &id in &config.market.regions {
        println!("{:<12} {}", id, names.region(id));
    }
    println!();
    println!("{:<12} Item", "Id");
    println!("{}", "-".repeat(40));
    for &id in &config.market.items {
        println!("{:<12} {}", id, names.item(id));
    }
    Ok(())
}

fn run_cache_status(config: &AppConfig) -> Result<()> {
    if config.cache.backend != CacheBackend::File {
        println!("Cache backend {:?} keeps nothing on disk.", config.cache.backend);
        return Ok(());
    }
    let dir = &config.cache.dir;
    if !dir.exists() {
        println!("Cache directory does not exist: {}", dir.display());
        return Ok(());
    }

    let (entries, total_size) = dir_stats(dir)?;
    println!("Cache: {}", dir.display());
    println!("Entries: {entries}");
    println!("Total size: {}", human_size(total_size));
    Ok(())
}

fn run_cache_purge(config: &AppConfig) -> Result<()> {
    let cache = config.cache.build()?;
    let removed = cache.purge_expired()?;
    println!("Done. Removed {removed} expired entr{}.", if removed == 1 { "y" } else { "ies" });
    Ok(())
}

fn dir_stats(path: &Path) -> Result<(usize, u64)> {
    let mut count = 0;
    let mut size = 0u64;
    for entry in std::fs::read_dir(path)?.flatten() {
        if let Ok(meta) = entry.metadata() {
            if meta.is_file() {
                count += 1;
                size += meta.len();
            }
        }
    }
    Ok((count, size))
}

/// Cache sizes in binary units, capped at GB.
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

fn exit_on_abort(summary: &RunSummary) {
    if summary.aborted() > 0 && summary.completed() == 0 {
        std::process::exit(1);
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("=== {} run ===", summary.kind);
    println!(
        "Period:    {} to {}",
        summary.started_at.format("%Y-%m-%d %H:%M:%S"),
        summary.finished_at.format("%H:%M:%S")
    );
    println!(
        "Regions:   {} completed, {} aborted",
        summary.completed(),
        summary.aborted()
    );
    println!("History:   {} refreshed", summary.history_refreshed());
    println!("Estimates: {}", summary.estimates());
    println!();
    println!(
        "{:<24} {:>9} {:>8} {:>8} {:>7} {:>7} {:>9}",
        "Region", "Estimates", "History", "Fetched", "Cached", "Errors", "Committed"
    );
    println!("{}", "-".repeat(80));
    for r in &summary.regions {
        println!(
            "{:<24} {:>9} {:>8} {:>8} {:>7} {:>7} {:>9}",
            r.region_name,
            r.estimates,
            r.history_refreshed,
            r.fetched,
            r.from_cache,
            r.errors,
            r.operations_committed
        );
        if let RegionStatus::Aborted { stage, reason } = &r.status {
            println!("  ABORTED during {stage}: {reason}");
        }
        if r.skipped > 0 {
            println!("  WARNING: {} item(s) skipped", r.skipped);
        }
    }
    println!();
}
