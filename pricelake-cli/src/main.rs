//! pricelake CLI: Download, featurize and partition inspection commands.
//!
//! Commands:
//! - `download`: bring the bronze store up to date for the universe (or one sector)
//! - `featurize`: rebuild the silver returns dataset from bronze
//! - `partitions`: list committed bronze partitions
//! - `export`: write the silver dataset to a CSV file in the scratch area

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use pricelake_core::config::LoggingConfig;
use pricelake_core::{DataManager, DownloadSummary, PipelineConfig};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "pricelake",
    about = "pricelake: partitioned equity price store and returns builder"
)]
struct Cli {
    /// Path to the pipeline TOML config.
    #[arg(long, global = true, default_value = "pricelake.toml")]
    config: PathBuf,

    /// Print the run summary as JSON on stdout.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch missing and current periods for every universe symbol.
    Download {
        /// Restrict the run to one sector of the universe.
        #[arg(long)]
        sector: Option<String>,

        /// Re-fetch every period, not just missing and current ones.
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Treat this date (YYYY-MM-DD) as today.
        #[arg(long)]
        as_of: Option<String>,
    },
    /// Rebuild the silver returns dataset from bronze partitions.
    Featurize {
        /// Rebuild even if bronze is unchanged since the last build.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// List committed bronze partitions.
    Partitions {
        /// Only show partitions of this symbol.
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Export the silver dataset to `<scratch_root>/<dataset>.csv`.
    Export,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Download {
            sector,
            force,
            as_of,
        } => {
            config.ingest.force |= force;
            if let Some(as_of) = as_of {
                let date = NaiveDate::parse_from_str(&as_of, "%Y-%m-%d")
                    .with_context(|| format!("invalid --as-of date '{as_of}'"))?;
                config.ingest.as_of = Some(date);
            }
            let manager = DataManager::new(config).context("starting pipeline")?;
            run_download(&manager, sector.as_deref(), cli.json)
        }
        Commands::Featurize { force } => {
            let manager = DataManager::new(config).context("starting pipeline")?;
            let summary = manager.featurize_with(force).context("featurize failed")?;
            if cli.json {
                print_json(&summary)?;
            } else if summary.skipped {
                println!("Features are current ({} symbols); nothing to do.", summary.symbols);
            } else {
                println!(
                    "Features rebuilt: {} symbols, {} rows in {} files.",
                    summary.symbols, summary.rows_written, summary.files_written
                );
            }
            Ok(())
        }
        Commands::Partitions { symbol } => {
            let manager = DataManager::new(config).context("starting pipeline")?;
            let symbol = symbol.map(|s| s.trim().to_ascii_uppercase());
            let keys = manager
                .partitions(symbol.as_deref())
                .context("listing partitions")?;
            if cli.json {
                print_json(&keys)?;
            } else {
                for key in &keys {
                    println!("{:<10} {}", key.symbol, key.period);
                }
                println!("{} partition(s)", keys.len());
            }
            Ok(())
        }
        Commands::Export => {
            let manager = DataManager::new(config).context("starting pipeline")?;
            let (path, rows) = manager.export_features_csv().context("export failed")?;
            println!("Exported {rows} rows to {}", path.display());
            Ok(())
        }
    }
}

/// `RUST_LOG` wins over the configured level. Logs go to stderr so `--json`
/// output stays parseable.
fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.format.as_str() {
        "json" => builder.json().init(),
        _ => builder.init(),
    }
}

fn run_download(manager: &DataManager, sector: Option<&str>, json: bool) -> Result<()> {
    let summary = match sector {
        Some(sector) => manager.download_sector(sector)?,
        None => manager.download_all(),
    };

    if json {
        print_json(&summary)?;
    } else {
        print_download_summary(&summary);
    }

    if !summary.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_download_summary(summary: &DownloadSummary) {
    println!(
        "Symbols: {}/{} succeeded",
        summary.symbols_succeeded, summary.symbols_total
    );
    println!(
        "Partitions: {} written, {} already current",
        summary.partitions_written, summary.partitions_skipped
    );
    println!(
        "Rows written: {}, provider calls: {}",
        summary.rows_written, summary.fetch_calls
    );
    for failure in &summary.failures {
        eprintln!("Error for {} ({:?}): {}", failure.symbol, failure.kind, failure.message);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
