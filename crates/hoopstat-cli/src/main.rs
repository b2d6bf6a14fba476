use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hoopstat_core::SchemaMode;
use hoopstat_sync::{parse_seasons, read_game_keys, split_sizes, CrawlConfig, DATASET_CSV};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hoopstat")]
#[command(about = "Box score crawler and game dataset builder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch season indexes, schedule pages and box scores into the store.
    Crawl {
        /// Seasons as `2016-2024` or `2019,2021`.
        #[arg(long)]
        seasons: Option<String>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Only follow schedule pages already in the store.
        #[arg(long)]
        offline: bool,
    },
    /// Parse stored box scores and export the game dataset.
    Extract {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long, value_enum)]
        schema_mode: Option<SchemaModeArg>,
    },
    /// Print walk-forward split sizes for an exported dataset.
    Splits {
        #[arg(long)]
        dataset: Option<PathBuf>,
        #[arg(long, default_value_t = 2)]
        start: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SchemaModeArg {
    Strict,
    Reindex,
}

impl From<SchemaModeArg> for SchemaMode {
    fn from(arg: SchemaModeArg) -> Self {
        match arg {
            SchemaModeArg::Strict => SchemaMode::Strict,
            SchemaModeArg::Reindex => SchemaMode::Reindex,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = CrawlConfig::from_env()?;

    match cli.command {
        Commands::Crawl {
            seasons,
            data_dir,
            offline,
        } => {
            if let Some(seasons) = seasons {
                config.seasons = parse_seasons(&seasons).context("--seasons")?;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            let summary = hoopstat_sync::run_crawl(&config, offline).await?;
            println!(
                "crawl complete: run_id={} schedule fetched={} cached={} failed={} box scores fetched={} cached={} failed={} season failures={}",
                summary.run_id,
                summary.schedule_fetched,
                summary.schedule_cached,
                summary.schedule_failed,
                summary.boxscores_fetched,
                summary.boxscores_cached,
                summary.boxscores_failed,
                summary.season_failures
            );
        }
        Commands::Extract {
            data_dir,
            out_dir,
            schema_mode,
        } => {
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(dir) = out_dir {
                config.output_dir = dir;
            }
            if let Some(mode) = schema_mode {
                config.schema_mode = mode.into();
            }
            let summary = hoopstat_sync::run_extract(&config).await?;
            for skipped in &summary.skipped {
                eprintln!("skipped {}: {}", skipped.id, skipped.reason);
            }
            match &summary.manifest {
                Some(manifest) => println!(
                    "extract complete: rows={} skipped={} schema={} out={}",
                    manifest.rows,
                    summary.skipped.len(),
                    manifest.schema_fingerprint,
                    config.output_dir.display()
                ),
                None => println!("extract complete: no box scores parsed"),
            }
        }
        Commands::Splits { dataset, start } => {
            let path = dataset.unwrap_or_else(|| config.output_dir.join(DATASET_CSV));
            let games = read_game_keys(&path)?;
            for split in split_sizes(&games, start) {
                println!(
                    "test={} train_seasons={:?} train_rows={} test_rows={} next_wins={} next_losses={}",
                    split.test_season,
                    split.train_seasons,
                    split.train_rows,
                    split.test_rows,
                    split.test_wins_next,
                    split.test_losses_next
                );
            }
        }
    }

    Ok(())
}
