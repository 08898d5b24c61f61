//! keyword-trends: count configured keywords in RSS feeds every hour and roll
//! them up into trailing windows.
//!
//! Typical cron setup: `keyword-trends ingest` hourly, `keyword-trends aggregate`
//! once a day (or `run` for both).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keyword_trends::config::AppConfig;
use keyword_trends::extract::DictionaryExtractor;
use keyword_trends::hourly_log::HourlyCountLog;
use keyword_trends::ingest::{self, providers};
use keyword_trends::ledger::{DedupLedger, FileLedgerBackend};
use keyword_trends::metrics::Metrics;
use keyword_trends::notify::DiscordNotifier;
use keyword_trends::trend_store::{SqliteTrendStore, TrendStore};
use keyword_trends::trends::{run_with_sqlite, AggregateOptions};

#[derive(Debug, Parser)]
#[command(name = "keyword-trends")]
#[command(about = "Hourly RSS keyword counts and trailing-window trend reports")]
struct Cli {
    /// Config file (default: $TRENDS_CONFIG_PATH, then config/trends.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write Prometheus text exposition here when the command finishes
    #[arg(long, global = true)]
    metrics_file: Option<PathBuf>,

    /// Print the report but do not post it to Discord
    #[arg(long, global = true)]
    no_notify: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch feeds and append this hour's keyword counts
    Ingest,
    /// Roll the hourly log into windows, store and report
    Aggregate,
    /// Ingest, then aggregate
    Run,
    /// Show the most recent stored ranking for one window/source
    Latest {
        #[arg(long)]
        window: String,
        #[arg(long, default_value = "Total")]
        source: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

/// Logs go to stderr so the report on stdout stays clean.
/// `TRENDS_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("keyword_trends=info,ingest=info,aggregate=info,warn"));

    let json = std::env::var("TRENDS_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_default()?,
    };

    let metrics = match &cli.metrics_file {
        Some(_) => Some(Metrics::init()?),
        None => None,
    };

    let outcome = match &cli.command {
        Commands::Ingest => ingest_cmd(&cfg).await,
        Commands::Aggregate => aggregate_cmd(&cfg, cli.no_notify).await,
        Commands::Run => match ingest_cmd(&cfg).await {
            Ok(()) => aggregate_cmd(&cfg, cli.no_notify).await,
            Err(e) => Err(e),
        },
        Commands::Latest {
            window,
            source,
            limit,
        } => latest_cmd(&cfg, window, source, *limit),
    };

    if let (Some(m), Some(path)) = (&metrics, &cli.metrics_file) {
        if let Err(e) = m.write_textfile(path) {
            tracing::warn!(error = ?e, "could not write metrics file");
        }
    }

    outcome
}

async fn ingest_cmd(cfg: &AppConfig) -> Result<()> {
    let feeds = providers::from_config(cfg)?;
    if feeds.is_empty() {
        tracing::warn!("no [[feeds]] configured; nothing to fetch");
    }
    let extractor = DictionaryExtractor::from_config(&cfg.keywords)?;
    if extractor.is_empty() {
        tracing::warn!("keyword dictionary is empty; nothing will be counted");
    }

    let mut ledger = DedupLedger::open(Box::new(FileLedgerBackend::new(
        cfg.storage.ledger_path.clone(),
    )));
    let mut log = HourlyCountLog::open_file(cfg.storage.log_path.clone());

    ingest::run_cycle(
        &feeds,
        &extractor,
        &mut ledger,
        &mut log,
        cfg.retention.ledger_horizon(),
        Utc::now(),
    )
    .await?;
    Ok(())
}

async fn aggregate_cmd(cfg: &AppConfig, no_notify: bool) -> Result<()> {
    let mut log = HourlyCountLog::open_file(cfg.storage.log_path.clone());
    let outcome = run_with_sqlite(
        &mut log,
        &cfg.storage.database_path,
        &AggregateOptions::from_config(cfg),
        Utc::now(),
    );

    println!("{}", outcome.report);

    if !no_notify {
        match DiscordNotifier::from_config(&cfg.notify) {
            Some(discord) => {
                if let Err(e) = discord.send_report(&outcome.report).await {
                    tracing::error!(error = ?e, "Discord delivery failed");
                }
            }
            None => tracing::info!("no Discord webhook configured; report printed only"),
        }
    }

    if let Some(e) = outcome.log_error {
        return Err(e.context("trends were reported without the hourly log"));
    }
    if let Err(e) = outcome.persisted {
        bail!("trends were reported but not saved: {e}");
    }
    Ok(())
}

fn latest_cmd(cfg: &AppConfig, window: &str, source: &str, limit: usize) -> Result<()> {
    let store = SqliteTrendStore::open(&cfg.storage.database_path)
        .with_context(|| format!("opening {}", cfg.storage.database_path.display()))?;
    let rows = store.latest(window, source, limit)?;
    if rows.is_empty() {
        println!("no stored trends for {window}/{source}");
        return Ok(());
    }
    for (rank, (keyword, count)) in rows.iter().enumerate() {
        println!("{}. {keyword}: {count}", rank + 1);
    }
    Ok(())
}
