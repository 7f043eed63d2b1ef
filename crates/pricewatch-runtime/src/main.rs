//! pricewatchd — price-tracking scheduler daemon, entry point.

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use pricewatch_runtime::collaborators::{JsonExtractor, JsonlStore};
use pricewatch_runtime::config;
use pricewatch_runtime::fetch::HttpFetcher;
use pricewatch_runtime::scheduler::Scheduler;

#[derive(Parser)]
#[command(
    name = "pricewatchd",
    about = "Resilient scrape-job scheduler for price tracking",
    version
)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler (default).
    Run {
        /// Data directory for the JSONL store.
        #[arg(long, default_value = "data")]
        data_dir: String,
    },

    /// Load and validate the config file, then exit.
    Validate,

    /// Print effective defaults and capabilities as JSON.
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Run {
        data_dir: "data".to_string(),
    }) {
        Commands::Run { data_dir } => {
            let cfg = config::load(cli.config.as_deref())?;
            let fetcher = Arc::new(HttpFetcher::new(&cfg.fetch)?);
            let extractor = Arc::new(JsonExtractor);
            let store = Arc::new(JsonlStore::open(Path::new(&data_dir))?);

            let scheduler = Scheduler::new(cfg, fetcher, extractor, store)?;

            let loop_handle = {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.run().await })
            };

            tokio::signal::ctrl_c().await?;
            tracing::info!("interrupt received, draining in-flight runs");
            scheduler.shutdown().await;
            loop_handle.await?;
        }

        Commands::Validate => {
            let path = config::resolve_config_path(cli.config.as_deref());
            match config::load(cli.config.as_deref()) {
                Ok(cfg) => {
                    println!(
                        "OK: {} ({} seeded jobs, tick every {}s)",
                        path.display(),
                        cfg.jobs.len(),
                        cfg.tick_secs
                    );
                }
                Err(e) => {
                    eprintln!("INVALID: {}: {e}", path.display());
                    std::process::exit(1);
                }
            }
        }

        Commands::Info => {
            let info = serde_json::json!({
                "name": "pricewatchd",
                "version": env!("CARGO_PKG_VERSION"),
                "defaults": pricewatch_runtime::RuntimeConfig::default(),
                "job_kinds": ["scrape", "export", "cleanup", "custom"],
                "cadences": ["interval", "daily", "weekly", "once"],
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}
