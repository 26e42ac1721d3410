use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use marketsync::config;
use marketsync::db;
use marketsync::ebay::EbayClient;
use marketsync::jobs;
use marketsync::shipping::CarrierClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Marketplace sync worker: drains the job queue")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/marketsync.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let ebay = EbayClient::from_config(&cfg)?;
    let carrier = CarrierClient::from_config(&cfg)?;
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let max_backoff = cfg.app.max_backoff_seconds as i64;

    info!("starting sync worker");
    loop {
        match jobs::process_next_job(&pool, &ebay, &carrier, max_backoff).await {
            Ok(processed) => {
                if !processed {
                    tokio::time::sleep(poll_sleep).await;
                }
            }
            Err(err) => {
                error!(?err, "worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
