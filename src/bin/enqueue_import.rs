use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use marketsync::config;
use marketsync::db;
use marketsync::ebay::EbayClient;
use marketsync::jobs::import_batch;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Fetch a channel's listings and enqueue one import run"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Sales channel id to import
    #[arg(long)]
    channel: i64,

    /// Override the configured batch size
    #[arg(long)]
    batch_size: Option<usize>,
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
    if cfg.channel(args.channel).is_none() {
        return Err(anyhow!("channel {} is not configured", args.channel));
    }

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/marketsync.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let ebay = EbayClient::from_config(&cfg)?;
    let batch_size = args.batch_size.unwrap_or(cfg.app.batch_size);

    let import_log_id =
        import_batch::enqueue_import_run(&pool, &ebay, args.channel, batch_size).await?;
    info!(import_log_id, "import run enqueued; poll the import log for progress");
    println!("{}", import_log_id);
    Ok(())
}
