use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use marketsync::config;
use marketsync::db::{self, model::JobKind, repo};
use marketsync::jobs::OrderSyncPayload;

#[derive(Debug, Parser)]
#[command(author, version, about = "Enqueue an order sync run for a channel")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Sales channel id to sync
    #[arg(long)]
    channel: i64,

    /// Override the configured lookback window (days)
    #[arg(long)]
    days: Option<i64>,
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

    let payload = OrderSyncPayload {
        channel_id: args.channel,
        lookback_days: args.days.unwrap_or(cfg.app.order_lookback_days),
    };
    let payload = serde_json::to_value(&payload)?;
    let job_id = repo::enqueue_job(&pool, JobKind::OrderSync, &payload, Utc::now()).await?;
    info!(job_id, channel = args.channel, "order sync enqueued");
    Ok(())
}
