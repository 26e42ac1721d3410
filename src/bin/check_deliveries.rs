use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use marketsync::config;
use marketsync::db;
use marketsync::jobs::delivery;
use marketsync::shipping::CarrierClient;

/// One bounded delivery-status scan. Intended to be invoked by an external
/// scheduler that prevents overlapping runs.
#[derive(Debug, Parser)]
#[command(author, version, about = "Check shipped orders for carrier delivery status")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the configured scan limit
    #[arg(long)]
    limit: Option<i64>,
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

    let carrier = CarrierClient::from_config(&cfg)?;
    let limit = args.limit.unwrap_or(cfg.app.delivery_check_limit);

    let summary = delivery::run_delivery_check(&pool, &carrier, limit).await?;
    info!(
        total = summary.total,
        checked = summary.checked,
        delivered = summary.delivered,
        errors = summary.errors,
        "delivery check finished"
    );
    println!(
        "total={} checked={} delivered={} errors={}",
        summary.total, summary.checked, summary.delivered, summary.errors
    );
    Ok(())
}
