//! DB-backed job queue driving the sync pipeline.
//!
//! Each job is an independently schedulable unit of work. A worker pops the
//! next due job, runs it under a per-kind deadline, and either deletes it or
//! backs it off. After [`MAX_JOB_ATTEMPTS`] failures the job is dropped and
//! the run it belongs to is marked failed.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::db::model::JobKind;
use crate::db::{repo, Pool};
use crate::ebay::model::ExternalListingItem;
use crate::ebay::EbayService;
use crate::shipping::CarrierService;

pub mod delivery;
pub mod import_batch;
pub mod order_sync;

/// Retry budget per job, counting the first attempt.
pub const MAX_JOB_ATTEMPTS: i32 = 3;

const IMPORT_BATCH_TIMEOUT: Duration = Duration::from_secs(300);
const ORDER_SYNC_TIMEOUT: Duration = Duration::from_secs(600);
const DELIVERY_CHECK_TIMEOUT: Duration = Duration::from_secs(300);

/// One batch of a listings import run. Carries its item chunk so the job is
/// re-runnable in isolation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBatchPayload {
    pub import_log_id: i64,
    pub channel_id: i64,
    /// 1-based batch index within the run.
    pub batch_no: i64,
    pub items: Vec<ExternalListingItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSyncPayload {
    pub channel_id: i64,
    pub lookback_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryCheckPayload {
    pub limit: i64,
}

/// Pop and run the next due job. Returns `Ok(true)` if a job was attempted.
#[instrument(skip_all)]
pub async fn process_next_job(
    pool: &Pool,
    ebay: &dyn EbayService,
    carrier: &dyn CarrierService,
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some((id, kind, payload, attempt)) = repo::next_due_job(pool).await? else {
        return Ok(false);
    };

    let res = run_job(pool, ebay, carrier, kind, &payload).await;
    match res {
        Ok(()) => {
            repo::delete_job(pool, id).await?;
            info!(id, kind = kind.as_str(), "job succeeded");
        }
        Err(err) => {
            if attempt + 1 >= MAX_JOB_ATTEMPTS {
                error!(
                    ?err,
                    id,
                    kind = kind.as_str(),
                    attempt,
                    "job exhausted retry budget; dropping"
                );
                fail_run_for(pool, kind, &payload).await?;
                repo::delete_job(pool, id).await?;
            } else {
                warn!(?err, id, kind = kind.as_str(), attempt, "job failed; backoff");
                repo::backoff_job(pool, id, attempt, max_backoff_secs).await?;
            }
        }
    }
    Ok(true)
}

async fn run_job(
    pool: &Pool,
    ebay: &dyn EbayService,
    carrier: &dyn CarrierService,
    kind: JobKind,
    payload: &str,
) -> Result<()> {
    match kind {
        JobKind::ImportBatch => {
            let payload: ImportBatchPayload =
                serde_json::from_str(payload).context("invalid import batch payload")?;
            with_deadline(IMPORT_BATCH_TIMEOUT, import_batch::run_import_batch(pool, &payload))
                .await
        }
        JobKind::OrderSync => {
            let payload: OrderSyncPayload =
                serde_json::from_str(payload).context("invalid order sync payload")?;
            with_deadline(ORDER_SYNC_TIMEOUT, async {
                order_sync::run_order_sync(pool, ebay, &payload).await.map(|_| ())
            })
            .await
        }
        JobKind::DeliveryCheck => {
            let payload: DeliveryCheckPayload =
                serde_json::from_str(payload).context("invalid delivery check payload")?;
            with_deadline(DELIVERY_CHECK_TIMEOUT, async {
                delivery::run_delivery_check(pool, carrier, payload.limit)
                    .await
                    .map(|_| ())
            })
            .await
        }
    }
}

async fn with_deadline<F>(limit: Duration, fut: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(anyhow!("job timed out after {}s", limit.as_secs())),
    }
}

/// A job that exhausted its retries takes its run down with it.
async fn fail_run_for(pool: &Pool, kind: JobKind, payload: &str) -> Result<()> {
    if kind == JobKind::ImportBatch {
        if let Ok(payload) = serde_json::from_str::<ImportBatchPayload>(payload) {
            repo::mark_import_failed(pool, payload.import_log_id).await?;
        }
    }
    Ok(())
}
