//! One batch of the listings import pipeline.
//!
//! Preconditions (default warehouse and rack) are fatal for the whole batch:
//! zero items are processed and the run is marked failed. Otherwise every
//! item in the chunk is reconciled sequentially inside one transaction, with
//! a savepoint per item so a single failure rolls back only that item and
//! never aborts its siblings.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Acquire;
use tracing::{error, info, instrument, warn};

use super::ImportBatchPayload;
use crate::db::model::{BatchItemError, JobKind, ReconcileOutcome};
use crate::db::{repo, Pool};
use crate::ebay::EbayService;
use crate::error::SyncError;
use crate::reconcile;

#[derive(Debug, Default)]
struct BatchCounts {
    inserted: i64,
    updated: i64,
    failed: i64,
}

/// Build a full import run for a channel: fetch active and unsold listings,
/// chunk them, create the shared import log, and enqueue one batch job per
/// chunk. Returns the import log id for progress pollers.
#[instrument(skip(pool, ebay))]
pub async fn enqueue_import_run(
    pool: &Pool,
    ebay: &dyn EbayService,
    channel_id: i64,
    batch_size: usize,
) -> Result<i64> {
    ebay.ensure_valid_token(channel_id)
        .await
        .context("token refresh failed")?;

    let mut items = ebay
        .get_all_active_listings(channel_id)
        .await
        .context("fetching active listings")?;
    let unsold = ebay
        .get_all_unsold_listings(channel_id)
        .await
        .context("fetching unsold listings")?;
    items.extend(unsold);

    let chunks: Vec<&[crate::ebay::model::ExternalListingItem]> =
        items.chunks(batch_size.max(1)).collect();
    let total_batches = chunks.len() as i64;
    let import_log_id = repo::create_import_log(pool, channel_id, total_batches).await?;

    for (idx, chunk) in chunks.iter().enumerate() {
        let payload = ImportBatchPayload {
            import_log_id,
            channel_id,
            batch_no: idx as i64 + 1,
            items: chunk.to_vec(),
        };
        let payload = serde_json::to_value(&payload).context("serialize batch payload")?;
        repo::enqueue_job(pool, JobKind::ImportBatch, &payload, Utc::now()).await?;
    }

    info!(
        import_log_id,
        channel_id,
        total_items = items.len(),
        total_batches,
        "import run enqueued"
    );
    Ok(import_log_id)
}

/// Execute one batch and report its counts into the shared import log.
pub async fn run_import_batch(pool: &Pool, payload: &ImportBatchPayload) -> Result<()> {
    match import_batch_inner(pool, payload).await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(
                ?err,
                import_log_id = payload.import_log_id,
                channel_id = payload.channel_id,
                batch_no = payload.batch_no,
                "import batch failed"
            );
            repo::mark_import_failed(pool, payload.import_log_id).await?;
            Err(err)
        }
    }
}

async fn import_batch_inner(pool: &Pool, payload: &ImportBatchPayload) -> Result<()> {
    let Some(warehouse) = repo::default_warehouse(pool).await? else {
        let err = SyncError::MissingDefaultWarehouse;
        repo::fail_import_precondition(
            pool,
            payload.import_log_id,
            payload.batch_no,
            payload.items.len() as i64,
            &err.to_string(),
        )
        .await?;
        return Err(err.into());
    };
    let Some(rack) = repo::default_rack(pool, warehouse.id).await? else {
        let err = SyncError::MissingDefaultRack(warehouse.id);
        repo::fail_import_precondition(
            pool,
            payload.import_log_id,
            payload.batch_no,
            payload.items.len() as i64,
            &err.to_string(),
        )
        .await?;
        return Err(err.into());
    };

    repo::mark_import_processing(pool, payload.import_log_id).await?;

    let mut counts = BatchCounts::default();
    let mut errors: Vec<BatchItemError> = Vec::new();

    let mut tx = pool.begin().await?;
    for item in &payload.items {
        // Savepoint per item: a failed item undoes only its own writes.
        let mut sp = tx.begin().await?;
        match reconcile::reconcile_item(&mut sp, item, warehouse.id, rack.id, payload.channel_id)
            .await
        {
            Ok(ReconcileOutcome::Inserted) => {
                sp.commit().await?;
                counts.inserted += 1;
            }
            Ok(ReconcileOutcome::Updated) => {
                sp.commit().await?;
                counts.updated += 1;
            }
            Err(err) => {
                sp.rollback().await?;
                warn!(
                    ?err,
                    item_id = %item.item_id,
                    batch_no = payload.batch_no,
                    "item reconciliation failed; continuing"
                );
                counts.failed += 1;
                errors.push(BatchItemError {
                    item_id: item.item_id.clone(),
                    title: item.title.clone(),
                    message: format!("{:#}", err),
                });
            }
        }
    }
    tx.commit().await?;

    repo::add_import_statistics(
        pool,
        payload.import_log_id,
        counts.inserted,
        counts.updated,
        counts.failed,
    )
    .await?;
    repo::record_batch_errors(pool, payload.import_log_id, payload.batch_no, &errors).await?;
    repo::increment_completed_batches(pool, payload.import_log_id).await?;

    info!(
        import_log_id = payload.import_log_id,
        batch_no = payload.batch_no,
        inserted = counts.inserted,
        updated = counts.updated,
        failed = counts.failed,
        "import batch completed"
    );
    Ok(())
}
