use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::Mutex;

use marketsync::db::model::{ImportStatus, JobKind};
use marketsync::db::repo;
use marketsync::ebay::model::{ExternalListingItem, ExternalOrder, ListingCategory, Price};
use marketsync::ebay::EbayService;
use marketsync::error::SyncError;
use marketsync::jobs::{self, import_batch, ImportBatchPayload};
use marketsync::shipping::{CarrierService, DeliveryStatus};

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

async fn seed_defaults(pool: &sqlx::SqlitePool) -> (i64, i64) {
    let wid: i64 =
        sqlx::query("INSERT INTO warehouses (name, is_default) VALUES ('Main', 1) RETURNING id")
            .fetch_one(pool)
            .await
            .unwrap()
            .get("id");
    let rid: i64 = sqlx::query(
        "INSERT INTO racks (warehouse_id, name, is_default) VALUES (?, 'A1', 1) RETURNING id",
    )
    .bind(wid)
    .fetch_one(pool)
    .await
    .unwrap()
    .get("id");
    (wid, rid)
}

fn item(n: usize, category: &str) -> ExternalListingItem {
    ExternalListingItem {
        item_id: format!("EB{}", n),
        title: format!("Item {}", n),
        price: Price { value: 9.99 },
        quantity_available: 5,
        category: ListingCategory {
            name: category.to_string(),
        },
        ..Default::default()
    }
}

#[derive(Clone, Default)]
struct RecordingEbay {
    active: Arc<Mutex<Vec<ExternalListingItem>>>,
    unsold: Arc<Mutex<Vec<ExternalListingItem>>>,
    fail_token: Arc<Mutex<bool>>,
    token_calls: Arc<Mutex<i64>>,
}

impl RecordingEbay {
    async fn set_listings(&self, active: Vec<ExternalListingItem>, unsold: Vec<ExternalListingItem>) {
        *self.active.lock().await = active;
        *self.unsold.lock().await = unsold;
    }
}

#[async_trait]
impl EbayService for RecordingEbay {
    async fn ensure_valid_token(&self, _channel_id: i64) -> Result<()> {
        *self.token_calls.lock().await += 1;
        if *self.fail_token.lock().await {
            return Err(anyhow!("refresh rejected"));
        }
        Ok(())
    }

    async fn get_all_active_listings(&self, _channel_id: i64) -> Result<Vec<ExternalListingItem>> {
        Ok(self.active.lock().await.clone())
    }

    async fn get_all_unsold_listings(&self, _channel_id: i64) -> Result<Vec<ExternalListingItem>> {
        Ok(self.unsold.lock().await.clone())
    }

    async fn get_all_orders(
        &self,
        _channel_id: i64,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<ExternalOrder>> {
        Ok(vec![])
    }
}

struct NoopCarrier;

#[async_trait]
impl CarrierService for NoopCarrier {
    async fn delivery_status(&self, _tracking_number: &str) -> Result<DeliveryStatus> {
        Ok(DeliveryStatus::Unknown)
    }
}

async fn drain_queue(pool: &sqlx::SqlitePool, ebay: &RecordingEbay) {
    loop {
        let processed = jobs::process_next_job(pool, ebay, &NoopCarrier, 60)
            .await
            .unwrap();
        if !processed {
            break;
        }
    }
}

#[tokio::test]
async fn import_run_of_250_items_is_idempotent() {
    let pool = setup_pool().await;
    seed_defaults(&pool).await;

    let ebay = RecordingEbay::default();
    let active: Vec<_> = (1..=200).map(|n| item(n, "Widgets")).collect();
    let unsold: Vec<_> = (201..=250).map(|n| item(n, "Widgets")).collect();
    ebay.set_listings(active, unsold).await;

    let log_id = import_batch::enqueue_import_run(&pool, &ebay, 1, 100)
        .await
        .unwrap();
    assert_eq!(*ebay.token_calls.lock().await, 1);
    // 250 items in chunks of 100 -> batches of 100, 100, 50.
    assert_eq!(repo::count_jobs(&pool).await.unwrap(), 3);

    drain_queue(&pool, &ebay).await;

    let log = repo::fetch_import_log(&pool, log_id).await.unwrap();
    assert_eq!(log.status, ImportStatus::Completed);
    assert_eq!(log.total_batches, 3);
    assert_eq!(log.completed_batches, 3);
    assert_eq!(log.inserted, 250);
    assert_eq!(log.updated, 0);
    assert_eq!(log.failed, 0);
    assert_eq!(log.progress_percentage(), 100.0);
    assert!(log.completed_at.is_some());

    let products: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(products, 250);

    // Second sighting of every item: updates only, no duplicate SKUs.
    let log2_id = import_batch::enqueue_import_run(&pool, &ebay, 1, 100)
        .await
        .unwrap();
    drain_queue(&pool, &ebay).await;

    let log2 = repo::fetch_import_log(&pool, log2_id).await.unwrap();
    assert_eq!(log2.status, ImportStatus::Completed);
    assert_eq!(log2.inserted, 0);
    assert_eq!(log2.updated, 250);

    let products: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(products, 250);
}

#[tokio::test]
async fn failing_item_never_aborts_its_siblings() {
    let pool = setup_pool().await;
    seed_defaults(&pool).await;

    // First item has no category name and the category table is empty, so
    // resolution fails for it alone; the later items create "Widgets".
    let items = vec![item(1, ""), item(2, "Widgets"), item(3, "Widgets")];
    let ebay = RecordingEbay::default();
    ebay.set_listings(items, vec![]).await;

    let log_id = import_batch::enqueue_import_run(&pool, &ebay, 1, 100)
        .await
        .unwrap();
    drain_queue(&pool, &ebay).await;

    let log = repo::fetch_import_log(&pool, log_id).await.unwrap();
    assert_eq!(log.status, ImportStatus::Completed);
    assert_eq!(log.completed_batches, 1);
    assert_eq!(log.inserted, 2);
    assert_eq!(log.failed, 1);

    let map = log.batch_errors.as_object().unwrap();
    assert_eq!(map.len(), 1);
    let errors = map["1"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["item_id"], "EB1");
    assert!(errors[0]["message"]
        .as_str()
        .unwrap()
        .contains("cannot resolve category"));

    // The failed item's writes were rolled back; siblings committed.
    let products: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(products, 2);
}

#[tokio::test]
async fn missing_default_warehouse_aborts_batch() {
    let pool = setup_pool().await;
    // No warehouse seeded.

    let log_id = repo::create_import_log(&pool, 1, 1).await.unwrap();
    let payload = ImportBatchPayload {
        import_log_id: log_id,
        channel_id: 1,
        batch_no: 1,
        items: vec![item(1, "Widgets"), item(2, "Widgets"), item(3, "Widgets")],
    };

    let err = import_batch::run_import_batch(&pool, &payload)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::MissingDefaultWarehouse)
    ));

    // Reconciliation never started: zero inserted/updated, every item failed.
    let log = repo::fetch_import_log(&pool, log_id).await.unwrap();
    assert_eq!(log.status, ImportStatus::Failed);
    assert_eq!(log.inserted, 0);
    assert_eq!(log.updated, 0);
    assert_eq!(log.failed, 3);
    assert_eq!(log.completed_batches, 0);
    assert!(log.completed_at.is_some());

    let products: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(products, 0);
}

#[tokio::test]
async fn missing_default_rack_aborts_batch() {
    let pool = setup_pool().await;
    sqlx::query("INSERT INTO warehouses (name, is_default) VALUES ('Main', 1)")
        .execute(&pool)
        .await
        .unwrap();
    // No default rack.

    let log_id = repo::create_import_log(&pool, 1, 1).await.unwrap();
    let payload = ImportBatchPayload {
        import_log_id: log_id,
        channel_id: 1,
        batch_no: 1,
        items: vec![item(1, "Widgets")],
    };

    let err = import_batch::run_import_batch(&pool, &payload)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::MissingDefaultRack(_))
    ));

    let log = repo::fetch_import_log(&pool, log_id).await.unwrap();
    assert_eq!(log.status, ImportStatus::Failed);
    assert_eq!(log.failed, 1);
}

#[tokio::test]
async fn retry_budget_drops_job_without_inflating_counters() {
    let pool = setup_pool().await;
    // No warehouse: every attempt hits the same fatal precondition.

    let ebay = RecordingEbay::default();
    ebay.set_listings(vec![item(1, "Widgets"), item(2, "Widgets")], vec![])
        .await;
    let log_id = import_batch::enqueue_import_run(&pool, &ebay, 1, 100)
        .await
        .unwrap();
    assert_eq!(repo::count_jobs(&pool).await.unwrap(), 1);

    for attempt in 0..jobs::MAX_JOB_ATTEMPTS {
        let processed = jobs::process_next_job(&pool, &ebay, &NoopCarrier, 60)
            .await
            .unwrap();
        assert!(processed, "attempt {} should find the job", attempt);
        // Pull the backed-off job forward so the next attempt is due.
        sqlx::query("UPDATE jobs SET due_at = datetime('now', '-1 seconds')")
            .execute(&pool)
            .await
            .unwrap();
    }

    // Budget exhausted: job dropped, run failed exactly once.
    assert_eq!(repo::count_jobs(&pool).await.unwrap(), 0);
    let log = repo::fetch_import_log(&pool, log_id).await.unwrap();
    assert_eq!(log.status, ImportStatus::Failed);
    assert_eq!(log.failed, 2);
    assert_eq!(log.completed_batches, 0);
}

#[tokio::test]
async fn every_batch_counts_its_items_on_precondition_failure() {
    let pool = setup_pool().await;
    // No warehouse: both batches of the run hit the same fatal precondition.

    let ebay = RecordingEbay::default();
    ebay.set_listings((1..=3).map(|n| item(n, "Widgets")).collect(), vec![])
        .await;
    let log_id = import_batch::enqueue_import_run(&pool, &ebay, 1, 2)
        .await
        .unwrap();
    assert_eq!(repo::count_jobs(&pool).await.unwrap(), 2);

    // Run both jobs through their whole retry budget.
    for _ in 0..jobs::MAX_JOB_ATTEMPTS {
        drain_queue(&pool, &ebay).await;
        sqlx::query("UPDATE jobs SET due_at = datetime('now', '-1 seconds')")
            .execute(&pool)
            .await
            .unwrap();
    }
    assert_eq!(repo::count_jobs(&pool).await.unwrap(), 0);

    // Each batch counted its own items exactly once: 2 + 1, not inflated
    // by retries and not limited to the first failing batch.
    let log = repo::fetch_import_log(&pool, log_id).await.unwrap();
    assert_eq!(log.status, ImportStatus::Failed);
    assert_eq!(log.failed, 3);
    assert_eq!(log.completed_batches, 0);

    let map = log.batch_errors.as_object().unwrap();
    assert_eq!(map.len(), 2);
    for key in ["1", "2"] {
        let msg = map[key][0]["message"].as_str().unwrap();
        assert!(msg.contains("no default warehouse"));
    }
}

#[tokio::test]
async fn enqueue_run_fails_fast_on_token_refresh() {
    let pool = setup_pool().await;
    seed_defaults(&pool).await;

    let ebay = RecordingEbay::default();
    ebay.set_listings(vec![item(1, "Widgets")], vec![]).await;
    *ebay.fail_token.lock().await = true;

    let err = import_batch::enqueue_import_run(&pool, &ebay, 1, 100)
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("token refresh failed"));

    // No run, no jobs.
    assert_eq!(repo::count_jobs(&pool).await.unwrap(), 0);
    let logs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM import_logs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(logs, 0);
}

#[tokio::test]
async fn unknown_job_payload_counts_against_retry_budget() {
    let pool = setup_pool().await;
    let ebay = RecordingEbay::default();

    repo::enqueue_job(
        &pool,
        JobKind::ImportBatch,
        &serde_json::json!({"garbage": true}),
        Utc::now(),
    )
    .await
    .unwrap();

    for _ in 0..jobs::MAX_JOB_ATTEMPTS {
        jobs::process_next_job(&pool, &ebay, &NoopCarrier, 60)
            .await
            .unwrap();
        sqlx::query("UPDATE jobs SET due_at = datetime('now', '-1 seconds')")
            .execute(&pool)
            .await
            .unwrap();
    }
    assert_eq!(repo::count_jobs(&pool).await.unwrap(), 0);
}
