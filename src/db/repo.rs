use super::model::{
    BatchItemError, Category, ImportLog, ImportStatus, JobKind, OrderOutcome, Rack, ShippedOrder,
    Warehouse,
};
use super::Pool;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, Transaction};
use tracing::instrument;

type JobItem = (i64, JobKind, String, i32);

// ---------------------------------------------------------------------------
// Import log (progress ledger)
//
// All counter mutations are single atomic UPDATE statements so that batches
// belonging to the same run can complete concurrently from different workers.
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_import_log(pool: &Pool, channel_id: i64, total_batches: i64) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO import_logs (channel_id, status, total_batches) VALUES (?, 'pending', ?) RETURNING id",
    )
    .bind(channel_id)
    .bind(total_batches)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// First batch to start moves the run from pending to processing. A no-op for
/// every later batch, and never moves a terminal run backwards.
#[instrument(skip_all)]
pub async fn mark_import_processing(pool: &Pool, import_log_id: i64) -> Result<()> {
    sqlx::query("UPDATE import_logs SET status = 'processing' WHERE id = ? AND status = 'pending'")
        .bind(import_log_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Add one batch's counts to the run's cumulative totals.
#[instrument(skip_all)]
pub async fn add_import_statistics(
    pool: &Pool,
    import_log_id: i64,
    inserted: i64,
    updated: i64,
    failed: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE import_logs SET inserted = inserted + ?, updated = updated + ?, failed = failed + ? WHERE id = ?",
    )
    .bind(inserted)
    .bind(updated)
    .bind(failed)
    .bind(import_log_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Increment `completed_batches` by exactly one. The batch whose increment
/// reaches `total_batches` also flips the run to `completed` and stamps
/// `completed_at`, all in the same UPDATE, so status ownership is
/// unambiguous. The guard keeps the counter from ever exceeding the total.
#[instrument(skip_all)]
pub async fn increment_completed_batches(pool: &Pool, import_log_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE import_logs SET \
            completed_batches = completed_batches + 1, \
            status = CASE \
                WHEN completed_batches + 1 >= total_batches AND status != 'failed' THEN 'completed' \
                ELSE status END, \
            completed_at = CASE \
                WHEN completed_batches + 1 >= total_batches AND completed_at IS NULL THEN CURRENT_TIMESTAMP \
                ELSE completed_at END \
         WHERE id = ? AND completed_batches < total_batches",
    )
    .bind(import_log_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Merge one batch's error list into the run's error map under the batch
/// number. `json_set` touches only this batch's key, so concurrent batches
/// never clobber each other's entries.
#[instrument(skip_all)]
pub async fn record_batch_errors(
    pool: &Pool,
    import_log_id: i64,
    batch_no: i64,
    errors: &[BatchItemError],
) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let payload = serde_json::to_string(errors).context("serialize batch errors")?;
    sqlx::query("UPDATE import_logs SET batch_errors = json_set(batch_errors, '$.' || ?, json(?)) WHERE id = ?")
        .bind(format!("\"{}\"", batch_no))
        .bind(payload)
        .bind(import_log_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Precondition failure for one batch: count the batch's items as failed,
/// record the reason under the batch number, and fail the run in one atomic
/// UPDATE. Guarded on the batch's key in the error map, so every batch of
/// the run counts exactly once and a retried job is a no-op.
#[instrument(skip_all)]
pub async fn fail_import_precondition(
    pool: &Pool,
    import_log_id: i64,
    batch_no: i64,
    item_count: i64,
    message: &str,
) -> Result<()> {
    let entry = serde_json::to_string(&[BatchItemError {
        item_id: String::new(),
        title: String::new(),
        message: message.to_string(),
    }])
    .context("serialize precondition error")?;
    sqlx::query(
        "UPDATE import_logs SET \
            failed = failed + ?, \
            status = 'failed', \
            completed_at = COALESCE(completed_at, CURRENT_TIMESTAMP), \
            batch_errors = json_set(batch_errors, '$.' || ?, json(?)) \
         WHERE id = ? AND json_extract(batch_errors, '$.' || ?) IS NULL",
    )
    .bind(item_count)
    .bind(format!("\"{}\"", batch_no))
    .bind(entry)
    .bind(import_log_id)
    .bind(format!("\"{}\"", batch_no))
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal failure for the whole run. Completed runs are left untouched.
#[instrument(skip_all)]
pub async fn mark_import_failed(pool: &Pool, import_log_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE import_logs SET status = 'failed', completed_at = COALESCE(completed_at, CURRENT_TIMESTAMP) \
         WHERE id = ? AND status != 'completed'",
    )
    .bind(import_log_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_import_log(pool: &Pool, import_log_id: i64) -> Result<ImportLog> {
    let row = sqlx::query(
        "SELECT id, channel_id, status, total_batches, completed_batches, inserted, updated, failed, \
                batch_errors, created_at, completed_at \
         FROM import_logs WHERE id = ?",
    )
    .bind(import_log_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Err(anyhow!("import log {} not found", import_log_id));
    };

    let status_str: String = row.get("status");
    let status = ImportStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("import log {} has unknown status {}", import_log_id, status_str))?;
    let errors_str: String = row.get("batch_errors");
    let batch_errors =
        serde_json::from_str(&errors_str).context("parse import log batch_errors")?;

    Ok(ImportLog {
        id: row.get("id"),
        channel_id: row.get("channel_id"),
        status,
        total_batches: row.get("total_batches"),
        completed_batches: row.get("completed_batches"),
        inserted: row.get("inserted"),
        updated: row.get("updated"),
        failed: row.get("failed"),
        batch_errors,
        created_at: row.get("created_at"),
        completed_at: row.try_get("completed_at").ok(),
    })
}

// ---------------------------------------------------------------------------
// Warehouse / rack defaults
// ---------------------------------------------------------------------------

pub async fn default_warehouse(pool: &Pool) -> Result<Option<Warehouse>> {
    let row = sqlx::query("SELECT id, name, is_default FROM warehouses WHERE is_default = 1 LIMIT 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| Warehouse {
        id: r.get("id"),
        name: r.get("name"),
        is_default: r.get::<i64, _>("is_default") != 0,
    }))
}

pub async fn default_rack(pool: &Pool, warehouse_id: i64) -> Result<Option<Rack>> {
    let row = sqlx::query(
        "SELECT id, warehouse_id, name, is_default FROM racks WHERE warehouse_id = ? AND is_default = 1 LIMIT 1",
    )
    .bind(warehouse_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| Rack {
        id: r.get("id"),
        warehouse_id: r.get("warehouse_id"),
        name: r.get("name"),
        is_default: r.get::<i64, _>("is_default") != 0,
    }))
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// First category whose name contains `needle` as a substring, by default
/// ordering. SQLite LIKE gives the collation's case rules.
pub async fn find_category_containing(
    tx: &mut Transaction<'_, Sqlite>,
    needle: &str,
) -> Result<Option<Category>> {
    let row = sqlx::query(
        "SELECT id, name, slug FROM categories WHERE name LIKE '%' || ? || '%' ORDER BY id LIMIT 1",
    )
    .bind(needle)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|r| Category {
        id: r.get("id"),
        name: r.get("name"),
        slug: r.get("slug"),
    }))
}

pub async fn create_category(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
    slug: &str,
) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO categories (name, slug) VALUES (?, ?) RETURNING id")
        .bind(name)
        .bind(slug)
        .fetch_one(&mut **tx)
        .await?;
    Ok(rec.get("id"))
}

/// Arbitrary existing category, first by default ordering. Fallback target
/// when category creation fails.
pub async fn first_category(tx: &mut Transaction<'_, Sqlite>) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM categories ORDER BY id LIMIT 1")
        .fetch_optional(&mut **tx)
        .await?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// Products, metadata, stock
// ---------------------------------------------------------------------------

pub async fn product_id_by_sku(
    tx: &mut Transaction<'_, Sqlite>,
    sku: &str,
) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM products WHERE sku = ?")
        .bind(sku)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(id)
}

/// Insert-or-update keyed on SKU. On update only the listed columns are
/// overwritten; `short_description` is always reset to '' (behavior carried
/// over from the upstream importer).
#[allow(clippy::too_many_arguments)]
pub async fn upsert_product(
    tx: &mut Transaction<'_, Sqlite>,
    sku: &str,
    name: &str,
    barcode: &str,
    description: &str,
    price: f64,
    category_id: i64,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO products (sku, name, barcode, description, short_description, price, category_id) \
         VALUES (?, ?, ?, ?, '', ?, ?) \
         ON CONFLICT(sku) DO UPDATE SET \
            name = excluded.name, \
            barcode = excluded.barcode, \
            category_id = excluded.category_id, \
            description = excluded.description, \
            price = excluded.price, \
            short_description = '', \
            updated_at = CURRENT_TIMESTAMP \
         RETURNING id",
    )
    .bind(sku)
    .bind(name)
    .bind(barcode)
    .bind(description)
    .bind(price)
    .bind(category_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

pub async fn upsert_product_meta(
    tx: &mut Transaction<'_, Sqlite>,
    product_id: i64,
    meta_key: &str,
    meta_value: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO product_meta (product_id, meta_key, meta_value) VALUES (?, ?, ?) \
         ON CONFLICT(product_id, meta_key) DO UPDATE SET meta_value = excluded.meta_value",
    )
    .bind(product_id)
    .bind(meta_key)
    .bind(meta_value)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn upsert_stock(
    tx: &mut Transaction<'_, Sqlite>,
    product_id: i64,
    warehouse_id: i64,
    rack_id: i64,
    quantity: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO stocks (product_id, warehouse_id, rack_id, quantity) VALUES (?, ?, ?, ?) \
         ON CONFLICT(product_id, warehouse_id, rack_id) DO UPDATE SET quantity = excluded.quantity",
    )
    .bind(product_id)
    .bind(warehouse_id)
    .bind(rack_id)
    .bind(quantity)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Create-or-update keyed on the external order id.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_order(
    pool: &Pool,
    external_order_id: &str,
    channel_id: i64,
    buyer: &str,
    total: f64,
    currency: &str,
    status: &str,
    tracking_number: &str,
    ordered_at: Option<DateTime<Utc>>,
) -> Result<OrderOutcome> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT id FROM orders WHERE external_order_id = ?")
        .bind(external_order_id)
        .fetch_optional(pool)
        .await?;

    sqlx::query(
        "INSERT INTO orders (external_order_id, channel_id, buyer, total, currency, status, tracking_number, ordered_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(external_order_id) DO UPDATE SET \
            buyer = excluded.buyer, \
            total = excluded.total, \
            currency = excluded.currency, \
            status = excluded.status, \
            tracking_number = excluded.tracking_number, \
            ordered_at = excluded.ordered_at, \
            updated_at = CURRENT_TIMESTAMP",
    )
    .bind(external_order_id)
    .bind(channel_id)
    .bind(buyer)
    .bind(total)
    .bind(currency)
    .bind(status)
    .bind(tracking_number)
    .bind(ordered_at)
    .execute(pool)
    .await?;

    Ok(if existing.is_some() {
        OrderOutcome::Updated
    } else {
        OrderOutcome::Created
    })
}

pub async fn count_shipped_orders(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE status = 'shipped'")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn shipped_orders(pool: &Pool, limit: i64) -> Result<Vec<ShippedOrder>> {
    let rows = sqlx::query(
        "SELECT id, external_order_id, tracking_number FROM orders WHERE status = 'shipped' ORDER BY id LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| ShippedOrder {
            id: r.get("id"),
            external_order_id: r.get("external_order_id"),
            tracking_number: r.get("tracking_number"),
        })
        .collect())
}

pub async fn mark_order_delivered(pool: &Pool, order_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE orders SET status = 'delivered', updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Job queue
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn enqueue_job(
    pool: &Pool,
    kind: JobKind,
    payload: &serde_json::Value,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO jobs (kind, payload, attempt, due_at) VALUES (?, ?, 0, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(payload.to_string())
    .bind(due_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_job(pool: &Pool) -> Result<Option<JobItem>> {
    let row = sqlx::query(
        "SELECT id, kind, payload, attempt FROM jobs WHERE datetime(due_at) <= CURRENT_TIMESTAMP \
         ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    if let Some(row) = row {
        let id: i64 = row.get("id");
        let kind_str: String = row.get("kind");
        let kind = JobKind::parse(&kind_str)
            .ok_or_else(|| anyhow!("job {} has unknown kind {}", id, kind_str))?;
        let payload: String = row.get("payload");
        let attempt: i32 = row.get("attempt");
        Ok(Some((id, kind, payload, attempt)))
    } else {
        Ok(None)
    }
}

#[instrument(skip_all)]
pub async fn delete_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn backoff_job(pool: &Pool, id: i64, attempt: i32, max_cap_secs: i64) -> Result<()> {
    // Exponential backoff: 5s * 2^attempt, capped.
    let secs = (5_i64) * (1_i64 << attempt.min(10));
    let cap = if max_cap_secs <= 0 { secs } else { max_cap_secs };
    let secs = secs.min(cap);
    sqlx::query(
        "UPDATE jobs SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_jobs(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
