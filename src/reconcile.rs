//! Reconciliation of one external record against the local store.
//!
//! Each listing maps to one product keyed by SKU = external item id, plus a
//! fixed set of metadata rows and exactly one stock row in the default
//! warehouse/rack. All writes are storage-level upserts, so re-processing an
//! item is idempotent.

use anyhow::Result;
use sqlx::{Sqlite, Transaction};
use tracing::warn;

use crate::db::model::{OrderOutcome, ReconcileOutcome};
use crate::db::{repo, Pool};
use crate::ebay::model::{ExternalListingItem, ExternalOrder};
use crate::error::SyncError;

/// Metadata keys written for every listing, in upsert order. Values missing
/// from the external payload are written as "" (or "0" for quantities),
/// never NULL.
const META_KEYS: &[&str] = &[
    "item_id",
    "listing_url",
    "listing_type",
    "listing_status",
    "weight",
    "weight_unit",
    "length",
    "width",
    "height",
    "dimension_unit",
    "condition",
    "quantity_available",
    "sales_channel_id",
];

/// At most this many image URLs are mirrored into metadata.
const MAX_IMAGES: usize = 3;

/// Reconcile one external listing into the product table.
///
/// Runs inside the caller's transaction (batch jobs hand in a per-item
/// savepoint so a failure here rolls back only this item).
pub async fn reconcile_item(
    tx: &mut Transaction<'_, Sqlite>,
    item: &ExternalListingItem,
    warehouse_id: i64,
    rack_id: i64,
    channel_id: i64,
) -> Result<ReconcileOutcome> {
    let category_id = resolve_category(tx, &item.category.name).await?;

    let existing = repo::product_id_by_sku(tx, &item.item_id).await?;
    let product_id = repo::upsert_product(
        tx,
        &item.item_id,
        &item.title,
        &item.item_id,
        &item.description,
        item.price.value,
        category_id,
    )
    .await?;

    for (key, value) in metadata_pairs(item, channel_id) {
        repo::upsert_product_meta(tx, product_id, key, &value).await?;
    }

    for (n, url) in item.picture_urls.iter().take(MAX_IMAGES).enumerate() {
        let key = format!("image_url_{}", n + 1);
        repo::upsert_product_meta(tx, product_id, &key, url).await?;
    }

    repo::upsert_stock(tx, product_id, warehouse_id, rack_id, item.quantity_available).await?;

    Ok(if existing.is_some() {
        ReconcileOutcome::Updated
    } else {
        ReconcileOutcome::Inserted
    })
}

/// Resolve the local category for an external category name.
///
/// Order: substring match against existing categories, then create, then
/// fall back to the first category in the table. The arbitrary-first
/// fallback is carried over from the upstream importer unchanged; it can
/// miscategorize products when creation fails, but changing it silently
/// would change observable behavior.
async fn resolve_category(tx: &mut Transaction<'_, Sqlite>, name: &str) -> Result<i64> {
    let name = name.trim();
    if !name.is_empty() {
        if let Some(cat) = repo::find_category_containing(tx, name).await? {
            return Ok(cat.id);
        }
        match repo::create_category(tx, name, &slugify(name)).await {
            Ok(id) => return Ok(id),
            Err(err) => {
                warn!(category = name, ?err, "category creation failed; falling back");
            }
        }
    }

    if let Some(id) = repo::first_category(tx).await? {
        return Ok(id);
    }
    Err(SyncError::CategoryResolution(format!(
        "no existing category to fall back to for '{}'",
        name
    ))
    .into())
}

fn metadata_pairs(item: &ExternalListingItem, channel_id: i64) -> Vec<(&'static str, String)> {
    META_KEYS
        .iter()
        .map(|&key| {
            let value = match key {
                "item_id" => item.item_id.clone(),
                "listing_url" => item.listing_url.clone(),
                "listing_type" => item.listing_type.clone(),
                "listing_status" => item.listing_status.clone(),
                "weight" => item.weight.clone(),
                "weight_unit" => item.weight_unit.clone(),
                "length" => item.length.clone(),
                "width" => item.width.clone(),
                "height" => item.height.clone(),
                "dimension_unit" => item.dimension_unit.clone(),
                "condition" => item.condition.clone(),
                "quantity_available" => item.quantity_available.to_string(),
                "sales_channel_id" => channel_id.to_string(),
                _ => unreachable!("unhandled meta key {key}"),
            };
            (key, value)
        })
        .collect()
}

/// Create-or-update one external order keyed by its external order id.
pub async fn reconcile_order(
    pool: &Pool,
    order: &ExternalOrder,
    channel_id: i64,
) -> Result<OrderOutcome> {
    repo::upsert_order(
        pool,
        &order.order_id,
        channel_id,
        &order.buyer,
        order.total,
        &order.currency,
        &order.status,
        &order.tracking_number,
        order.created_at,
    )
    .await
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    async fn setup_pool() -> Pool {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn seed_defaults(pool: &Pool) -> (i64, i64) {
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

    fn widget_item() -> ExternalListingItem {
        ExternalListingItem {
            item_id: "EB123".into(),
            title: "Widget".into(),
            description: "A widget".into(),
            price: crate::ebay::model::Price { value: 9.99 },
            quantity_available: 5,
            category: crate::ebay::model::ListingCategory {
                name: "Widgets".into(),
            },
            picture_urls: vec![
                "https://img/1.jpg".into(),
                "https://img/2.jpg".into(),
                "https://img/3.jpg".into(),
                "https://img/4.jpg".into(),
            ],
            ..Default::default()
        }
    }

    async fn meta_value(pool: &Pool, sku: &str, key: &str) -> Option<String> {
        sqlx::query_scalar(
            "SELECT m.meta_value FROM product_meta m JOIN products p ON p.id = m.product_id \
             WHERE p.sku = ? AND m.meta_key = ?",
        )
        .bind(sku)
        .bind(key)
        .fetch_optional(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn first_sighting_creates_product_category_and_stock() {
        let pool = setup_pool().await;
        let (wid, rid) = seed_defaults(&pool).await;
        let item = widget_item();

        let mut tx = pool.begin().await.unwrap();
        let outcome = reconcile_item(&mut tx, &item, wid, rid, 7).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Inserted);

        let (sku, price, cat_name): (String, f64, String) = sqlx::query_as(
            "SELECT p.sku, p.price, c.name FROM products p JOIN categories c ON c.id = p.category_id",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(sku, "EB123");
        assert_eq!(price, 9.99);
        assert_eq!(cat_name, "Widgets");

        let qty: i64 = sqlx::query_scalar(
            "SELECT quantity FROM stocks WHERE warehouse_id = ? AND rack_id = ?",
        )
        .bind(wid)
        .bind(rid)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(qty, 5);

        assert_eq!(meta_value(&pool, "EB123", "sales_channel_id").await.unwrap(), "7");
        assert_eq!(meta_value(&pool, "EB123", "quantity_available").await.unwrap(), "5");
    }

    #[tokio::test]
    async fn second_sighting_updates_in_place() {
        let pool = setup_pool().await;
        let (wid, rid) = seed_defaults(&pool).await;
        let mut item = widget_item();

        let mut tx = pool.begin().await.unwrap();
        reconcile_item(&mut tx, &item, wid, rid, 7).await.unwrap();
        tx.commit().await.unwrap();

        item.title = "Widget Deluxe".into();
        item.price.value = 14.99;
        item.quantity_available = 2;

        let mut tx = pool.begin().await.unwrap();
        let outcome = reconcile_item(&mut tx, &item, wid, rid, 7).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Updated);

        let (count, name): (i64, String) =
            sqlx::query_as("SELECT COUNT(*), MAX(name) FROM products WHERE sku = 'EB123'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
        assert_eq!(name, "Widget Deluxe");

        let qty: i64 = sqlx::query_scalar("SELECT quantity FROM stocks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(qty, 2);
        assert_eq!(meta_value(&pool, "EB123", "quantity_available").await.unwrap(), "2");
    }

    #[tokio::test]
    async fn missing_fields_write_empty_strings_not_null() {
        let pool = setup_pool().await;
        let (wid, rid) = seed_defaults(&pool).await;
        let item = ExternalListingItem {
            item_id: "EB9".into(),
            category: crate::ebay::model::ListingCategory {
                name: "Widgets".into(),
            },
            ..Default::default()
        };

        let mut tx = pool.begin().await.unwrap();
        reconcile_item(&mut tx, &item, wid, rid, 1).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(meta_value(&pool, "EB9", "weight").await.unwrap(), "");
        assert_eq!(meta_value(&pool, "EB9", "dimension_unit").await.unwrap(), "");
        assert_eq!(meta_value(&pool, "EB9", "quantity_available").await.unwrap(), "0");
        // No images provided: no image keys at all.
        assert!(meta_value(&pool, "EB9", "image_url_1").await.is_none());
    }

    #[tokio::test]
    async fn image_urls_cap_at_three() {
        let pool = setup_pool().await;
        let (wid, rid) = seed_defaults(&pool).await;
        let item = widget_item();

        let mut tx = pool.begin().await.unwrap();
        reconcile_item(&mut tx, &item, wid, rid, 1).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(meta_value(&pool, "EB123", "image_url_1").await.unwrap(), "https://img/1.jpg");
        assert_eq!(meta_value(&pool, "EB123", "image_url_3").await.unwrap(), "https://img/3.jpg");
        assert!(meta_value(&pool, "EB123", "image_url_4").await.is_none());
    }

    #[tokio::test]
    async fn fuzzy_category_match_reuses_existing_row() {
        let pool = setup_pool().await;
        let (wid, rid) = seed_defaults(&pool).await;
        sqlx::query("INSERT INTO categories (name, slug) VALUES ('Garden Widgets', 'garden-widgets')")
            .execute(&pool)
            .await
            .unwrap();

        let item = widget_item();
        let mut tx = pool.begin().await.unwrap();
        reconcile_item(&mut tx, &item, wid, rid, 1).await.unwrap();
        tx.commit().await.unwrap();

        // "Garden Widgets" contains "Widgets"; no new category is created.
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM categories")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn category_creation_failure_falls_back_to_first() {
        let pool = setup_pool().await;
        let (wid, rid) = seed_defaults(&pool).await;
        // Same slug as "Widgets" would produce, but a name the substring
        // match cannot find, forcing create -> unique violation -> fallback.
        sqlx::query("INSERT INTO categories (name, slug) VALUES ('Legacy', 'widgets')")
            .execute(&pool)
            .await
            .unwrap();

        let item = widget_item();
        let mut tx = pool.begin().await.unwrap();
        let outcome = reconcile_item(&mut tx, &item, wid, rid, 1).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Inserted);

        let cat: String = sqlx::query_scalar(
            "SELECT c.name FROM products p JOIN categories c ON c.id = p.category_id WHERE p.sku = 'EB123'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(cat, "Legacy");
    }

    #[tokio::test]
    async fn empty_category_table_is_a_resolution_error() {
        let pool = setup_pool().await;
        let (wid, rid) = seed_defaults(&pool).await;
        let item = ExternalListingItem {
            item_id: "EB1".into(),
            ..Default::default()
        };

        let mut tx = pool.begin().await.unwrap();
        let err = reconcile_item(&mut tx, &item, wid, rid, 1).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::CategoryResolution(_))
        ));
    }

    #[tokio::test]
    async fn order_reconcile_creates_then_updates() {
        let pool = setup_pool().await;
        let order = ExternalOrder {
            order_id: "ORD-77".into(),
            buyer: "bob".into(),
            total: 25.0,
            currency: "USD".into(),
            status: "paid".into(),
            ..Default::default()
        };
        assert_eq!(
            reconcile_order(&pool, &order, 1).await.unwrap(),
            OrderOutcome::Created
        );
        assert_eq!(
            reconcile_order(&pool, &order, 1).await.unwrap(),
            OrderOutcome::Updated
        );
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn slugify_basics() {
        assert_eq!(slugify("Widgets"), "widgets");
        assert_eq!(slugify("Home & Garden"), "home-garden");
        assert_eq!(slugify("  Spaced  Out  "), "spaced-out");
    }
}
