//! Bounded delivery-status scan over shipped orders.
//!
//! Scheduled externally and assumed non-overlapping; this core only performs
//! one bounded pass per invocation.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::db::model::DeliveryCheckSummary;
use crate::db::{repo, Pool};
use crate::shipping::{CarrierService, DeliveryStatus};

#[instrument(skip_all)]
pub async fn run_delivery_check(
    pool: &Pool,
    carrier: &dyn CarrierService,
    limit: i64,
) -> Result<DeliveryCheckSummary> {
    let mut summary = DeliveryCheckSummary {
        total: repo::count_shipped_orders(pool).await?,
        ..Default::default()
    };

    let orders = repo::shipped_orders(pool, limit.max(1)).await?;
    for order in &orders {
        if order.tracking_number.trim().is_empty() {
            warn!(order_id = order.id, "shipped order has no tracking number");
            summary.errors += 1;
            continue;
        }
        summary.checked += 1;
        match carrier.delivery_status(&order.tracking_number).await {
            Ok(DeliveryStatus::Delivered) => {
                repo::mark_order_delivered(pool, order.id).await?;
                summary.delivered += 1;
            }
            Ok(DeliveryStatus::InTransit) | Ok(DeliveryStatus::Unknown) => {}
            Err(err) => {
                warn!(
                    ?err,
                    order_id = order.id,
                    tracking = %order.tracking_number,
                    "carrier lookup failed; continuing"
                );
                summary.errors += 1;
            }
        }
    }

    info!(
        total = summary.total,
        checked = summary.checked,
        delivered = summary.delivered,
        errors = summary.errors,
        "delivery check completed"
    );
    Ok(summary)
}
