use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one import run. Transitions only move forward:
/// pending -> processing -> completed | failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::Processing => "processing",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ImportStatus::Pending),
            "processing" => Some(ImportStatus::Processing),
            "completed" => Some(ImportStatus::Completed),
            "failed" => Some(ImportStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobKind {
    ImportBatch,
    OrderSync,
    DeliveryCheck,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ImportBatch => "import_batch",
            JobKind::OrderSync => "order_sync",
            JobKind::DeliveryCheck => "delivery_check",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "import_batch" => Some(JobKind::ImportBatch),
            "order_sync" => Some(JobKind::OrderSync),
            "delivery_check" => Some(JobKind::DeliveryCheck),
            _ => None,
        }
    }
}

/// Result of reconciling one external listing against the product table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Inserted,
    Updated,
}

/// Result of reconciling one external order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOutcome {
    Created,
    Updated,
}

/// One run of the listings import pipeline, shared by all of its batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportLog {
    pub id: i64,
    pub channel_id: i64,
    pub status: ImportStatus,
    pub total_batches: i64,
    pub completed_batches: i64,
    pub inserted: i64,
    pub updated: i64,
    pub failed: i64,
    /// Error detail map keyed by batch number (as string).
    pub batch_errors: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportLog {
    pub fn progress_percentage(&self) -> f64 {
        if self.total_batches == 0 {
            return 0.0;
        }
        self.completed_batches as f64 / self.total_batches as f64 * 100.0
    }
}

/// Error attribution for a single item that failed reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchItemError {
    pub item_id: String,
    pub title: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: i64,
    pub name: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rack {
    pub id: i64,
    pub warehouse_id: i64,
    pub name: String,
    pub is_default: bool,
}

/// Order row as seen by the delivery checker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippedOrder {
    pub id: i64,
    pub external_order_id: String,
    pub tracking_number: String,
}

/// Outcome summary for one delivery-check scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryCheckSummary {
    pub total: i64,
    pub checked: i64,
    pub delivered: i64,
    pub errors: i64,
}
