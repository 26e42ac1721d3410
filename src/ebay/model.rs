use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One marketplace listing as returned by the eBay client.
///
/// Built once at the client boundary; absent fields deserialize to empty
/// string / zero so the reconciler never sees nulls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExternalListingItem {
    pub item_id: String,
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub price: Price,
    #[serde(default)]
    pub quantity_available: i64,
    #[serde(default)]
    pub category: ListingCategory,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub listing_url: String,
    #[serde(default)]
    pub listing_type: String,
    #[serde(default)]
    pub listing_status: String,
    #[serde(default)]
    pub weight: String,
    #[serde(default)]
    pub weight_unit: String,
    #[serde(default)]
    pub length: String,
    #[serde(default)]
    pub width: String,
    #[serde(default)]
    pub height: String,
    #[serde(default)]
    pub dimension_unit: String,
    #[serde(default)]
    pub picture_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Price {
    #[serde(default)]
    pub value: f64,
    // Currency is carried on orders; listings use the channel's currency.
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ListingCategory {
    #[serde(default)]
    pub name: String,
}

/// One marketplace order as returned by the eBay client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExternalOrder {
    pub order_id: String,
    #[serde(default)]
    pub buyer: String,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tracking_number: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ListingsResp {
    #[serde(default)]
    pub items: Vec<ExternalListingItem>,
}

#[derive(Debug, Deserialize)]
pub struct OrdersResp {
    #[serde(default)]
    pub orders: Vec<ExternalOrder>,
}

#[derive(Debug, Deserialize)]
pub struct TokenResp {
    pub access_token: String,
    pub expires_in: i64,
}
