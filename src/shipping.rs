use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;

use crate::config::Config;

/// Carrier-reported state of one shipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    InTransit,
    Delivered,
    Unknown,
}

/// Carrier surface consumed by the delivery checker.
#[async_trait]
pub trait CarrierService: Send + Sync {
    async fn delivery_status(&self, tracking_number: &str) -> Result<DeliveryStatus>;
}

pub struct CarrierClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for CarrierClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CarrierClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TrackingResp {
    status: String,
}

impl CarrierClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.shipping.api_base).context("invalid shipping.api_base")?;
        Ok(Self::with_base_url(cfg.shipping.token.clone(), base_url))
    }

    pub fn with_base_url(token: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("marketsync/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }
}

#[async_trait]
impl CarrierService for CarrierClient {
    async fn delivery_status(&self, tracking_number: &str) -> Result<DeliveryStatus> {
        let url = self
            .base_url
            .join(&format!("v1/tracking/{}", tracking_number))
            .context("invalid carrier base URL")?;
        let res = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .context("failed to reach carrier")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("carrier error {}: {}", status, body));
        }

        let payload: TrackingResp = res.json().await.context("invalid carrier response JSON")?;
        Ok(match payload.status.as_str() {
            "delivered" => DeliveryStatus::Delivered,
            "in_transit" | "out_for_delivery" | "accepted" => DeliveryStatus::InTransit,
            _ => DeliveryStatus::Unknown,
        })
    }
}
