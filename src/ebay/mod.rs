use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode, Url};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::ebay::model::{ExternalListingItem, ExternalOrder, ListingsResp, OrdersResp, TokenResp};
use crate::error::SyncError;

pub mod model;

const EBAY_API_BASE: &str = "https://api.ebay.com/";

/// External marketplace surface consumed by the sync jobs. The wire protocol
/// behind it is opaque to the pipeline; tests substitute a recording mock.
#[async_trait]
pub trait EbayService: Send + Sync {
    /// Refresh the channel's OAuth token if missing or near expiry.
    async fn ensure_valid_token(&self, channel_id: i64) -> Result<()>;

    async fn get_all_active_listings(&self, channel_id: i64) -> Result<Vec<ExternalListingItem>>;

    async fn get_all_unsold_listings(&self, channel_id: i64) -> Result<Vec<ExternalListingItem>>;

    async fn get_all_orders(
        &self,
        channel_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExternalOrder>>;
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct EbayClient {
    http: Client,
    base_url: Url,
    /// channel id -> OAuth refresh token, from config.
    refresh_tokens: HashMap<i64, String>,
    tokens: Mutex<HashMap<i64, CachedToken>>,
}

impl fmt::Debug for EbayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EbayClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl EbayClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = if cfg.ebay.api_base.trim().is_empty() {
            Url::parse(EBAY_API_BASE).expect("valid default eBay URL")
        } else {
            Url::parse(&cfg.ebay.api_base).context("invalid ebay.api_base")?
        };
        let refresh_tokens = cfg
            .ebay
            .channels
            .iter()
            .map(|c| (c.id, c.refresh_token.clone()))
            .collect();
        Ok(Self::with_base_url(refresh_tokens, base_url))
    }

    pub fn with_base_url(refresh_tokens: HashMap<i64, String>, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("marketsync/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            refresh_tokens,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Exchange the channel's refresh token for a fresh access token.
    async fn refresh_user_token(&self, channel_id: i64) -> Result<CachedToken> {
        let refresh_token = self
            .refresh_tokens
            .get(&channel_id)
            .ok_or_else(|| anyhow!("no refresh token configured for channel {}", channel_id))?;

        let endpoint = self
            .base_url
            .join("identity/v1/oauth2/token")
            .context("invalid eBay base URL")?;
        let res = self
            .http
            .post(endpoint)
            .json(&json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }))
            .send()
            .await
            .context("failed to reach eBay token endpoint")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(channel_id, %status, "token refresh rejected: {}", body);
            return Err(SyncError::Auth(format!("token refresh {}: {}", status, body)).into());
        }

        let payload: TokenResp = res.json().await.context("invalid eBay token response")?;
        info!(channel_id, expires_in = payload.expires_in, "refreshed channel token");
        Ok(CachedToken {
            access_token: payload.access_token,
            // Renew a minute early so in-flight requests never race expiry.
            expires_at: Utc::now() + Duration::seconds(payload.expires_in.max(60) - 60),
        })
    }

    async fn bearer_token(&self, channel_id: i64) -> Result<String> {
        let mut tokens = self.tokens.lock().await;
        match tokens.get(&channel_id) {
            Some(tok) if tok.expires_at > Utc::now() => Ok(tok.access_token.clone()),
            _ => {
                let fresh = self.refresh_user_token(channel_id).await?;
                let access = fresh.access_token.clone();
                tokens.insert(channel_id, fresh);
                Ok(access)
            }
        }
    }

    async fn get_json(&self, channel_id: i64, path: &str) -> Result<serde_json::Value> {
        let token = self.bearer_token(channel_id).await?;
        let url = self.base_url.join(path).context("invalid eBay base URL")?;
        let res = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .context("failed to reach eBay")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(channel_id, "rate limited by eBay: {}", body);
            return Err(anyhow!("received 429 from eBay: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(channel_id, %status, "eBay API error: {}", body);
            return Err(anyhow!("ebay error {}: {}", status, body));
        }

        res.json().await.context("invalid eBay response JSON")
    }

    async fn get_listings(&self, channel_id: i64, path: &str) -> Result<Vec<ExternalListingItem>> {
        let value = self.get_json(channel_id, path).await?;
        let resp: ListingsResp =
            serde_json::from_value(value).context("invalid eBay listings payload")?;
        Ok(resp.items)
    }
}

#[async_trait]
impl EbayService for EbayClient {
    async fn ensure_valid_token(&self, channel_id: i64) -> Result<()> {
        self.bearer_token(channel_id).await.map(|_| ())
    }

    async fn get_all_active_listings(&self, channel_id: i64) -> Result<Vec<ExternalListingItem>> {
        self.get_listings(channel_id, "v1/listings/active").await
    }

    async fn get_all_unsold_listings(&self, channel_id: i64) -> Result<Vec<ExternalListingItem>> {
        self.get_listings(channel_id, "v1/listings/unsold").await
    }

    async fn get_all_orders(
        &self,
        channel_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExternalOrder>> {
        let path = format!(
            "v1/orders?from={}&to={}",
            from.to_rfc3339(),
            to.to_rfc3339()
        );
        let value = self.get_json(channel_id, &path).await?;
        let resp: OrdersResp =
            serde_json::from_value(value).context("invalid eBay orders payload")?;
        Ok(resp.orders)
    }
}
