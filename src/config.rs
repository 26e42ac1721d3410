//! Configuration loader and validator for the marketplace sync worker.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub ebay: Ebay,
    pub shipping: Shipping,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lookback_days")]
    pub order_lookback_days: i64,
    #[serde(default = "default_delivery_limit")]
    pub delivery_check_limit: i64,
}

fn default_batch_size() -> usize {
    100
}

fn default_lookback_days() -> i64 {
    7
}

fn default_delivery_limit() -> i64 {
    50
}

/// eBay API settings and the sales channels to sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ebay {
    pub api_base: String,
    pub channels: Vec<Channel>,
}

/// One marketplace sales channel with its OAuth refresh token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub refresh_token: String,
}

/// Carrier/shipping service settings used by the delivery checker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Shipping {
    pub api_base: String,
    pub token: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn channel(&self, id: i64) -> Option<&Channel> {
        self.ebay.channels.iter().find(|c| c.id == id)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.batch_size == 0 {
        return Err(ConfigError::Invalid("app.batch_size must be > 0"));
    }
    if cfg.app.order_lookback_days <= 0 {
        return Err(ConfigError::Invalid("app.order_lookback_days must be > 0"));
    }
    if cfg.app.delivery_check_limit <= 0 {
        return Err(ConfigError::Invalid("app.delivery_check_limit must be > 0"));
    }

    if cfg.ebay.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("ebay.api_base must be non-empty"));
    }
    if cfg.ebay.channels.is_empty() {
        return Err(ConfigError::Invalid(
            "ebay.channels must list at least one channel",
        ));
    }
    for ch in &cfg.ebay.channels {
        if ch.name.trim().is_empty() {
            return Err(ConfigError::Invalid("ebay.channels[].name must be non-empty"));
        }
        if ch.refresh_token.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "ebay.channels[].refresh_token must be non-empty",
            ));
        }
    }

    if cfg.shipping.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("shipping.api_base must be non-empty"));
    }
    if cfg.shipping.token.trim().is_empty() {
        return Err(ConfigError::Invalid("shipping.token must be non-empty"));
    }

    Ok(())
}

/// Returns a complete example YAML document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 60
  batch_size: 100
  order_lookback_days: 7
  delivery_check_limit: 50

ebay:
  api_base: "https://api.ebay.com/"
  channels:
    - id: 1
      name: "main-store"
      refresh_token: "YOUR_EBAY_REFRESH_TOKEN"

shipping:
  api_base: "https://api.carrier.example/"
  token: "YOUR_CARRIER_API_TOKEN"
"#
}
