//! CoinGecko price feed client
//!
//! Owns the upstream connection, the process-wide request pacing, bounded
//! retries and the supported-asset existence cache. Constructed once in the
//! composition root and shared behind an `Arc` - there is no hidden global
//! instance.

use super::limiter::RateLimiter;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";
const DEFAULT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RATE_LIMIT_PER_MIN: u32 = 50;

/// Attempts per outbound call, with 1s/2s backoff between them.
const MAX_ATTEMPTS: usize = 3;

/// How long the supported-asset list stays fresh.
const ASSET_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors surfaced by the price client
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("price service did not respond to liveness probe")]
    Unavailable,
    #[error("price service request failed after {attempts} attempts: {message}")]
    Upstream { attempts: usize, message: String },
    #[error("failed to decode price service response: {0}")]
    Decode(String),
    #[error("asset '{asset}' not quoted in '{fiat}'")]
    AssetNotFound { asset: String, fiat: String },
    #[error("invalid price service URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Client configuration, read from the environment with hardcoded fallbacks
#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_requests_per_minute: u32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_requests_per_minute: DEFAULT_RATE_LIMIT_PER_MIN,
        }
    }
}

/// One historical observation: millisecond timestamp plus USD price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: i64,
    pub price: f64,
}

/// The seam the trading layer depends on, so buys can be exercised against
/// a scripted source in tests.
#[allow(async_fn_in_trait)]
pub trait PriceSource {
    async fn current_price(&self, asset: &str, fiat: &str) -> Result<f64, MarketError>;
}

struct CachedAssets {
    ids: Vec<String>,
    fetched_at: tokio::time::Instant,
}

/// Rate-limited, retrying client for the upstream price API
pub struct MarketClient {
    base_url: Url,
    http: reqwest::Client,
    limiter: RateLimiter,
    assets_cache: parking_lot::RwLock<Option<CachedAssets>>,
}

#[derive(Deserialize)]
struct CoinListEntry {
    id: String,
}

#[derive(Deserialize)]
struct MarketChartResponse {
    #[serde(default)]
    prices: Vec<(f64, f64)>,
}

impl MarketClient {
    pub fn new(config: MarketConfig) -> Result<Self, MarketError> {
        // A trailing slash keeps Url::join from eating the /api/v3 suffix
        let normalized = if config.base_url.ends_with('/') {
            config.base_url.clone()
        } else {
            format!("{}/", config.base_url)
        };
        let base_url = Url::parse(&normalized)?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();

        Ok(Self {
            base_url,
            http,
            limiter: RateLimiter::new(config.max_requests_per_minute),
            assets_cache: parking_lot::RwLock::new(None),
        })
    }

    /// Lightweight upstream probe. Never errors - any failure reads as
    /// "not live". Consumes one rate-limit slot.
    pub async fn check_liveness(&self) -> bool {
        let url = match self.base_url.join("ping") {
            Ok(url) => url,
            Err(err) => {
                error!("Malformed ping URL: {}", err);
                return false;
            }
        };

        self.limiter.acquire_slot().await;
        match self.get_with_retry(url).await {
            Ok(_) => true,
            Err(err) => {
                warn!("Price service liveness probe failed: {}", err);
                false
            }
        }
    }

    /// Current price of `asset` in `fiat`.
    pub async fn current_price(&self, asset: &str, fiat: &str) -> Result<f64, MarketError> {
        if !self.check_liveness().await {
            return Err(MarketError::Unavailable);
        }

        let mut url = self.base_url.join("simple/price")?;
        url.query_pairs_mut()
            .append_pair("ids", asset)
            .append_pair("vs_currencies", fiat);

        self.limiter.acquire_slot().await;
        let body = self.fetch_text(url).await?;

        let quotes: std::collections::HashMap<String, std::collections::HashMap<String, f64>> =
            serde_json::from_str(&body).map_err(|err| {
                error!("Failed to decode price response: {}", err);
                MarketError::Decode(err.to_string())
            })?;

        quotes
            .get(asset)
            .and_then(|pairs| pairs.get(fiat))
            .copied()
            .ok_or_else(|| MarketError::AssetNotFound {
                asset: asset.to_string(),
                fiat: fiat.to_string(),
            })
    }

    /// Historical prices of `asset` in USD between two unix timestamps.
    /// Zero data points in range is an empty vec, not an error.
    pub async fn historical_prices(
        &self,
        asset: &str,
        from_unix: i64,
        to_unix: i64,
    ) -> Result<Vec<PricePoint>, MarketError> {
        if !self.check_liveness().await {
            return Err(MarketError::Unavailable);
        }

        let mut url = self
            .base_url
            .join(&format!("coins/{asset}/market_chart/range"))?;
        url.query_pairs_mut()
            .append_pair("vs_currency", "usd")
            .append_pair("from", &from_unix.to_string())
            .append_pair("to", &to_unix.to_string());

        self.limiter.acquire_slot().await;
        let body = self.fetch_text(url).await?;

        let chart: MarketChartResponse = serde_json::from_str(&body).map_err(|err| {
            error!("Failed to decode market chart response: {}", err);
            MarketError::Decode(err.to_string())
        })?;

        Ok(chart
            .prices
            .into_iter()
            .map(|(timestamp, price)| PricePoint {
                timestamp: timestamp as i64,
                price,
            })
            .collect())
    }

    /// Ids of every asset the upstream quotes, cached for 24 hours.
    pub async fn supported_assets(&self) -> Result<Vec<String>, MarketError> {
        {
            let cache = self.assets_cache.read();
            if let Some(ref cached) = *cache {
                if cached.fetched_at.elapsed() < ASSET_CACHE_TTL {
                    debug!("Serving supported assets from cache");
                    return Ok(cached.ids.clone());
                }
            }
        }

        let url = self.base_url.join("coins/list")?;
        self.limiter.acquire_slot().await;
        let body = self.fetch_text(url).await?;

        let entries: Vec<CoinListEntry> = serde_json::from_str(&body).map_err(|err| {
            error!("Failed to decode coin list response: {}", err);
            MarketError::Decode(err.to_string())
        })?;
        let ids: Vec<String> = entries.into_iter().map(|entry| entry.id).collect();

        {
            let mut cache = self.assets_cache.write();
            *cache = Some(CachedAssets {
                ids: ids.clone(),
                fetched_at: tokio::time::Instant::now(),
            });
        }

        Ok(ids)
    }

    async fn fetch_text(&self, url: Url) -> Result<String, MarketError> {
        let response = self.get_with_retry(url).await?;
        response.text().await.map_err(|err| MarketError::Upstream {
            attempts: 1,
            message: format!("failed reading response body: {err}"),
        })
    }

    /// Bounded retry loop around one GET. An attempt succeeds when the
    /// transport completes and the status is 2xx; failures back off 1s then
    /// 2s before the next attempt.
    async fn get_with_retry(&self, url: Url) -> Result<reqwest::Response, MarketError> {
        let mut last_failure = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                sleep(Duration::from_secs(attempt as u64)).await;
            }

            match self.http.get(url.clone()).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    last_failure = format!("upstream returned status {}", response.status());
                    debug!("Attempt {} against {} failed: {}", attempt + 1, url, last_failure);
                }
                Err(err) => {
                    last_failure = format!("transport error: {err}");
                    debug!("Attempt {} against {} failed: {}", attempt + 1, url, last_failure);
                }
            }
        }

        Err(MarketError::Upstream {
            attempts: MAX_ATTEMPTS,
            message: last_failure,
        })
    }
}

impl PriceSource for MarketClient {
    async fn current_price(&self, asset: &str, fiat: &str) -> Result<f64, MarketError> {
        MarketClient::current_price(self, asset, fiat).await
    }
}
