//! HTTP client for the market API with rate limiting and error mapping
//!
//! Every request waits on a token-bucket limiter before it is sent. Status
//! codes are mapped onto [`SyncError`] so the retry engine can tell throttling
//! apart from ordinary transient failures.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use reqwest::{
    Client, StatusCode,
    header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT},
};
use serde::de::DeserializeOwned;
use url::Url;

use crate::domain::{AssetPartition, MarketSource, RawAsset, RawListing, RawSale};
use crate::error::{SyncError, SyncResult};
use crate::infrastructure::config::ApiConfig;

/// Market API client implementing [`MarketSource`]
pub struct MarketApiClient {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    base_url: Url,
}

impl MarketApiClient {
    pub fn new(config: &ApiConfig) -> SyncResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| SyncError::Configuration(format!("Invalid user agent: {e}")))?,
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .default_headers(headers)
            .build()
            .map_err(|e| SyncError::Configuration(format!("Failed to create HTTP client: {e}")))?;

        let quota = Quota::per_second(NonZeroU32::new(config.max_requests_per_second).ok_or_else(
            || SyncError::Configuration("Rate limit must be greater than 0".to_string()),
        )?);

        // Url::join drops the last path segment unless the base ends with '/'
        let normalized = format!("{}/", config.base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|e| SyncError::Configuration(format!("Invalid base url '{}': {e}", config.base_url)))?;

        Ok(Self {
            client,
            rate_limiter: RateLimiter::direct(quota),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/{path}?limit=..&sort=id&order=asc[&after=..]` plus extra filters
    pub fn page_url(
        &self,
        path: &str,
        after: Option<i64>,
        limit: u32,
        filters: &[(&str, String)],
    ) -> SyncResult<Url> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| SyncError::Configuration(format!("Invalid path '{path}': {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            query.append_pair("sort", "id");
            query.append_pair("order", "asc");
            if let Some(after) = after {
                query.append_pair("after", &after.to_string());
            }
            for (key, value) in filters {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> SyncResult<T> {
        self.rate_limiter.until_ready().await;

        tracing::debug!("Fetching URL: {}", url);

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &url, &body));
        }

        let bytes = response.bytes().await?;
        let parsed = serde_json::from_slice(&bytes)?;
        tracing::debug!("Successfully fetched: {} ({} bytes)", url, bytes.len());
        Ok(parsed)
    }
}

#[async_trait]
impl MarketSource for MarketApiClient {
    async fn fetch_assets(
        &self,
        partition: AssetPartition,
        after: Option<i64>,
        limit: u32,
    ) -> SyncResult<Vec<RawAsset>> {
        let url = self.page_url(
            "assets",
            after,
            limit,
            &[
                ("retired", partition.retired.to_string()),
                ("burned", partition.burned.to_string()),
            ],
        )?;
        self.get_json(url).await
    }

    async fn fetch_asset(&self, id: i64) -> SyncResult<RawAsset> {
        let url = self
            .base_url
            .join(&format!("assets/{id}"))
            .map_err(|e| SyncError::Configuration(e.to_string()))?;
        self.get_json(url).await
    }

    async fn fetch_sales(&self, after: Option<i64>, limit: u32) -> SyncResult<Vec<RawSale>> {
        let url = self.page_url("sales", after, limit, &[])?;
        self.get_json(url).await
    }

    async fn fetch_listings(&self, after: Option<i64>, limit: u32) -> SyncResult<Vec<RawListing>> {
        let url = self.page_url("listings", after, limit, &[])?;
        self.get_json(url).await
    }
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, url: &Url, body: &str) -> SyncError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            tracing::warn!("⏳ Rate limited by {} (retry-after: {:?})", url, retry_after);
            SyncError::RateLimited {
                message: format!("429 from {url}"),
                retry_after,
            }
        }
        StatusCode::NOT_FOUND => SyncError::NotFound(url.to_string()),
        other => SyncError::Http {
            status: other.as_u16(),
            message: if snippet.is_empty() {
                url.to_string()
            } else {
                format!("{url}: {snippet}")
            },
        },
    }
}
