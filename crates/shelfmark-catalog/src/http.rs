use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use shelfmark_core::CatalogSource;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{CatalogError, Result};

const USER_AGENT: &str = concat!("shelfmark/", env!("CARGO_PKG_VERSION"));
/// Upper bound on a server-requested `Retry-After` wait.
const MAX_RETRY_AFTER_SECS: u64 = 5;

/// JSON-over-HTTP client for one upstream catalog.
///
/// Retries 429 responses (honouring `Retry-After` up to a cap) and transport
/// errors with exponential backoff. Every request carries a timeout so no
/// adapter call can block indefinitely.
pub struct CatalogClient {
    client: reqwest::Client,
    catalog: CatalogSource,
    max_retries: u32,
}

impl CatalogClient {
    pub fn new(catalog: CatalogSource, timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            catalog,
            max_retries,
        })
    }

    /// GET a list or search endpoint. A 404 here means the endpoint itself is
    /// wrong (usually the base URL), so it counts as the catalog being unavailable.
    pub async fn get_json(&self, url: &Url) -> Result<Value> {
        self.fetch(url)
            .await?
            .ok_or_else(|| CatalogError::unavailable(self.catalog, format!("HTTP 404 from {}", url.path())))
    }

    /// GET a single entity; a 404 is `Ok(None)`.
    pub async fn get_entity(&self, url: &Url) -> Result<Option<Value>> {
        self.fetch(url).await
    }

    async fn fetch(&self, url: &Url) -> Result<Option<Value>> {
        let mut attempt = 0u32;
        loop {
            match self.client.get(url.clone()).send().await {
                Ok(r) if r.status() == StatusCode::TOO_MANY_REQUESTS => {
                    if attempt >= self.max_retries {
                        return Err(CatalogError::unavailable(self.catalog, "rate limited"));
                    }
                    let wait = r
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(1)
                        .min(MAX_RETRY_AFTER_SECS);
                    debug!(catalog = %self.catalog, wait, "rate limited, backing off");
                    sleep(Duration::from_secs(wait)).await;
                    attempt += 1;
                }
                Ok(r) if r.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(r) if !r.status().is_success() => {
                    let status = r.status().as_u16();
                    return Err(CatalogError::unavailable(
                        self.catalog,
                        format!("HTTP {status} from {}", url.path()),
                    ));
                }
                Ok(r) => {
                    let body = r
                        .text()
                        .await
                        .map_err(|e| CatalogError::unavailable(self.catalog, e.to_string()))?;
                    let value = serde_json::from_str(&body)
                        .map_err(|e| CatalogError::malformed(self.catalog, e.to_string()))?;
                    return Ok(Some(value));
                }
                Err(e) => {
                    if attempt >= self.max_retries || e.is_timeout() {
                        warn!(catalog = %self.catalog, error = %e, "request failed");
                        return Err(CatalogError::unavailable(self.catalog, e.to_string()));
                    }
                    let backoff = 200 * 2u64.pow(attempt);
                    sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Parse a configured base URL and append path segments to it.
pub fn endpoint(catalog: CatalogSource, base_url: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| CatalogError::unavailable(catalog, format!("invalid URL {base_url}: {e}")))?;
    {
        let mut segs = url
            .path_segments_mut()
            .map_err(|_| CatalogError::unavailable(catalog, format!("{base_url} cannot be a base")))?;
        segs.pop_if_empty();
        for seg in segments {
            segs.push(seg);
        }
    }
    Ok(url)
}
