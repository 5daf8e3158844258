//! Visitor geolocation through an HTTP country lookup API
//!
//! Lookups go to `GET {api_url}/{ip}` and expect `{"country": "XX", ...}`.
//! Successful answers are cached per address; failures are logged and
//! reported as unavailable so the caller can fail open.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::prelude::*;
use moka::future::Cache;
use reqwest::{header, Client, StatusCode};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::GeolocationConfig;
use crate::models::CountryCode;

#[derive(Debug, Error)]
pub enum GeoLookupError {
    #[error("API Error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("API returned status code: {0}")]
    Status(StatusCode),
    #[error("Invalid JSON response: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("API response missing country code")]
    MissingCountry,
    #[error("API response has invalid country code '{0}'")]
    InvalidCountry(String),
}

/// Resolves an address to a country. `None` means the country could not be
/// determined.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn resolve(&self, ip: IpAddr, request_uri: &str) -> Option<CountryCode>;
}

pub struct CountryApiResolver {
    client: Client,
    api_url: String,
    cache: Cache<String, CountryCode>,
}

impl CountryApiResolver {
    pub fn new(config: &GeolocationConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("country-gate/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build HTTP client for geolocation lookups")?;

        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(Duration::from_secs(config.cache_ttl_secs))
            .build();

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            cache,
        })
    }

    /// Cache key for an address; the literal itself is never stored as a key
    pub fn cache_key(ip: IpAddr) -> String {
        let digest = Sha256::digest(ip.to_string().as_bytes());
        format!("country_gate_{}", BASE64_URL_SAFE_NO_PAD.encode(digest))
    }

    async fn fetch(&self, ip: IpAddr) -> Result<CountryCode, GeoLookupError> {
        let url = format!("{}/{}", self.api_url, ip);

        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(GeoLookupError::Transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(GeoLookupError::Status(status));
        }

        let body = response.text().await.map_err(GeoLookupError::Transport)?;
        let data: serde_json::Value =
            serde_json::from_str(&body).map_err(GeoLookupError::InvalidJson)?;

        let country = data
            .get("country")
            .and_then(|value| value.as_str())
            .ok_or(GeoLookupError::MissingCountry)?;

        CountryCode::parse(country).map_err(|_| GeoLookupError::InvalidCountry(country.to_string()))
    }
}

#[async_trait]
impl GeoResolver for CountryApiResolver {
    async fn resolve(&self, ip: IpAddr, request_uri: &str) -> Option<CountryCode> {
        let key = Self::cache_key(ip);
        if let Some(country) = self.cache.get(&key).await {
            debug!(ip = %ip, country = %country, "geolocation cache hit");
            return Some(country);
        }

        match self.fetch(ip).await {
            Ok(country) => {
                self.cache.insert(key, country.clone()).await;
                Some(country)
            }
            Err(err) => {
                warn!(ip = %ip, uri = %request_uri, error = %err, "geolocation lookup failed");
                None
            }
        }
    }
}
