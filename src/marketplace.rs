//! Marketplace feed of modules available for install or update.
//!
//! The feed is a JSON array of `{name, version, description, download_url}`.
//! [`HttpMarketplace`] keeps the last response on disk for 24 hours, keyed by
//! a hash of the feed URL.

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::operations::write_atomic;

pub(crate) const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// One entry of the marketplace feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableModule {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Entries without one are listed but cannot be installed or updated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// Source of [`AvailableModule`] listings.
pub trait MarketplaceFeed: Send + Sync {
    fn fetch(&self) -> Result<Vec<AvailableModule>>;
}

/// Feed served over HTTP with an on-disk cache.
pub struct HttpMarketplace {
    client: reqwest::blocking::Client,
    url: String,
    cache_dir: PathBuf,
    ttl: Duration,
}

impl HttpMarketplace {
    pub fn new(url: &str, cache_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("moduledepot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            cache_dir: cache_dir.into(),
            ttl: CACHE_TTL,
        })
    }

    /// Cache file for this feed's URL.
    pub fn cache_path(&self) -> PathBuf {
        self.cache_dir.join(cache_file_name(&self.url))
    }

    fn download(&self) -> Result<Vec<AvailableModule>> {
        debug!(url = %self.url, "Fetching marketplace feed");
        let response = self
            .client
            .get(&self.url)
            .send()
            .map_err(|e| anyhow!("Marketplace request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Marketplace returned {}", status);
        }
        response
            .json()
            .map_err(|e| anyhow!("Failed to parse marketplace feed: {}", e))
    }
}

impl MarketplaceFeed for HttpMarketplace {
    fn fetch(&self) -> Result<Vec<AvailableModule>> {
        let cache_path = self.cache_path();
        if let Some(cached) = read_fresh_cache(&cache_path, self.ttl) {
            debug!(path = ?cache_path, "Using cached marketplace feed");
            return Ok(cached);
        }

        let modules = self.download()?;
        let contents = serde_json::to_vec_pretty(&modules)?;
        if let Err(e) = write_atomic(&cache_path, &contents) {
            warn!(path = ?cache_path, error = %e, "Failed to cache marketplace feed");
        }
        Ok(modules)
    }
}

/// `<md5 of url>.json`
pub fn cache_file_name(url: &str) -> String {
    format!("{:x}.json", md5::compute(url.as_bytes()))
}

/// Cached JSON at `path`, unless it is missing, unreadable or older than `ttl`.
pub fn read_fresh_cache<T: DeserializeOwned>(path: &Path, ttl: Duration) -> Option<T> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let age = SystemTime::now().duration_since(modified).unwrap_or_default();
    if age > ttl {
        return None;
    }

    let contents = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(cached) => Some(cached),
        Err(e) => {
            warn!(path = ?path, error = %e, "Ignoring unreadable cache file");
            None
        }
    }
}
