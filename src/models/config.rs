//! Application configuration structures.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP and crawling behavior settings
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Feed document storage and pagination limits
    #[serde(default)]
    pub feed: FeedConfig,

    /// Timeline sizes
    #[serde(default)]
    pub timeline: TimelineConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.crawler.user_agent.trim().is_empty() {
            return Err(AppError::validation("crawler.user_agent is empty"));
        }
        if self.crawler.timeout_secs == 0 {
            return Err(AppError::validation("crawler.timeout_secs must be > 0"));
        }
        if self.crawler.batch_timeout_secs < self.crawler.timeout_secs {
            return Err(AppError::validation(
                "crawler.batch_timeout_secs must be >= crawler.timeout_secs",
            ));
        }
        if self.crawler.interval_secs == 0 {
            return Err(AppError::validation("crawler.interval_secs must be > 0"));
        }
        if self.crawler.max_concurrent == 0 {
            return Err(AppError::validation("crawler.max_concurrent must be > 0"));
        }
        if self.crawler.max_pages_per_source == 0 {
            return Err(AppError::validation(
                "crawler.max_pages_per_source must be > 0",
            ));
        }
        if self.crawler.max_response_bytes == 0 {
            return Err(AppError::validation("crawler.max_response_bytes must be > 0"));
        }
        if self.feed.storage_dir.trim().is_empty() {
            return Err(AppError::validation("feed.storage_dir is empty"));
        }
        if let Some(public_url) = &self.feed.public_url {
            url::Url::parse(public_url).map_err(|e| {
                AppError::validation(format!("feed.public_url is not a URL: {e}"))
            })?;
        }
        if self.feed.max_posts_per_feed == 0 {
            return Err(AppError::validation("feed.max_posts_per_feed must be > 0"));
        }
        if self.feed.max_feed_size_bytes == 0 {
            return Err(AppError::validation("feed.max_feed_size_bytes must be > 0"));
        }
        if self.feed.max_description_length == 0 {
            return Err(AppError::validation(
                "feed.max_description_length must be > 0",
            ));
        }
        if self.timeline.cache_cap == 0 || self.timeline.page_size == 0 {
            return Err(AppError::validation("timeline sizes must be > 0"));
        }
        Ok(())
    }
}

/// HTTP client and crawling behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Per-fetch timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Deadline for a whole on-demand batch
    #[serde(default = "defaults::batch_timeout")]
    pub batch_timeout_secs: u64,

    /// Delay between continuous crawl cycles
    #[serde(default = "defaults::interval")]
    pub interval_secs: u64,

    /// Maximum concurrent requests
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// How long a graceful stop waits for in-flight fetches
    #[serde(default = "defaults::grace_period")]
    pub grace_period_secs: u64,

    /// Archive pages followed per source while looking for the last-seen marker
    #[serde(default = "defaults::max_pages_per_source")]
    pub max_pages_per_source: usize,

    /// Largest response body accepted from a remote feed
    #[serde(default = "defaults::max_response_bytes")]
    pub max_response_bytes: u64,
}

impl CrawlerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            batch_timeout_secs: defaults::batch_timeout(),
            interval_secs: defaults::interval(),
            max_concurrent: defaults::max_concurrent(),
            grace_period_secs: defaults::grace_period(),
            max_pages_per_source: defaults::max_pages_per_source(),
            max_response_bytes: defaults::max_response_bytes(),
        }
    }
}

/// Feed document settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Directory holding user documents and settings
    #[serde(default = "defaults::storage_dir")]
    pub storage_dir: String,

    /// Base URL the storage directory is published under
    #[serde(default)]
    pub public_url: Option<String>,

    /// Item count that triggers archival
    #[serde(default = "defaults::max_posts_per_feed")]
    pub max_posts_per_feed: usize,

    /// Serialized size that triggers archival
    #[serde(default = "defaults::max_feed_size_bytes")]
    pub max_feed_size_bytes: usize,

    /// Longest accepted post description, in characters
    #[serde(default = "defaults::max_description_length")]
    pub max_description_length: usize,

    /// Language written for posts that carry none
    #[serde(default = "defaults::default_language")]
    pub default_language: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            storage_dir: defaults::storage_dir(),
            public_url: None,
            max_posts_per_feed: defaults::max_posts_per_feed(),
            max_feed_size_bytes: defaults::max_feed_size_bytes(),
            max_description_length: defaults::max_description_length(),
            default_language: defaults::default_language(),
        }
    }
}

/// Timeline caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// Length of the merged timeline kept by the crawler
    #[serde(default = "defaults::cache_cap")]
    pub cache_cap: usize,

    /// Posts shown per page
    #[serde(default = "defaults::page_size")]
    pub page_size: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            cache_cap: defaults::cache_cap(),
            page_size: defaults::page_size(),
        }
    }
}

mod defaults {
    pub fn user_agent() -> String {
        format!("microblog/{}", env!("CARGO_PKG_VERSION"))
    }
    pub fn timeout() -> u64 {
        10
    }
    pub fn batch_timeout() -> u64 {
        30
    }
    pub fn interval() -> u64 {
        60
    }
    pub fn max_concurrent() -> usize {
        8
    }
    pub fn grace_period() -> u64 {
        5
    }
    pub fn max_pages_per_source() -> usize {
        3
    }
    pub fn max_response_bytes() -> u64 {
        // a few live documents' worth
        4 * 1024 * 1024
    }

    pub fn storage_dir() -> String {
        "storage".into()
    }
    pub fn max_posts_per_feed() -> usize {
        500
    }
    pub fn max_feed_size_bytes() -> usize {
        500_000
    }
    pub fn max_description_length() -> usize {
        200
    }
    pub fn default_language() -> String {
        "en".into()
    }

    pub fn cache_cap() -> usize {
        1000
    }
    pub fn page_size() -> usize {
        25
    }
}
