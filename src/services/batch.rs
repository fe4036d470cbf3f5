// src/services/batch.rs

//! On-demand crawling.
//!
//! Fetches an explicit set of feed links concurrently and blocks until
//! every link has answered or the batch deadline passes. Used for
//! synchronous requests such as showing a remote user's timeline.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;

use crate::codec::{self, ItemCodec};
use crate::error::FetchError;
use crate::models::{Channel, CrawlerConfig, ParsedDocument, Post, Rejected};
use crate::services::fetcher::Fetcher;
use crate::services::timeline::Timeline;
use crate::utils;

/// Fetch one page of a remote feed and decode it.
pub(crate) async fn fetch_page(
    fetcher: &dyn Fetcher,
    codec: &ItemCodec,
    url: &str,
    timeout: Duration,
) -> Result<ParsedDocument<Post>, FetchError> {
    let bytes = fetcher.fetch(url, timeout).await?;
    let parsed: ParsedDocument<Post> =
        codec::decode_document(codec, &bytes).map_err(|e| FetchError::parse(url, e))?;

    for rejected in &parsed.rejected {
        log::debug!("Skipping item {} from {}: {}", rejected.index, url, rejected.reason);
    }
    Ok(parsed)
}

/// Absolute link of the page after `page_url`, if the page has one.
pub(crate) fn next_page(page_url: &str, channel: &Channel) -> Option<String> {
    let next = channel.next_node.as_deref().map(str::trim)?;
    if next.is_empty() {
        return None;
    }
    utils::resolve(page_url, next).filter(|link| link != page_url)
}

/// Outcome of an on-demand batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Every link answered, successfully or not
    Completed,
    /// The deadline passed with links still outstanding
    TimedOut,
}

/// Metadata and posts of one fetched source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFeed {
    pub info: Channel,
    pub items: Vec<Post>,
    pub rejected: Vec<Rejected>,
}

/// Per-source results of [`OnDemandCrawler::get_all_items`].
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub feeds: BTreeMap<String, SourceFeed>,
    pub failures: BTreeMap<String, FetchError>,
    /// Links still in flight when the deadline passed
    pub timed_out: Vec<String>,
    pub status: BatchStatus,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == BatchStatus::Completed && self.failures.is_empty()
    }

    /// Links that produced no feed, failed or timed out.
    pub fn failed_links(&self) -> Vec<String> {
        let mut links: Vec<String> = self.failures.keys().cloned().collect();
        links.extend(self.timed_out.iter().cloned());
        links.sort();
        links
    }

    /// Merge every fetched item into one timeline.
    pub fn into_timeline(self, cap: usize) -> Timeline {
        Timeline::from_posts(self.feeds.into_values().flat_map(|feed| feed.items), cap)
    }
}

/// Blocking batch fetcher over a [`Fetcher`].
pub struct OnDemandCrawler {
    fetcher: Arc<dyn Fetcher>,
    codec: ItemCodec,
    config: CrawlerConfig,
}

impl OnDemandCrawler {
    pub fn new(fetcher: Arc<dyn Fetcher>, codec: ItemCodec, config: CrawlerConfig) -> Self {
        Self {
            fetcher,
            codec,
            config,
        }
    }

    /// Fetch every link and wait for all of them, up to the batch deadline.
    pub async fn get_all_items(&self, links: &[String]) -> BatchOutcome {
        self.get_all_items_except(links, &HashSet::new()).await
    }

    /// As [`Self::get_all_items`], skipping links in `block_list`.
    pub async fn get_all_items_except(
        &self,
        links: &[String],
        block_list: &HashSet<String>,
    ) -> BatchOutcome {
        let mut seen = HashSet::new();
        let links: Vec<String> = links
            .iter()
            .filter(|link| !block_list.contains(*link))
            .filter(|link| seen.insert((*link).clone()))
            .cloned()
            .collect();

        let deadline = Instant::now() + self.config.batch_timeout();
        let timeout = self.config.timeout();
        let concurrency = self.config.max_concurrent.max(1);
        let fetcher = self.fetcher.as_ref();
        let codec = &self.codec;

        log::debug!("Dispatching {} links", links.len());
        let mut outstanding: HashSet<String> = links.iter().cloned().collect();
        let mut outcome = BatchOutcome {
            feeds: BTreeMap::new(),
            failures: BTreeMap::new(),
            timed_out: Vec::new(),
            status: BatchStatus::Completed,
        };

        let mut results = stream::iter(links)
            .map(|link| async move {
                let result = fetch_page(fetcher, codec, &link, timeout).await;
                (link, result)
            })
            .buffer_unordered(concurrency);

        loop {
            match tokio::time::timeout_at(deadline, results.next()).await {
                Ok(Some((link, result))) => {
                    outstanding.remove(&link);
                    match result {
                        Ok(parsed) => {
                            let feed = SourceFeed {
                                info: parsed.document.channel,
                                items: parsed.document.items,
                                rejected: parsed.rejected,
                            };
                            outcome.feeds.insert(link, feed);
                        }
                        Err(error) => {
                            log::warn!("Failed to fetch {}: {}", link, error);
                            outcome.failures.insert(link, error);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    outcome.status = BatchStatus::TimedOut;
                    break;
                }
            }
        }

        outcome.timed_out = outstanding.into_iter().collect();
        outcome.timed_out.sort();
        if outcome.status == BatchStatus::TimedOut {
            log::warn!(
                "Batch deadline passed with {} links outstanding",
                outcome.timed_out.len()
            );
        }
        outcome
    }

    /// Fetch a single feed's first page.
    pub async fn get_feed(&self, link: &str) -> Result<SourceFeed, FetchError> {
        let parsed = fetch_page(self.fetcher.as_ref(), &self.codec, link, self.config.timeout()).await?;
        Ok(SourceFeed {
            info: parsed.document.channel,
            items: parsed.document.items,
            rejected: parsed.rejected,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::encode_document;
    use crate::models::{Document, Kind};
    use crate::services::fetcher::stub::{Reply, StubFetcher};
    use chrono::{DateTime, Duration as ChronoDuration};

    pub(crate) fn feed_bytes(user: &str, minutes: &[i64], next_node: Option<&str>) -> Vec<u8> {
        let base = DateTime::parse_from_rfc2822("Mon, 01 Jun 2026 10:00:00 +0000").unwrap();
        let link = format!("https://{user}.example/feed.xml");
        let mut document: Document<Post> = Document::new(Channel {
            username: Some(user.to_string()),
            user_id: Some(format!("id-{user}")),
            link: Some(link.clone()),
            next_node: next_node.map(str::to_string),
            ..Channel::default()
        });
        document.items = minutes
            .iter()
            .map(|m| {
                Post::compose(
                    &link,
                    base + ChronoDuration::minutes(*m),
                    format!("{user} 10:{m:02}"),
                    Kind::Status,
                )
            })
            .collect();
        encode_document(&ItemCodec::default(), &document).unwrap()
    }

    fn crawler(fetcher: StubFetcher, batch_timeout_secs: u64) -> OnDemandCrawler {
        let config = CrawlerConfig {
            timeout_secs: 1,
            batch_timeout_secs,
            ..CrawlerConfig::default()
        };
        OnDemandCrawler::new(Arc::new(fetcher), ItemCodec::default(), config)
    }

    fn links(urls: &[&str]) -> Vec<String> {
        urls.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test]
    async fn test_collects_every_source() {
        let fetcher = StubFetcher::new()
            .reply("https://a.example/feed.xml", Reply::Body(feed_bytes("a", &[10, 0], None)))
            .reply("https://b.example/feed.xml", Reply::Body(feed_bytes("b", &[5], None)));

        let outcome = crawler(fetcher, 5)
            .get_all_items(&links(&["https://a.example/feed.xml", "https://b.example/feed.xml"]))
            .await;

        assert_eq!(outcome.status, BatchStatus::Completed);
        assert!(outcome.is_complete());
        let a = &outcome.feeds["https://a.example/feed.xml"];
        assert_eq!(a.info.username.as_deref(), Some("a"));
        assert_eq!(a.items.len(), 2);

        let timeline = outcome.into_timeline(10);
        let labels: Vec<_> = timeline.posts().iter().map(|p| p.description.as_str()).collect();
        assert_eq!(labels, vec!["a 10:10", "b 10:05", "a 10:00"]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let fetcher = StubFetcher::new()
            .reply("https://a.example/feed.xml", Reply::Body(feed_bytes("a", &[0], None)))
            .reply(
                "https://b.example/feed.xml",
                Reply::Fail(FetchError::connection("https://b.example/feed.xml", "refused")),
            )
            .reply("https://c.example/feed.xml", Reply::Body(b"not xml".to_vec()));

        let outcome = crawler(fetcher, 5)
            .get_all_items(&links(&[
                "https://a.example/feed.xml",
                "https://b.example/feed.xml",
                "https://c.example/feed.xml",
            ]))
            .await;

        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(outcome.feeds.len(), 1);
        assert!(matches!(
            outcome.failures["https://c.example/feed.xml"],
            FetchError::Parse { .. }
        ));
        assert_eq!(
            outcome.failed_links(),
            links(&["https://b.example/feed.xml", "https://c.example/feed.xml"])
        );
    }

    #[tokio::test]
    async fn test_batch_deadline_returns_partial_results() {
        let fetcher = StubFetcher::new()
            .reply("https://a.example/feed.xml", Reply::Body(feed_bytes("a", &[0], None)))
            .reply("https://slow.example/feed.xml", Reply::Hang);
        // the per-fetch timeout outlives the batch deadline here
        let mut crawler = crawler(fetcher, 1);
        crawler.config.timeout_secs = 30;

        let outcome = crawler
            .get_all_items(&links(&["https://a.example/feed.xml", "https://slow.example/feed.xml"]))
            .await;

        assert_eq!(outcome.status, BatchStatus::TimedOut);
        assert_eq!(outcome.timed_out, links(&["https://slow.example/feed.xml"]));
        assert!(outcome.feeds.contains_key("https://a.example/feed.xml"));
    }

    #[tokio::test]
    async fn test_blocked_and_duplicate_links_are_skipped() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .reply("https://a.example/feed.xml", Reply::Body(feed_bytes("a", &[0], None))),
        );
        let crawler = OnDemandCrawler::new(
            fetcher.clone(),
            ItemCodec::default(),
            CrawlerConfig::default(),
        );
        let blocked: HashSet<String> = ["https://b.example/feed.xml".to_string()].into();

        let outcome = crawler
            .get_all_items_except(
                &links(&[
                    "https://a.example/feed.xml",
                    "https://a.example/feed.xml",
                    "https://b.example/feed.xml",
                ]),
                &blocked,
            )
            .await;

        assert_eq!(outcome.feeds.len(), 1);
        assert_eq!(fetcher.calls("https://a.example/feed.xml"), 1);
        assert_eq!(fetcher.calls("https://b.example/feed.xml"), 0);
    }

    #[test]
    fn test_next_page_resolves_relative_links() {
        let channel = Channel {
            next_node: Some("feed-2.xml".into()),
            ..Channel::default()
        };
        assert_eq!(
            next_page("https://a.example/u/feed.xml", &channel).as_deref(),
            Some("https://a.example/u/feed-2.xml")
        );
        assert_eq!(next_page("https://a.example/u/feed.xml", &Channel::default()), None);
    }
}
