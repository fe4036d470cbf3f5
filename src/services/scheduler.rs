// src/services/scheduler.rs

//! Continuous background crawling.
//!
//! Every `interval_secs` the scheduler refreshes its follow and block
//! lists, fetches each followed source through a bounded pool, pushes
//! items newer than the source's last-seen marker to the handler and
//! merges them into a shared timeline.
//!
//! ```text
//! Idle -> FetchingSources -> Merging -> Idle ... -> Stopped
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::codec::ItemCodec;
use crate::error::{FetchError, Result};
use crate::models::{Channel, CrawlerConfig, Post};
use crate::services::batch::{fetch_page, next_page};
use crate::services::fetcher::Fetcher;
use crate::services::timeline::Timeline;
use crate::storage::TimelineCache;

/// Supplies the links to crawl, re-read at the start of every cycle.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn follow_list(&self) -> Result<Vec<String>>;

    async fn block_list(&self) -> Result<HashSet<String>>;
}

/// Fixed follow and block lists.
#[derive(Debug, Clone, Default)]
pub struct StaticSources {
    pub follows: Vec<String>,
    pub blocks: HashSet<String>,
}

impl StaticSources {
    pub fn new(follows: Vec<String>) -> Self {
        Self {
            follows,
            blocks: HashSet::new(),
        }
    }
}

#[async_trait]
impl SourceProvider for StaticSources {
    async fn follow_list(&self) -> Result<Vec<String>> {
        Ok(self.follows.clone())
    }

    async fn block_list(&self) -> Result<HashSet<String>> {
        Ok(self.blocks.clone())
    }
}

/// Callbacks invoked while crawling. Called from the crawl task, so keep
/// them short.
pub trait CrawlHandler: Send + Sync {
    /// A post newer than the source's marker.
    fn on_item(&self, source: &str, post: &Post);

    fn on_info(&self, _source: &str, _info: &Channel) {}

    /// A source failed; `consecutive` counts failures since its last success.
    fn on_error(&self, _source: &str, _error: &FetchError, _consecutive: u32) {}

    fn on_cycle(&self, _report: &CycleReport) {}
}

/// Handler that only logs.
pub struct LogHandler;

impl CrawlHandler for LogHandler {
    fn on_item(&self, source: &str, post: &Post) {
        log::debug!("New post {} from {}", post.guid, source);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlerState {
    Idle,
    FetchingSources,
    Merging,
    Stopped,
}

/// Newest pubdate seen for a source, plus the guids carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub pubdate: DateTime<FixedOffset>,
    pub guids: HashSet<String>,
}

impl Marker {
    fn is_new(marker: Option<&Marker>, post: &Post) -> bool {
        match marker {
            None => true,
            Some(m) => {
                post.pubdate > m.pubdate
                    || (post.pubdate == m.pubdate && !m.guids.contains(&post.guid))
            }
        }
    }

    fn advance(marker: Option<Marker>, posts: &[Post]) -> Option<Marker> {
        let newest = posts.iter().map(|p| p.pubdate).max();
        let Some(newest) = newest else {
            return marker;
        };

        let mut next = match marker {
            Some(m) if m.pubdate > newest => return Some(m),
            Some(m) if m.pubdate == newest => m,
            _ => Marker {
                pubdate: newest,
                guids: HashSet::new(),
            },
        };
        next.guids.extend(
            posts
                .iter()
                .filter(|p| p.pubdate == newest)
                .map(|p| p.guid.clone()),
        );
        Some(next)
    }
}

/// Crawl bookkeeping for one source.
#[derive(Debug, Clone, Default)]
pub struct SourceState {
    pub marker: Option<Marker>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<FetchError>,
    pub last_success: Option<DateTime<Utc>>,
}

/// Summary of one crawl cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub sources: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: Vec<String>,
    pub new_items: usize,
}

/// Merged timeline plus the source each post came from.
#[derive(Debug, Default)]
struct Merged {
    timeline: Timeline,
    origins: HashMap<String, String>,
}

impl Merged {
    /// Drop posts whose source is not in `active`.
    fn retain_sources(&mut self, active: &HashSet<&str>) -> usize {
        let before = self.timeline.len();
        let origins = &self.origins;
        self.timeline.retain(|post| {
            origins
                .get(&post.guid)
                .is_some_and(|source| active.contains(source.as_str()))
        });
        self.forget_evicted();
        before - self.timeline.len()
    }

    fn merge(&mut self, discovered: Vec<(String, Post)>) {
        for (source, post) in &discovered {
            self.origins
                .entry(post.guid.clone())
                .or_insert_with(|| source.clone());
        }
        self.timeline
            .merge(discovered.into_iter().map(|(_, post)| post));
        self.forget_evicted();
    }

    fn forget_evicted(&mut self) {
        let kept: HashSet<&str> = self.timeline.posts().iter().map(|p| p.guid.as_str()).collect();
        self.origins.retain(|guid, _| kept.contains(guid.as_str()));
    }
}

/// Long-running crawler. Start it with [`CrawlScheduler::start`] or drive
/// it one cycle at a time with [`CrawlScheduler::run_cycle`].
pub struct CrawlScheduler {
    fetcher: Arc<dyn Fetcher>,
    codec: ItemCodec,
    config: CrawlerConfig,
    sources: Arc<dyn SourceProvider>,
    handler: Arc<dyn CrawlHandler>,
    cache: Option<(Arc<dyn TimelineCache>, String)>,
    states: Mutex<HashMap<String, SourceState>>,
    merged: RwLock<Merged>,
    state_tx: watch::Sender<CrawlerState>,
}

impl CrawlScheduler {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        codec: ItemCodec,
        config: CrawlerConfig,
        sources: Arc<dyn SourceProvider>,
        handler: Arc<dyn CrawlHandler>,
        timeline_cap: usize,
    ) -> Self {
        let (state_tx, _) = watch::channel(CrawlerState::Idle);
        Self {
            fetcher,
            codec,
            config,
            sources,
            handler,
            cache: None,
            states: Mutex::new(HashMap::new()),
            merged: RwLock::new(Merged {
                timeline: Timeline::new(timeline_cap),
                origins: HashMap::new(),
            }),
            state_tx,
        }
    }

    /// Write a timeline snapshot to `cache` under `key` after each cycle.
    pub fn with_cache(mut self, cache: Arc<dyn TimelineCache>, key: impl Into<String>) -> Self {
        self.cache = Some((cache, key.into()));
        self
    }

    pub fn state(&self) -> CrawlerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CrawlerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: CrawlerState) {
        self.state_tx.send_replace(state);
    }

    pub async fn timeline(&self) -> Timeline {
        self.merged.read().await.timeline.clone()
    }

    pub async fn source_state(&self, source: &str) -> Option<SourceState> {
        self.states.lock().await.get(source).cloned()
    }

    /// Consecutive failures of `source` since its last success.
    pub async fn failures(&self, source: &str) -> u32 {
        self.source_state(source)
            .await
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    /// Run the crawl loop on a background task.
    pub fn start(self: Arc<Self>) -> CrawlerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(&self);
        let task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

        log::info!(
            "Crawler started, interval {}s",
            self.config.interval_secs
        );
        CrawlerHandle {
            scheduler: self,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.run_cycle().await {
                log::error!("Crawl cycle failed: {}", e);
                self.set_state(CrawlerState::Idle);
            }
        }

        self.set_state(CrawlerState::Stopped);
        log::info!("Crawler stopped");
    }

    /// Run one full cycle: refresh lists, fetch, merge.
    ///
    /// Per-source failures are recorded and reported, never returned; an
    /// `Err` means the source lists themselves could not be read.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let follows = self.sources.follow_list().await?;
        let blocks = self.sources.block_list().await?;

        let mut seen = HashSet::new();
        let links: Vec<String> = follows
            .into_iter()
            .filter(|link| seen.insert(link.clone()))
            .collect();
        let mut report = CycleReport {
            sources: links.len(),
            ..CycleReport::default()
        };
        let links: Vec<String> = links
            .into_iter()
            .filter(|link| !blocks.contains(link))
            .collect();
        report.skipped = report.sources - links.len();
        self.forget_inactive(&links).await;

        self.set_state(CrawlerState::FetchingSources);
        log::debug!("Crawling {} sources", links.len());

        let markers: HashMap<String, Option<Marker>> = {
            let states = self.states.lock().await;
            links
                .iter()
                .map(|l| (l.clone(), states.get(l).and_then(|s| s.marker.clone())))
                .collect()
        };

        let concurrency = self.config.max_concurrent.max(1);
        let markers = &markers;
        let mut results = stream::iter(links)
            .map(|link| async move {
                let marker = markers.get(&link).cloned().flatten();
                let result = self.crawl_source(&link, marker.as_ref()).await;
                (link, result)
            })
            .buffer_unordered(concurrency);

        let mut discovered: Vec<(String, Post)> = Vec::new();
        while let Some((link, result)) = results.next().await {
            match result {
                Ok((info, posts)) => {
                    self.handler.on_info(&link, &info);
                    for post in &posts {
                        self.handler.on_item(&link, post);
                    }

                    let mut states = self.states.lock().await;
                    let state = states.entry(link.clone()).or_default();
                    state.marker = Marker::advance(state.marker.take(), &posts);
                    state.consecutive_failures = 0;
                    state.last_success = Some(Utc::now());

                    report.succeeded += 1;
                    report.new_items += posts.len();
                    discovered.extend(posts.into_iter().map(|post| (link.clone(), post)));
                }
                Err(error) => {
                    let consecutive = {
                        let mut states = self.states.lock().await;
                        let state = states.entry(link.clone()).or_default();
                        state.consecutive_failures += 1;
                        state.total_failures += 1;
                        state.last_error = Some(error.clone());
                        state.consecutive_failures
                    };

                    log::warn!("{} (failure {} in a row)", error, consecutive);
                    self.handler.on_error(&link, &error, consecutive);
                    report.failed.push(link);
                }
            }
        }
        drop(results);

        self.set_state(CrawlerState::Merging);
        let snapshot = {
            let mut merged = self.merged.write().await;
            merged.merge(discovered);
            merged.timeline.posts().to_vec()
        };
        if let Some((cache, key)) = &self.cache {
            if let Err(e) = cache.set(key, snapshot).await {
                log::warn!("Failed to cache timeline snapshot: {}", e);
            }
        }

        self.set_state(CrawlerState::Idle);
        log::info!(
            "Crawl cycle done: {} ok, {} failed, {} skipped, {} new posts",
            report.succeeded,
            report.failed.len(),
            report.skipped,
            report.new_items
        );
        self.handler.on_cycle(&report);
        Ok(report)
    }

    /// Drop what sources outside `active` contributed: their posts leave
    /// the timeline and their markers reset, so a source followed again
    /// is read from its first page.
    async fn forget_inactive(&self, active: &[String]) {
        let active: HashSet<&str> = active.iter().map(String::as_str).collect();

        let dropped = self.merged.write().await.retain_sources(&active);
        if dropped > 0 {
            log::info!("Dropped {} posts of unfollowed or blocked sources", dropped);
        }

        let mut states = self.states.lock().await;
        for (source, state) in states.iter_mut() {
            if !active.contains(source.as_str()) {
                state.marker = None;
            }
        }
    }

    /// Fetch a source and return its items newer than `marker`, in
    /// document order.
    ///
    /// Without a marker only the first page is read. With one, archive
    /// pages are followed until the marker shows up or
    /// `max_pages_per_source` pages have been read.
    async fn crawl_source(
        &self,
        link: &str,
        marker: Option<&Marker>,
    ) -> std::result::Result<(Channel, Vec<Post>), FetchError> {
        let timeout = self.config.timeout();
        let max_pages = self.config.max_pages_per_source.max(1);

        let first = fetch_page(self.fetcher.as_ref(), &self.codec, link, timeout).await?;
        let info = first.document.channel.clone();

        let mut visited = HashSet::from([link.to_string()]);
        let mut page = first.document;
        let mut page_url = link.to_string();
        let mut posts = Vec::new();

        for page_number in 1..=max_pages {
            let total = page.items.len();
            let fresh: Vec<Post> = page
                .items
                .into_iter()
                .filter(|p| Marker::is_new(marker, p))
                .collect();
            let reached = marker.is_none() || fresh.len() < total;
            posts.extend(fresh);
            if reached || page_number == max_pages {
                break;
            }

            let Some(next) = next_page(&page_url, &page.channel) else {
                break;
            };
            if !visited.insert(next.clone()) {
                break;
            }
            match fetch_page(self.fetcher.as_ref(), &self.codec, &next, timeout).await {
                Ok(parsed) => {
                    page = parsed.document;
                    page_url = next;
                }
                Err(e) => {
                    // the first page already answered; keep what we have
                    log::debug!("Stopped paging {}: {}", link, e);
                    break;
                }
            }
        }

        Ok((info, posts))
    }
}

/// Control handle for a running [`CrawlScheduler`].
///
/// Dropping the handle stops the loop after its current cycle.
pub struct CrawlerHandle {
    scheduler: Arc<CrawlScheduler>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CrawlerHandle {
    pub fn state(&self) -> CrawlerState {
        self.scheduler.state()
    }

    pub fn scheduler(&self) -> &Arc<CrawlScheduler> {
        &self.scheduler
    }

    pub async fn timeline(&self) -> Timeline {
        self.scheduler.timeline().await
    }

    pub async fn failures(&self, source: &str) -> u32 {
        self.scheduler.failures(source).await
    }

    /// Stop the crawler.
    ///
    /// A graceful stop lets the running cycle finish within the grace
    /// period; whatever is still in flight after that is cancelled.
    pub async fn stop(self, graceful: bool) {
        self.shutdown.send_replace(true);
        let mut task = self.task;

        if graceful {
            let grace = self.scheduler.config.grace_period();
            if tokio::time::timeout(grace, &mut task).await.is_ok() {
                return;
            }
            log::warn!("Crawl still running after {:?}, cancelling", grace);
        }

        task.abort();
        let _ = task.await;
        self.scheduler.set_state(CrawlerState::Stopped);
    }
}
