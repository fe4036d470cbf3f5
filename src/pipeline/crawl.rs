// src/pipeline/crawl.rs

//! Crawl entry point for the CLI.

use std::sync::Arc;

use crate::error::Result;
use crate::models::Config;
use crate::services::{
    Account, CrawlHandler, CrawlScheduler, CycleReport, HttpFetcher, LogHandler, SourceProvider,
};
use crate::storage::{FeedStore, TimelineCache};

/// Crawl an account's follows.
///
/// With `once`, runs a single cycle and returns its report. Otherwise the
/// crawler runs in the background until Ctrl-C, then stops gracefully.
pub async fn run_crawler(
    config: Arc<Config>,
    store: Arc<FeedStore>,
    account: Arc<Account>,
    cache: Arc<dyn TimelineCache>,
    once: bool,
) -> Result<Option<CycleReport>> {
    let fetcher = Arc::new(HttpFetcher::new(&config.crawler)?);
    let sources: Arc<dyn SourceProvider> = account.clone();
    let handler: Arc<dyn CrawlHandler> = Arc::new(LogHandler);

    let follows = sources.follow_list().await?;
    log::info!(
        "Crawling {} followed feeds for {}",
        follows.len(),
        account.user_id()
    );

    let scheduler = CrawlScheduler::new(
        fetcher,
        store.codec().clone(),
        config.crawler.clone(),
        sources,
        handler,
        config.timeline.cache_cap,
    )
    .with_cache(cache, format!("home:{}", account.user_id()));

    if once {
        let report = scheduler.run_cycle().await?;
        for link in &report.failed {
            log::warn!("Failed: {}", link);
        }
        return Ok(Some(report));
    }

    let handle = Arc::new(scheduler).start();
    tokio::signal::ctrl_c().await?;
    log::info!("Interrupted, stopping crawler...");
    handle.stop(true).await;
    Ok(None)
}
