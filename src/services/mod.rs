//! Service layer for the microblog engine.
//!
//! This module contains the business logic for:
//! - Feed retrieval (`Fetcher`, `HttpFetcher`)
//! - Timeline merging (`Timeline`)
//! - Blocking batch crawls (`OnDemandCrawler`)
//! - Background crawling (`CrawlScheduler`)
//! - Local user accounts (`Account`)

pub mod account;
pub mod batch;
pub mod fetcher;
pub mod scheduler;
pub mod timeline;

pub use account::{Account, HomeTimeline, ProfileUpdate, UserRecord};
pub use batch::{BatchOutcome, BatchStatus, OnDemandCrawler, SourceFeed};
pub use fetcher::{FetchResult, Fetcher, HttpFetcher};
pub use scheduler::{
    CrawlHandler, CrawlScheduler, CrawlerHandle, CrawlerState, CycleReport, LogHandler,
    SourceProvider, SourceState, StaticSources,
};
pub use timeline::{Timeline, merge};
