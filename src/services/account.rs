// src/services/account.rs

//! Local user accounts.
//!
//! An account owns three documents under `users/{user_id}/`: the feed,
//! the follows list and the blocks list. Its registration record lives in
//! the settings store under `user:{user_id}`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::models::{Channel, Document, Kind, ListRef, Post, ReplyFields, RepostFields, Source};
use crate::services::batch::{BatchStatus, OnDemandCrawler};
use crate::services::scheduler::SourceProvider;
use crate::services::timeline::Timeline;
use crate::storage::settings::{get_as, set_as};
use crate::storage::{FeedStore, SettingsStore, TimelineCache};

const MAX_USERNAME_LENGTH: usize = 25;

/// Settings key holding the id of the first registered user.
pub const DEFAULT_USER_KEY: &str = "default_user";

/// Registration record kept in the settings store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: String,
    pub username: String,
    /// Public link of the user's feed
    pub link: String,
    pub feed_location: String,
    pub follows_location: String,
    pub blocks_location: String,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn settings_key(user_id: &str) -> String {
        format!("user:{user_id}")
    }
}

/// Profile fields to change; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub user_full_name: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub docs: Option<String>,
    pub relocate: Option<String>,
}

/// A merged home timeline and the sources that did not make it in.
#[derive(Debug, Clone)]
pub struct HomeTimeline {
    pub posts: Vec<Post>,
    /// Followed links that failed or timed out
    pub failed: Vec<String>,
    pub status: BatchStatus,
}

/// A local user and their documents.
pub struct Account {
    store: Arc<FeedStore>,
    settings: Arc<dyn SettingsStore>,
    cache: Option<Arc<dyn TimelineCache>>,
    record: UserRecord,
    timeline_cap: usize,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("record", &self.record)
            .field("timeline_cap", &self.timeline_cap)
            .finish_non_exhaustive()
    }
}

impl Account {
    /// Register a new user and create their documents.
    ///
    /// `link` is where the feed is published; it defaults to the store's
    /// public link for the feed location.
    pub async fn create(
        store: Arc<FeedStore>,
        settings: Arc<dyn SettingsStore>,
        username: &str,
        link: Option<String>,
    ) -> Result<Self> {
        validate_username(username)?;

        let user_id = mint_user_id(username);
        let feed_location = format!("users/{user_id}/feed.xml");
        let follows_location = format!("users/{user_id}/follows.xml");
        let blocks_location = format!("users/{user_id}/blocks.xml");
        let link = link.unwrap_or_else(|| store.published_link(&feed_location));

        let record = UserRecord {
            user_id: user_id.clone(),
            username: username.to_string(),
            link: link.clone(),
            feed_location,
            follows_location,
            blocks_location,
            created_at: Utc::now(),
        };

        let list_channel = |location: &str| Channel {
            username: Some(username.to_string()),
            user_id: Some(user_id.clone()),
            link: Some(store.published_link(location)),
            ..Channel::default()
        };
        let follows: Document<Source> = Document::new(list_channel(&record.follows_location));
        let blocks: Document<Source> = Document::new(list_channel(&record.blocks_location));
        let feed: Document<Post> = Document::new(Channel {
            username: Some(username.to_string()),
            user_id: Some(user_id.clone()),
            link: Some(link),
            language: Some(store.codec().default_language().to_string()),
            follows: Some(ListRef {
                url: store.published_link(&record.follows_location),
                count: 0,
            }),
            blocks: Some(ListRef {
                url: store.published_link(&record.blocks_location),
                count: 0,
            }),
            ..Channel::default()
        });

        store.write_document(&follows, &record.follows_location).await?;
        store.write_document(&blocks, &record.blocks_location).await?;
        store.write_document(&feed, &record.feed_location).await?;

        set_as(settings.as_ref(), &UserRecord::settings_key(&user_id), &record).await?;
        if settings.get(DEFAULT_USER_KEY).await?.is_none() {
            settings
                .set(DEFAULT_USER_KEY, serde_json::Value::String(user_id.clone()))
                .await?;
        }

        log::info!("Created user {} ({})", username, user_id);
        Ok(Self::from_record(store, settings, record))
    }

    /// Load a registered user.
    pub async fn open(
        store: Arc<FeedStore>,
        settings: Arc<dyn SettingsStore>,
        user_id: &str,
    ) -> Result<Self> {
        let record: UserRecord = get_as(settings.as_ref(), &UserRecord::settings_key(user_id))
            .await?
            .ok_or_else(|| AppError::not_found(format!("user {user_id}")))?;
        Ok(Self::from_record(store, settings, record))
    }

    /// Load the first registered user.
    pub async fn open_default(store: Arc<FeedStore>, settings: Arc<dyn SettingsStore>) -> Result<Self> {
        let user_id: String = get_as(settings.as_ref(), DEFAULT_USER_KEY)
            .await?
            .ok_or_else(|| AppError::not_found("registered user"))?;
        Self::open(store, settings, &user_id).await
    }

    fn from_record(store: Arc<FeedStore>, settings: Arc<dyn SettingsStore>, record: UserRecord) -> Self {
        Self {
            store,
            settings,
            cache: None,
            record,
            timeline_cap: crate::models::TimelineConfig::default().cache_cap,
        }
    }

    /// Keep home timeline snapshots in `cache`, served when sources fail.
    pub fn with_cache(mut self, cache: Arc<dyn TimelineCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_timeline_cap(mut self, cap: usize) -> Self {
        self.timeline_cap = cap;
        self
    }

    pub fn record(&self) -> &UserRecord {
        &self.record
    }

    pub fn user_id(&self) -> &str {
        &self.record.user_id
    }

    pub fn link(&self) -> &str {
        &self.record.link
    }

    /// This account as a followable source.
    pub fn as_source(&self) -> Source {
        Source::new(&self.record.user_id, &self.record.username, &self.record.link)
    }

    // --- Posting ---

    pub async fn post(&self, description: &str) -> Result<Post> {
        self.publish(description, Kind::Status).await
    }

    pub async fn reply(&self, description: &str, to: ReplyFields) -> Result<Post> {
        self.publish(description, Kind::Reply(to)).await
    }

    pub async fn repost(&self, description: &str, of: RepostFields) -> Result<Post> {
        self.publish(description, Kind::Repost(of)).await
    }

    async fn publish(&self, description: &str, kind: Kind) -> Result<Post> {
        // documents carry whole seconds
        let now = Local::now().fixed_offset().trunc_subsecs(0);
        let mut post = Post::compose(&self.record.link, now, description.trim(), kind);
        post.language = Some(self.store.codec().default_language().to_string());
        post.validate(self.store.codec().max_description_length())?;

        let outcome = self
            .store
            .append_post(&self.record.feed_location, post.clone())
            .await?;
        if let Some(archive) = outcome.archived {
            log::debug!("Feed of {} rolled over into {}", self.record.user_id, archive);
        }
        self.invalidate_home().await;
        Ok(post)
    }

    pub async fn delete_post(&self, guid: &str) -> Result<()> {
        self.store
            .delete_post(&self.record.feed_location, guid)
            .await?;
        self.invalidate_home().await;
        Ok(())
    }

    // --- Following ---

    /// Follow a source. Returns `false` if it was already followed.
    pub async fn follow(&self, source: Source) -> Result<bool> {
        if self.is_blocked(&source.user_link).await? {
            return Err(AppError::validation(format!(
                "{} is blocked; unblock it before following",
                source.user_link
            )));
        }
        let link = source.user_link.clone();
        let appended = self
            .store
            .append_unless(&self.record.follows_location, source, |s: &Source| {
                s.user_link == link
            })
            .await?;
        if appended.is_none() {
            return Ok(false);
        }

        self.sync_counts().await?;
        self.invalidate_home().await;
        Ok(true)
    }

    /// Follow a feed by link, reading its user id and name from the feed.
    pub async fn follow_link(&self, crawler: &OnDemandCrawler, link: &str) -> Result<Source> {
        let feed = crawler.get_feed(link).await?;
        let (Some(user_id), Some(username)) = (feed.info.user_id, feed.info.username) else {
            return Err(AppError::validation(format!(
                "{link} does not name its user; cannot follow it"
            )));
        };

        let source = Source::new(user_id, username, link);
        self.follow(source.clone()).await?;
        Ok(source)
    }

    /// Stop following a source. All three fields must match.
    pub async fn unfollow(&self, source: &Source) -> Result<()> {
        self.store
            .remove_from_chain::<Source, _>(&self.record.follows_location, |s| {
                s.matches(&source.user_id, &source.user_link, &source.user_name)
            })
            .await?;
        self.sync_counts().await?;
        self.invalidate_home().await;
        Ok(())
    }

    // --- Blocking ---

    /// Block a source, dropping any follow of it. Returns `false` if it
    /// was already blocked.
    pub async fn block(&self, source: Source) -> Result<bool> {
        let link = source.user_link.clone();
        match self
            .store
            .remove_from_chain::<Source, _>(&self.record.follows_location, |s| s.user_link == link)
            .await
        {
            Ok(_) => log::info!("Dropped follow of {} before blocking", link),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let added = self
            .store
            .append_unless(&self.record.blocks_location, source, |s: &Source| {
                s.user_link == link
            })
            .await?
            .is_some();

        self.sync_counts().await?;
        self.invalidate_home().await;
        Ok(added)
    }

    pub async fn unblock(&self, source: &Source) -> Result<()> {
        self.store
            .remove_from_chain::<Source, _>(&self.record.blocks_location, |s| {
                s.matches(&source.user_id, &source.user_link, &source.user_name)
            })
            .await?;
        self.sync_counts().await
    }

    pub async fn follows(&self) -> Result<Vec<Source>> {
        self.store
            .read_chain(&self.record.follows_location, None)
            .await
    }

    pub async fn blocks(&self) -> Result<Vec<Source>> {
        self.store
            .read_chain(&self.record.blocks_location, None)
            .await
    }

    async fn is_blocked(&self, link: &str) -> Result<bool> {
        Ok(self.blocks().await?.iter().any(|s| s.user_link == link))
    }

    /// Rewrite the follows/blocks counts on the feed channel.
    async fn sync_counts(&self) -> Result<()> {
        let follows = self.follows().await?.len();
        let blocks = self.blocks().await?.len();
        let follows_url = self.store.published_link(&self.record.follows_location);
        let blocks_url = self.store.published_link(&self.record.blocks_location);

        self.store
            .update_channel::<Post, _>(&self.record.feed_location, |channel| {
                channel.follows = Some(ListRef {
                    url: follows_url,
                    count: follows,
                });
                channel.blocks = Some(ListRef {
                    url: blocks_url,
                    count: blocks,
                });
            })
            .await?;
        Ok(())
    }

    // --- Profile ---

    pub async fn profile(&self) -> Result<Channel> {
        Ok(self
            .store
            .read_document::<Post>(&self.record.feed_location)
            .await?
            .into_document()
            .channel)
    }

    pub async fn update_profile(&mut self, update: ProfileUpdate) -> Result<Channel> {
        if let Some(username) = &update.username {
            validate_username(username)?;
        }

        let channel = self
            .store
            .update_channel::<Post, _>(&self.record.feed_location, |channel| {
                let fields = [
                    (&mut channel.username, update.username.clone()),
                    (&mut channel.user_full_name, update.user_full_name),
                    (&mut channel.description, update.description),
                    (&mut channel.language, update.language),
                    (&mut channel.docs, update.docs),
                    (&mut channel.relocate, update.relocate),
                ];
                for (field, value) in fields {
                    if let Some(value) = value {
                        *field = Some(value).filter(|v| !v.trim().is_empty());
                    }
                }
            })
            .await?;

        if let Some(username) = update.username {
            self.record.username = username;
            set_as(
                self.settings.as_ref(),
                &UserRecord::settings_key(&self.record.user_id),
                &self.record,
            )
            .await?;
        }
        Ok(channel)
    }

    // --- Timelines ---

    /// Posts from this user's own feed, across archives.
    ///
    /// With `start`, returns posts around that guid (see
    /// [`Timeline::fetch`]); without, the `n` newest.
    pub async fn user_timeline(&self, start: Option<&str>, n: i64) -> Result<Vec<Post>> {
        let posts: Vec<Post> = self
            .store
            .read_chain(&self.record.feed_location, None)
            .await?;
        let timeline = Timeline::from_posts(posts, usize::MAX);
        match start {
            Some(guid) => timeline.fetch(guid, n),
            None => timeline.fetch_top(n),
        }
    }

    /// Posts from followed sources merged with this user's own.
    ///
    /// Blocked sources are skipped. Sources that fail or time out are
    /// reported in [`HomeTimeline::failed`]; the last cached snapshot
    /// fills in for them.
    pub async fn home_timeline(
        &self,
        crawler: &OnDemandCrawler,
        start: Option<&str>,
        n: i64,
    ) -> Result<HomeTimeline> {
        let links: Vec<String> = self
            .follows()
            .await?
            .into_iter()
            .map(|s| s.user_link)
            .filter(|link| link != &self.record.link)
            .collect();
        let blocked: HashSet<String> = self
            .blocks()
            .await?
            .into_iter()
            .map(|s| s.user_link)
            .collect();

        let outcome = crawler.get_all_items_except(&links, &blocked).await;
        let failed = outcome.failed_links();
        let status = outcome.status;

        let mut timeline = outcome.into_timeline(self.timeline_cap);
        timeline.merge(
            self.store
                .read_chain::<Post>(&self.record.feed_location, Some(self.timeline_cap))
                .await?,
        );

        if let Some(cache) = &self.cache {
            let key = self.home_key();
            if !failed.is_empty() {
                if let Some(cached) = cache.get(&key).await? {
                    timeline.merge(cached);
                }
            }
            cache.set(&key, timeline.posts().to_vec()).await?;
        }

        let posts = match start {
            Some(guid) => timeline.fetch(guid, n)?,
            None => timeline.fetch_top(n)?,
        };
        Ok(HomeTimeline {
            posts,
            failed,
            status,
        })
    }

    fn home_key(&self) -> String {
        format!("home:{}", self.record.user_id)
    }

    async fn invalidate_home(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate(&self.home_key()).await {
                log::warn!("Failed to invalidate home timeline: {}", e);
            }
        }
    }
}

#[async_trait]
impl SourceProvider for Account {
    async fn follow_list(&self) -> Result<Vec<String>> {
        Ok(self.follows().await?.into_iter().map(|s| s.user_link).collect())
    }

    async fn block_list(&self) -> Result<HashSet<String>> {
        Ok(self.blocks().await?.into_iter().map(|s| s.user_link).collect())
    }
}

fn validate_username(username: &str) -> Result<()> {
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if username.is_empty() || username.len() > MAX_USERNAME_LENGTH || !valid_chars {
        return Err(AppError::validation(format!(
            "username '{username}' must be 1-{MAX_USERNAME_LENGTH} letters, digits or underscores"
        )));
    }
    Ok(())
}

fn mint_user_id(username: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true).as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
