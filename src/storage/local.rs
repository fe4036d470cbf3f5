//! Local filesystem feed store.
//!
//! Documents are addressed by a location relative to the store root
//! (`users/{id}/feed.xml`). A live document links to older archive
//! segments through `next_node`; every chain walk tracks the locations
//! it visited and stops on a revisit.
//!
//! ## Concurrency
//!
//! Read-modify-write sequences (append, remove) hold a per-location
//! async lock. Plain reads take no lock: writes go through a temp file
//! and a rename, so a reader always sees a complete document.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{Local, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use url::Url;

use crate::codec::{self, ItemCodec, Record};
use crate::error::{AppError, Result};
use crate::models::{Channel, Document, FeedConfig, ParsedDocument, Post};
use crate::storage::write_atomic;

/// What an append did to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Items in the live document after the append
    pub item_count: usize,
    /// Location of the archive created, if the append overflowed
    pub archived: Option<String>,
}

type LockMap = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Paginated feed documents rooted at a directory.
pub struct FeedStore {
    root_dir: PathBuf,
    public_url: Option<Url>,
    max_posts_per_feed: usize,
    max_feed_size_bytes: usize,
    codec: ItemCodec,
    locks: LockMap,
}

/// Write lock on one location. The map entry is dropped with the last
/// holder or waiter.
struct LocationGuard<'a> {
    locks: &'a LockMap,
    location: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LocationGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.location)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.location);
        }
    }
}

impl FeedStore {
    /// Create a store rooted at `root_dir` with limits from `config`.
    pub fn new(root_dir: impl Into<PathBuf>, config: &FeedConfig) -> Result<Self> {
        let public_url = config
            .public_url
            .as_deref()
            .map(|u| Url::parse(&with_trailing_slash(u)))
            .transpose()?;

        Ok(Self {
            root_dir: root_dir.into(),
            public_url,
            max_posts_per_feed: config.max_posts_per_feed,
            max_feed_size_bytes: config.max_feed_size_bytes,
            codec: ItemCodec::from_config(config),
            locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn codec(&self) -> &ItemCodec {
        &self.codec
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Resolve a location to a path, refusing anything outside the root.
    fn path(&self, location: &str) -> Result<PathBuf> {
        let relative = Path::new(location.trim());
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if location.trim().is_empty() || escapes {
            return Err(AppError::invalid_input(format!(
                "document location '{location}' is outside the store"
            )));
        }
        Ok(self.root_dir.join(relative))
    }

    async fn lock(&self, location: &str) -> LocationGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(location.to_string()).or_default())
        };
        LocationGuard {
            locks: &self.locks,
            location: location.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Public link of a location, used for `next_node` values.
    pub fn published_link(&self, location: &str) -> String {
        match &self.public_url {
            Some(base) => base
                .join(location)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| location.to_string()),
            None => location.to_string(),
        }
    }

    /// Map a `next_node` value back to a location in this store.
    ///
    /// Absolute URLs outside `public_url` point at someone else's feed
    /// and end the chain.
    pub fn next_location(&self, next_node: &str) -> Option<String> {
        let next_node = next_node.trim();
        if next_node.is_empty() {
            return None;
        }
        if Url::parse(next_node).is_err() {
            return Some(next_node.to_string());
        }
        let base = self.public_url.as_ref()?;
        next_node
            .strip_prefix(base.as_str())
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
    }

    pub async fn exists(&self, location: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path(location)?).await?)
    }

    /// Read and parse a document.
    pub async fn read_document<T: Record>(&self, location: &str) -> Result<ParsedDocument<T>> {
        let path = self.path(location)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::not_found(format!("document {location}")));
            }
            Err(e) => return Err(AppError::Io(e)),
        };

        let parsed: ParsedDocument<T> = codec::decode_document(&self.codec, &bytes)?;
        for rejected in &parsed.rejected {
            log::warn!(
                "Skipping item {} of {}: {}",
                rejected.index,
                location,
                rejected.reason
            );
        }
        Ok(parsed)
    }

    /// Write a document atomically.
    pub async fn write_document<T: Record>(&self, document: &Document<T>, location: &str) -> Result<()> {
        let _guard = self.lock(location).await;
        self.write_unlocked(document, location).await
    }

    async fn write_unlocked<T: Record>(&self, document: &Document<T>, location: &str) -> Result<()> {
        let bytes = self.encode(document)?;
        write_atomic(&self.path(location)?, &bytes).await
    }

    fn encode<T: Record>(&self, document: &Document<T>) -> Result<Vec<u8>> {
        let mut stamped = document.clone();
        stamped.channel.last_build_date = Some(Utc::now().fixed_offset());
        codec::encode_document(&self.codec, &stamped)
    }

    /// Edit the channel metadata of a document in place.
    pub async fn update_channel<T, F>(&self, location: &str, edit: F) -> Result<Channel>
    where
        T: Record,
        F: FnOnce(&mut Channel),
    {
        let _guard = self.lock(location).await;
        let mut document: Document<T> = self.read_document(location).await?.into_document();
        edit(&mut document.channel);
        self.write_unlocked(&document, location).await?;
        Ok(document.channel)
    }

    /// Insert an item at the head of the document at `location`.
    ///
    /// If the document then exceeds `max_posts_per_feed` or
    /// `max_feed_size_bytes`, everything but the new item moves into a
    /// fresh archive file and the live document links to it.
    pub async fn append<T: Record>(&self, location: &str, item: T) -> Result<AppendOutcome> {
        item.encode(&self.codec)?;

        let _guard = self.lock(location).await;
        self.append_locked(location, item).await
    }

    /// As [`Self::append`], unless an item already in the chain matches
    /// `duplicate`. The check and the insert share the live document's
    /// lock, so concurrent callers cannot both add the same item.
    pub async fn append_unless<T, F>(
        &self,
        location: &str,
        item: T,
        duplicate: F,
    ) -> Result<Option<AppendOutcome>>
    where
        T: Record,
        F: Fn(&T) -> bool,
    {
        item.encode(&self.codec)?;

        let _guard = self.lock(location).await;
        let existing: Vec<T> = self.read_chain(location, None).await?;
        if existing.iter().any(|e| duplicate(e)) {
            return Ok(None);
        }
        self.append_locked(location, item).await.map(Some)
    }

    async fn append_locked<T: Record>(&self, location: &str, item: T) -> Result<AppendOutcome> {
        let mut document: Document<T> = self.read_document(location).await?.into_document();
        document.items.insert(0, item);

        let size = self.encode(&document)?.len();
        let overflow =
            document.items.len() > self.max_posts_per_feed || size > self.max_feed_size_bytes;

        if !overflow || document.items.len() < 2 {
            self.write_unlocked(&document, location).await?;
            return Ok(AppendOutcome {
                item_count: document.items.len(),
                archived: None,
            });
        }

        let archive_location = self.archive_location(location).await?;
        let archive = Document {
            channel: document.channel.clone(),
            items: document.items.split_off(1),
        };
        self.write_unlocked(&archive, &archive_location).await?;

        document.channel.next_node = Some(self.published_link(&archive_location));
        self.write_unlocked(&document, location).await?;

        log::info!(
            "Archived {} items from {} to {}",
            archive.items.len(),
            location,
            archive_location
        );
        Ok(AppendOutcome {
            item_count: document.items.len(),
            archived: Some(archive_location),
        })
    }

    pub async fn append_post(&self, location: &str, post: Post) -> Result<AppendOutcome> {
        self.append(location, post).await
    }

    /// Pick an unused archive location next to `location`.
    async fn archive_location(&self, location: &str) -> Result<String> {
        let (stem, ext) = match location.rsplit_once('.') {
            Some((stem, ext)) if !ext.contains('/') => (stem, ext),
            _ => (location, "xml"),
        };
        let stamp = Local::now().format("%Y%m%d%H%M%S%6f");

        let mut candidate = format!("{stem}-{stamp}.{ext}");
        let mut attempt = 1;
        while self.exists(&candidate).await? {
            candidate = format!("{stem}-{stamp}-{attempt}.{ext}");
            attempt += 1;
        }
        Ok(candidate)
    }

    /// Find the first item matching `predicate`, searching the live
    /// document first and then each archive in turn.
    pub async fn find_in_chain<T, F>(&self, location: &str, predicate: F) -> Result<(String, T)>
    where
        T: Record,
        F: Fn(&T) -> bool,
    {
        let mut visited = HashSet::new();
        let mut current = Some(location.to_string());

        while let Some(loc) = current.take() {
            if !visited.insert(loc.clone()) {
                log::warn!("Document chain from {} loops back to {}", location, loc);
                break;
            }
            let document: Document<T> = match self.read_document(&loc).await {
                Ok(parsed) => parsed.into_document(),
                Err(e) if e.is_not_found() && loc != location => {
                    log::warn!("Archive {} linked from the chain is missing", loc);
                    break;
                }
                Err(e) => return Err(e),
            };

            if let Some(item) = document.items.iter().find(|item| predicate(item)) {
                return Ok((loc, item.clone()));
            }
            current = document.next_node().and_then(|n| self.next_location(n));
        }

        Err(AppError::not_found(format!("no matching item in chain {location}")))
    }

    /// Remove the first item matching `predicate` anywhere in the chain.
    ///
    /// Each document is searched and rewritten under its own lock.
    pub async fn remove_from_chain<T, F>(&self, location: &str, predicate: F) -> Result<(String, T)>
    where
        T: Record,
        F: Fn(&T) -> bool,
    {
        let mut visited = HashSet::new();
        let mut current = Some(location.to_string());

        while let Some(loc) = current.take() {
            if !visited.insert(loc.clone()) {
                log::warn!("Document chain from {} loops back to {}", location, loc);
                break;
            }

            let _guard = self.lock(&loc).await;
            let mut document: Document<T> = match self.read_document(&loc).await {
                Ok(parsed) => parsed.into_document(),
                Err(e) if e.is_not_found() && loc != location => {
                    log::warn!("Archive {} linked from the chain is missing", loc);
                    break;
                }
                Err(e) => return Err(e),
            };

            if let Some(index) = document.items.iter().position(|item| predicate(item)) {
                let removed = document.items.remove(index);
                self.write_unlocked(&document, &loc).await?;
                return Ok((loc, removed));
            }
            current = document.next_node().and_then(|n| self.next_location(n));
        }

        Err(AppError::not_found(format!("no matching item in chain {location}")))
    }

    /// Delete the post with `guid`, returning the document it was in.
    pub async fn delete_post(&self, location: &str, guid: &str) -> Result<String> {
        match self
            .remove_from_chain::<Post, _>(location, |post| post.guid == guid)
            .await
        {
            Ok((found_in, _)) => Ok(found_in),
            Err(e) if e.is_not_found() => Err(AppError::not_found(format!("post {guid}"))),
            Err(e) => Err(e),
        }
    }

    /// Collect items across the chain, newest document first.
    pub async fn read_chain<T: Record>(&self, location: &str, limit: Option<usize>) -> Result<Vec<T>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut visited = HashSet::new();
        let mut current = Some(location.to_string());
        let mut items = Vec::new();

        while let Some(loc) = current.take() {
            if items.len() >= limit || !visited.insert(loc.clone()) {
                break;
            }
            let document: Document<T> = match self.read_document(&loc).await {
                Ok(parsed) => parsed.into_document(),
                Err(e) if e.is_not_found() && loc != location => {
                    log::warn!("Archive {} linked from the chain is missing", loc);
                    break;
                }
                Err(e) => return Err(e),
            };

            current = document.next_node().and_then(|n| self.next_location(n));
            items.extend(document.items);
        }

        items.truncate(limit);
        Ok(items)
    }
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, Kind, Source};
    use chrono::{DateTime, Duration};
    use tempfile::TempDir;

    const FEED: &str = "users/u1/feed.xml";

    fn config(max_posts: usize) -> FeedConfig {
        FeedConfig {
            max_posts_per_feed: max_posts,
            ..FeedConfig::default()
        }
    }

    fn post(minutes: i64) -> Post {
        let base = DateTime::parse_from_rfc2822("Mon, 01 Jun 2026 10:00:00 +0000").unwrap();
        Post::compose(
            "https://u1.example/feed.xml",
            base + Duration::minutes(minutes),
            format!("post at +{minutes}"),
            Kind::Status,
        )
    }

    async fn store_with_feed(tmp: &TempDir, max_posts: usize) -> FeedStore {
        let store = FeedStore::new(tmp.path(), &config(max_posts)).unwrap();
        let document: Document<Post> = Document::new(Channel {
            username: Some("u1".into()),
            ..Channel::default()
        });
        store.write_document(&document, FEED).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_append_inserts_newest_first() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_feed(&tmp, 10).await;

        store.append_post(FEED, post(0)).await.unwrap();
        store.append_post(FEED, post(5)).await.unwrap();

        let doc = store.read_document::<Post>(FEED).await.unwrap().into_document();
        assert_eq!(doc.items[0].description, "post at +5");
        assert_eq!(doc.items[1].description, "post at +0");
        assert!(doc.channel.last_build_date.is_some());
        assert_eq!(doc.channel.username.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_third_post_over_limit_of_two_archives() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_feed(&tmp, 2).await;

        assert_eq!(store.append_post(FEED, post(0)).await.unwrap().archived, None);
        assert_eq!(store.append_post(FEED, post(5)).await.unwrap().archived, None);
        let outcome = store.append_post(FEED, post(10)).await.unwrap();

        let archive = outcome.archived.expect("third post should archive");
        assert_eq!(outcome.item_count, 1);

        let live = store.read_document::<Post>(FEED).await.unwrap().into_document();
        assert_eq!(live.items.len(), 1);
        assert_eq!(live.items[0].description, "post at +10");
        assert_eq!(live.next_node(), Some(archive.as_str()));

        let old = store.read_document::<Post>(&archive).await.unwrap().into_document();
        let descriptions: Vec<_> = old.items.iter().map(|p| p.description.as_str()).collect();
        assert_eq!(descriptions, vec!["post at +5", "post at +0"]);
        assert_eq!(old.next_node(), None);
    }

    #[tokio::test]
    async fn test_size_limit_archives_and_chain_stays_linked() {
        let tmp = TempDir::new().unwrap();
        let store = FeedStore::new(
            tmp.path(),
            &FeedConfig {
                max_feed_size_bytes: 600,
                ..FeedConfig::default()
            },
        )
        .unwrap();
        store
            .write_document(&Document::<Post>::default(), FEED)
            .await
            .unwrap();

        for minutes in 0..8 {
            store.append_post(FEED, post(minutes)).await.unwrap();
        }

        let all: Vec<Post> = store.read_chain(FEED, None).await.unwrap();
        assert_eq!(all.len(), 8);
        assert_eq!(all[0].description, "post at +7");
        assert_eq!(all[7].description, "post at +0");

        let live = store.read_document::<Post>(FEED).await.unwrap().into_document();
        assert!(live.items.len() < 8);
        assert!(live.next_node().is_some());
    }

    #[tokio::test]
    async fn test_delete_follows_chain_into_archive() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_feed(&tmp, 2).await;
        let oldest = post(0);
        let guid = oldest.guid.clone();

        store.append_post(FEED, oldest).await.unwrap();
        store.append_post(FEED, post(5)).await.unwrap();
        let archive = store
            .append_post(FEED, post(10))
            .await
            .unwrap()
            .archived
            .unwrap();

        let found_in = store.delete_post(FEED, &guid).await.unwrap();
        assert_eq!(found_in, archive);

        let remaining: Vec<Post> = store.read_chain(FEED, None).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|p| p.guid != guid));

        let err = store.delete_post(FEED, &guid).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_find_in_chain_stops_on_cycle() {
        let tmp = TempDir::new().unwrap();
        let store = FeedStore::new(tmp.path(), &config(10)).unwrap();

        let a: Document<Post> = Document::new(Channel {
            next_node: Some("b.xml".into()),
            ..Channel::default()
        });
        let b: Document<Post> = Document::new(Channel {
            next_node: Some("a.xml".into()),
            ..Channel::default()
        });
        store.write_document(&a, "a.xml").await.unwrap();
        store.write_document(&b, "b.xml").await.unwrap();

        let err = store
            .find_in_chain::<Post, _>("a.xml", |p| p.guid == "nope")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_source_by_all_fields() {
        let tmp = TempDir::new().unwrap();
        let store = FeedStore::new(tmp.path(), &config(10)).unwrap();
        let location = "users/u1/follows.xml";
        store
            .write_document(&Document::<Source>::default(), location)
            .await
            .unwrap();

        let ann = Source::new("1", "ann", "https://ann.example/feed.xml");
        let bob = Source::new("1", "bob", "https://bob.example/feed.xml");
        store.append(location, ann.clone()).await.unwrap();
        store.append(location, bob.clone()).await.unwrap();

        let (_, removed) = store
            .remove_from_chain::<Source, _>(location, |s| {
                s.matches("1", "https://ann.example/feed.xml", "ann")
            })
            .await
            .unwrap();
        assert_eq!(removed, ann);

        let left: Vec<Source> = store.read_chain(location, None).await.unwrap();
        assert_eq!(left, vec![bob]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(store_with_feed(&tmp, 1000).await);

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.append_post(FEED, post(i)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let doc = store.read_document::<Post>(FEED).await.unwrap().into_document();
        assert_eq!(doc.items.len(), 20);
    }

    #[tokio::test]
    async fn test_lock_entries_are_released() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_feed(&tmp, 2).await;

        for minutes in 0..5 {
            store.append_post(FEED, post(minutes)).await.unwrap();
        }
        store.delete_post(FEED, &post(0).guid).await.unwrap();

        assert!(store.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_append_unless_adds_once() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FeedStore::new(tmp.path(), &config(10)).unwrap());
        let location = "users/u1/follows.xml";
        store
            .write_document(&Document::<Source>::default(), location)
            .await
            .unwrap();

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let ann = Source::new("1", "ann", "https://ann.example/feed.xml");
                    store
                        .append_unless(location, ann, |s: &Source| {
                            s.user_link == "https://ann.example/feed.xml"
                        })
                        .await
                })
            })
            .collect();

        let mut added = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().is_some() {
                added += 1;
            }
        }

        assert_eq!(added, 1);
        let follows: Vec<Source> = store.read_chain(location, None).await.unwrap();
        assert_eq!(follows.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_post_is_never_written() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_feed(&tmp, 10).await;
        let mut bad = post(0);
        bad.description = "x".repeat(201);

        assert!(matches!(
            store.append_post(FEED, bad).await,
            Err(AppError::Validation(_))
        ));
        let doc = store.read_document::<Post>(FEED).await.unwrap().into_document();
        assert!(doc.items.is_empty());
    }

    #[tokio::test]
    async fn test_missing_document_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = FeedStore::new(tmp.path(), &config(10)).unwrap();
        let err = store.read_document::<Post>("nope.xml").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_locations_cannot_escape_root() {
        let store = FeedStore::new("/srv/feeds", &config(10)).unwrap();
        assert!(store.path("../etc/passwd").is_err());
        assert!(store.path("/etc/passwd").is_err());
        assert!(store.path("users/u1/feed.xml").is_ok());
    }

    #[test]
    fn test_public_links_map_back_to_locations() {
        let store = FeedStore::new(
            "/srv/feeds",
            &FeedConfig {
                public_url: Some("https://blog.example.com/feeds".into()),
                ..FeedConfig::default()
            },
        )
        .unwrap();

        let link = store.published_link("users/u1/feed-1.xml");
        assert_eq!(link, "https://blog.example.com/feeds/users/u1/feed-1.xml");
        assert_eq!(
            store.next_location(&link).as_deref(),
            Some("users/u1/feed-1.xml")
        );
        assert_eq!(store.next_location("https://elsewhere.example/feed.xml"), None);
        assert_eq!(store.next_location("  "), None);
    }
}
