// src/services/timeline.rs

//! Timeline merge engine.
//!
//! A timeline is kept newest first by `pubdate`. Posts with equal
//! timestamps keep the order they were merged in, so repeated merges of
//! the same data never shuffle them.

use std::collections::HashSet;

use crate::error::{AppError, Result};
use crate::models::Post;

/// Merge `new_posts` into `existing` and keep the `cap` newest.
///
/// Each new post goes immediately before the first entry strictly older
/// than it, or at the end if there is none. Posts whose guid is already
/// present are skipped.
pub fn merge(
    mut existing: Vec<Post>,
    new_posts: impl IntoIterator<Item = Post>,
    cap: usize,
) -> Vec<Post> {
    let mut seen: HashSet<String> = existing.iter().map(|p| p.guid.clone()).collect();

    for post in new_posts {
        if !seen.insert(post.guid.clone()) {
            continue;
        }
        let index = existing
            .iter()
            .position(|p| p.pubdate < post.pubdate)
            .unwrap_or(existing.len());
        existing.insert(index, post);
    }

    existing.truncate(cap);
    existing
}

/// Ordered, capped view of posts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    posts: Vec<Post>,
    cap: usize,
}

impl Timeline {
    pub fn new(cap: usize) -> Self {
        Self {
            posts: Vec::new(),
            cap,
        }
    }

    /// Build from posts in any order.
    pub fn from_posts(posts: impl IntoIterator<Item = Post>, cap: usize) -> Self {
        let mut timeline = Self::new(cap);
        timeline.merge(posts);
        timeline
    }

    pub fn insert(&mut self, post: Post) {
        self.merge(std::iter::once(post));
    }

    pub fn merge(&mut self, posts: impl IntoIterator<Item = Post>) {
        let existing = std::mem::take(&mut self.posts);
        self.posts = merge(existing, posts, self.cap);
    }

    /// Keep only the posts for which `keep` holds.
    pub fn retain(&mut self, keep: impl FnMut(&Post) -> bool) {
        self.posts.retain(keep);
    }

    /// Posts around `start_guid`.
    ///
    /// `n == 0` returns the post itself, `n > 0` up to `n` newer posts and
    /// `n < 0` up to `|n|` older posts, all newest first. Counts past
    /// either end are clamped.
    pub fn fetch(&self, start_guid: &str, n: i64) -> Result<Vec<Post>> {
        let index = self
            .posts
            .iter()
            .position(|p| p.guid == start_guid)
            .ok_or_else(|| AppError::not_found(format!("post {start_guid} in timeline")))?;

        let span = usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX);
        let range = match n {
            0 => index..index + 1,
            n if n > 0 => index.saturating_sub(span)..index,
            _ => {
                let start = index + 1;
                start..start.saturating_add(span).min(self.posts.len())
            }
        };
        Ok(self.posts[range].to_vec())
    }

    /// The `n` newest posts.
    pub fn fetch_top(&self, n: i64) -> Result<Vec<Post>> {
        let n = usize::try_from(n)
            .map_err(|_| AppError::invalid_input(format!("cannot fetch {n} posts")))?;
        Ok(self.posts.iter().take(n).cloned().collect())
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn into_posts(self) -> Vec<Post> {
        self.posts
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Kind;
    use chrono::{DateTime, Duration};

    fn at(minutes: i64) -> Post {
        let base = DateTime::parse_from_rfc2822("Mon, 01 Jun 2026 10:00:00 +0000").unwrap();
        Post::compose(
            "https://a.example/feed.xml",
            base + Duration::minutes(minutes),
            format!("10:{minutes:02}"),
            Kind::Status,
        )
    }

    fn labels(posts: &[Post]) -> Vec<&str> {
        posts.iter().map(|p| p.description.as_str()).collect()
    }

    #[test]
    fn test_merge_inserts_between_by_pubdate() {
        let timeline = Timeline::from_posts(vec![at(10), at(5), at(0)], 100);
        let merged = merge(timeline.into_posts(), vec![at(7)], 100);
        assert_eq!(labels(&merged), vec!["10:10", "10:07", "10:05", "10:00"]);
    }

    #[test]
    fn test_newest_goes_first_and_oldest_last() {
        let mut timeline = Timeline::from_posts(vec![at(5)], 100);
        timeline.insert(at(9));
        timeline.insert(at(1));
        assert_eq!(labels(timeline.posts()), vec!["10:09", "10:05", "10:01"]);
    }

    #[test]
    fn test_equal_pubdates_keep_merge_order() {
        let base = at(0).pubdate;
        let first = Post::compose("https://a.example/feed.xml", base, "first", Kind::Status);
        let second = Post::compose("https://b.example/feed.xml", base, "second", Kind::Status);

        let mut timeline = Timeline::new(10);
        timeline.insert(first.clone());
        timeline.insert(second.clone());
        timeline.merge(vec![first, second]);

        assert_eq!(labels(timeline.posts()), vec!["first", "second"]);
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let mut timeline = Timeline::new(3);
        for minutes in [4, 0, 8, 2, 6, 1] {
            timeline.insert(at(minutes));
            assert!(timeline.len() <= 3);
        }
        assert_eq!(labels(timeline.posts()), vec!["10:08", "10:06", "10:04"]);
    }

    #[test]
    fn test_duplicates_are_skipped() {
        let mut timeline = Timeline::new(10);
        timeline.merge(vec![at(1), at(2)]);
        timeline.merge(vec![at(2), at(3)]);
        assert_eq!(timeline.len(), 3);
    }

    #[test]
    fn test_fetch_around_guid() {
        let timeline = Timeline::from_posts((0..10).map(at), 100);
        let middle = at(5).guid;

        assert_eq!(labels(&timeline.fetch(&middle, 0).unwrap()), vec!["10:05"]);
        assert_eq!(
            labels(&timeline.fetch(&middle, 3).unwrap()),
            vec!["10:08", "10:07", "10:06"]
        );
        assert_eq!(
            labels(&timeline.fetch(&middle, -3).unwrap()),
            vec!["10:04", "10:03", "10:02"]
        );
    }

    #[test]
    fn test_fetch_clamps_out_of_range() {
        let timeline = Timeline::from_posts((0..4).map(at), 100);

        assert_eq!(timeline.fetch(&at(2).guid, 50).unwrap().len(), 1);
        assert_eq!(timeline.fetch(&at(2).guid, -50).unwrap().len(), 2);
        assert!(timeline.fetch(&at(3).guid, 5).unwrap().is_empty());
        assert!(timeline.fetch(&at(0).guid, i64::MIN).unwrap().is_empty());
    }

    #[test]
    fn test_fetch_unknown_guid_is_not_found() {
        let timeline = Timeline::from_posts(vec![at(0)], 10);
        assert!(timeline.fetch("missing", 0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_fetch_top() {
        let timeline = Timeline::from_posts((0..5).map(at), 100);

        assert_eq!(labels(&timeline.fetch_top(2).unwrap()), vec!["10:04", "10:03"]);
        assert_eq!(timeline.fetch_top(99).unwrap().len(), 5);
        assert!(matches!(
            timeline.fetch_top(-1),
            Err(AppError::InvalidInput(_))
        ));
    }
}
