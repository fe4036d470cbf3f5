//! Feed document structures.
//!
//! A document is channel metadata plus an ordered list of records,
//! newest first. Archived segments hang off `next_node`:
//!
//! ```text
//! feed.xml ──next_node──▶ feed-20260101120000000000.xml ──next_node──▶ ...
//! ```

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Link to a follows/blocks list plus its entry count.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListRef {
    pub url: String,
    pub count: usize,
}

/// Channel-level metadata of a feed document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub username: Option<String>,
    pub user_id: Option<String>,
    pub user_full_name: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub language: Option<String>,
    pub last_build_date: Option<DateTime<FixedOffset>>,
    /// Older archive segment, if any
    pub next_node: Option<String>,
    pub blocks: Option<ListRef>,
    pub follows: Option<ListRef>,
    pub docs: Option<String>,
    /// Set when the owner moved their feed elsewhere
    pub relocate: Option<String>,
}

/// A named, ordered collection of records plus channel metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document<T> {
    pub channel: Channel,
    pub items: Vec<T>,
}

impl<T> Default for Document<T> {
    fn default() -> Self {
        Self::new(Channel::default())
    }
}

impl<T> Document<T> {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            items: Vec::new(),
        }
    }

    pub fn next_node(&self) -> Option<&str> {
        self.channel
            .next_node
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// An item record that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    /// Position among the document's items
    pub index: usize,
    pub reason: String,
}

/// Result of reading a document: the valid records plus what was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDocument<T> {
    pub document: Document<T>,
    pub rejected: Vec<Rejected>,
}

impl<T> ParsedDocument<T> {
    pub fn into_document(self) -> Document<T> {
        self.document
    }
}
