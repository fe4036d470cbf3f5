//! Post (status) data structure.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{AppError, Result};

/// A single status published in a feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Post {
    /// Opaque identifier, unique within the author's feed
    pub guid: String,

    /// Publication time; primary sort key
    pub pubdate: DateTime<FixedOffset>,

    /// Free text body
    pub description: String,

    /// ISO language code, if the feed carried one
    #[serde(default)]
    pub language: Option<String>,

    /// Plain status, reply or repost
    pub kind: Kind,

    /// Where replies to this post can be submitted
    #[serde(default)]
    pub reply_url: Option<String>,
}

/// Post subtype, decided once from the fields present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Kind {
    Status,
    Reply(ReplyFields),
    Repost(RepostFields),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyFields {
    pub in_reply_to_status_id: String,
    pub in_reply_to_user_id: String,
    pub in_reply_to_user_link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepostFields {
    pub reposted_status_id: String,
    pub reposted_status_pubdate: DateTime<FixedOffset>,
    pub reposted_status_user_id: String,
    pub reposted_status_user_link: String,
}

/// Fieldless mirror of [`Kind`], for callers that name a subtype up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindTag {
    Status,
    Reply,
    Repost,
}

impl Kind {
    pub fn tag(&self) -> KindTag {
        match self {
            Kind::Status => KindTag::Status,
            Kind::Reply(_) => KindTag::Reply,
            Kind::Repost(_) => KindTag::Repost,
        }
    }
}

impl Post {
    /// Mint a new post authored by the feed at `author_link`.
    ///
    /// The guid is derived from the author, timestamp and text, so two
    /// authors never share one. Surrounding whitespace is dropped from the
    /// text, as documents do not keep it.
    pub fn compose(
        author_link: &str,
        pubdate: DateTime<FixedOffset>,
        description: impl Into<String>,
        kind: Kind,
    ) -> Self {
        let description = description.into().trim().to_string();
        Self {
            guid: mint_guid(author_link, &pubdate, &description),
            pubdate,
            description,
            language: None,
            kind,
            reply_url: None,
        }
    }

    /// Check required fields for this post's kind.
    ///
    /// A post that fails here is not standard and must not be written.
    /// Text fields may not carry surrounding whitespace, which would be
    /// lost on the way through a document.
    pub fn validate(&self, max_description_length: usize) -> Result<()> {
        require("guid", &self.guid)?;
        require("description", &self.description)?;
        for (field, value) in [("language", &self.language), ("reply_url", &self.reply_url)] {
            if let Some(value) = value {
                trimmed(field, value)?;
            }
        }

        let length = self.description.graphemes(true).count();
        if length > max_description_length {
            return Err(AppError::validation(format!(
                "description of {} is {length} characters, limit is {max_description_length}",
                self.guid
            )));
        }

        match &self.kind {
            Kind::Status => {}
            Kind::Reply(reply) => {
                require("in_reply_to_status_id", &reply.in_reply_to_status_id)?;
                require("in_reply_to_user_id", &reply.in_reply_to_user_id)?;
                require("in_reply_to_user_link", &reply.in_reply_to_user_link)?;
            }
            Kind::Repost(repost) => {
                require("reposted_status_id", &repost.reposted_status_id)?;
                require("reposted_status_user_id", &repost.reposted_status_user_id)?;
                require("reposted_status_user_link", &repost.reposted_status_user_link)?;
            }
        }
        Ok(())
    }

    pub fn is_standard(&self, max_description_length: usize) -> bool {
        self.validate(max_description_length).is_ok()
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, Kind::Reply(_))
    }

    pub fn is_repost(&self) -> bool {
        matches!(self.kind, Kind::Repost(_))
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::validation(format!("missing required field {field}")));
    }
    trimmed(field, value)
}

fn trimmed(field: &str, value: &str) -> Result<()> {
    if value.trim() != value {
        return Err(AppError::validation(format!(
            "field {field} has leading or trailing whitespace"
        )));
    }
    Ok(())
}

fn mint_guid(author_link: &str, pubdate: &DateTime<FixedOffset>, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(author_link.as_bytes());
    hasher.update(pubdate.to_rfc3339().as_bytes());
    hasher.update(description.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
