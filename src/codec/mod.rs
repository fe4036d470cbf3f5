//! Item codec: converts between wire records and typed entities.
//!
//! - `xml`: untyped document reading/writing
//! - [`ItemCodec`]: `item` records to [`Post`]/[`Source`] and back
//! - [`decode_document`] / [`encode_document`]: whole documents

pub mod xml;

use chrono::{DateTime, FixedOffset};

use crate::error::{AppError, Result};
use crate::models::{
    Channel, Document, FeedConfig, Kind, KindTag, ListRef, ParsedDocument, Post, Rejected,
    ReplyFields, RepostFields, Source,
};

pub use xml::{RawDocument, RawElement, RawItem};

/// Date format written into documents.
pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// Month-before-day variant found in older documents.
const LEGACY_DATE_FORMAT: &str = "%a, %b %d %Y %H:%M:%S %z";

const REPLY_FIELDS: [&str; 3] = [
    "in_reply_to_status_id",
    "in_reply_to_user_id",
    "in_reply_to_user_link",
];

const REPOST_FIELDS: [&str; 4] = [
    "reposted_status_id",
    "reposted_status_pubdate",
    "reposted_status_user_id",
    "reposted_status_user_link",
];

/// Parse an RFC-822 style timestamp with zone offset.
pub fn parse_date(value: &str) -> Result<DateTime<FixedOffset>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_str(value, LEGACY_DATE_FORMAT))
        .map_err(|e| AppError::validation(format!("unparsable date '{value}': {e}")))
}

pub fn format_date(date: &DateTime<FixedOffset>) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Converts `item` records to posts and sources and back.
#[derive(Debug, Clone)]
pub struct ItemCodec {
    max_description_length: usize,
    default_language: String,
}

impl Default for ItemCodec {
    fn default() -> Self {
        Self::from_config(&FeedConfig::default())
    }
}

impl ItemCodec {
    pub fn new(max_description_length: usize, default_language: impl Into<String>) -> Self {
        Self {
            max_description_length,
            default_language: default_language.into(),
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(config.max_description_length, &config.default_language)
    }

    pub fn max_description_length(&self) -> usize {
        self.max_description_length
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    /// Parse a post, inferring its kind from the fields present.
    pub fn parse_post(&self, raw: &RawItem) -> Result<Post> {
        self.parse_post_as(raw, None)
    }

    /// Parse a post, optionally insisting on a kind.
    ///
    /// All four repost fields make a repost; otherwise all three reply
    /// fields make a reply. A partial set of either is rejected rather
    /// than downgraded to a plain status.
    pub fn parse_post_as(&self, raw: &RawItem, expected: Option<KindTag>) -> Result<Post> {
        let guid = required(raw, "guid")?;
        let pubdate = raw
            .get("pubdate")
            .or_else(|| raw.get("pubDate"))
            .ok_or_else(|| AppError::validation(format!("post {guid} has no pubdate")))?;
        let pubdate = parse_date(pubdate)?;
        let description = required(raw, "description")?;

        let kind = infer_kind(raw)?;
        if let Some(expected) = expected {
            if kind.tag() != expected {
                return Err(AppError::validation(format!(
                    "post {guid} was expected to be {expected:?} but is {:?}",
                    kind.tag()
                )));
            }
        }

        Ok(Post {
            guid,
            pubdate,
            description,
            language: raw.get("language").map(str::to_string),
            kind,
            reply_url: raw.get("reply_url").map(str::to_string),
        })
    }

    /// Serialize a post. Posts that are not standard are refused.
    pub fn serialize_post(&self, post: &Post) -> Result<RawItem> {
        post.validate(self.max_description_length)?;

        let language = post
            .language
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(&self.default_language);

        let mut raw = RawItem::new()
            .with("guid", &post.guid)
            .with("pubdate", format_date(&post.pubdate))
            .with("description", &post.description)
            .with("language", language);

        match &post.kind {
            Kind::Status => {}
            Kind::Reply(reply) => {
                raw.push("in_reply_to_status_id", &reply.in_reply_to_status_id);
                raw.push("in_reply_to_user_id", &reply.in_reply_to_user_id);
                raw.push("in_reply_to_user_link", &reply.in_reply_to_user_link);
            }
            Kind::Repost(repost) => {
                raw.push("reposted_status_id", &repost.reposted_status_id);
                raw.push(
                    "reposted_status_pubdate",
                    format_date(&repost.reposted_status_pubdate),
                );
                raw.push("reposted_status_user_id", &repost.reposted_status_user_id);
                raw.push("reposted_status_user_link", &repost.reposted_status_user_link);
            }
        }

        if let Some(reply_url) = &post.reply_url {
            raw.push("reply_url", reply_url);
        }
        Ok(raw)
    }

    /// Whether the record would parse into a standard post.
    pub fn is_standard(&self, raw: &RawItem) -> bool {
        self.parse_post(raw)
            .and_then(|post| post.validate(self.max_description_length))
            .is_ok()
    }

    pub fn parse_source(&self, raw: &RawItem) -> Result<Source> {
        Ok(Source {
            user_id: required(raw, "user_id")?,
            user_name: required(raw, "user_name")?,
            user_link: required(raw, "user_link")?,
        })
    }

    pub fn serialize_source(&self, source: &Source) -> Result<RawItem> {
        for (field, value) in [
            ("user_id", &source.user_id),
            ("user_name", &source.user_name),
            ("user_link", &source.user_link),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::validation(format!(
                    "source is missing required field {field}"
                )));
            }
            if value.trim() != value.as_str() {
                return Err(AppError::validation(format!(
                    "source field {field} has leading or trailing whitespace"
                )));
            }
        }

        Ok(RawItem::new()
            .with("user_id", &source.user_id)
            .with("user_name", &source.user_name)
            .with("user_link", &source.user_link))
    }
}

fn required(raw: &RawItem, field: &str) -> Result<String> {
    raw.get(field)
        .map(str::to_string)
        .ok_or_else(|| AppError::validation(format!("missing required field {field}")))
}

fn infer_kind(raw: &RawItem) -> Result<Kind> {
    let repost_present = REPOST_FIELDS.iter().filter(|f| raw.has(f)).count();
    if repost_present == REPOST_FIELDS.len() {
        return Ok(Kind::Repost(RepostFields {
            reposted_status_id: required(raw, "reposted_status_id")?,
            reposted_status_pubdate: parse_date(&required(raw, "reposted_status_pubdate")?)?,
            reposted_status_user_id: required(raw, "reposted_status_user_id")?,
            reposted_status_user_link: required(raw, "reposted_status_user_link")?,
        }));
    }
    if repost_present > 0 {
        return Err(partial("repost", &REPOST_FIELDS, raw));
    }

    let reply_present = REPLY_FIELDS.iter().filter(|f| raw.has(f)).count();
    if reply_present == REPLY_FIELDS.len() {
        return Ok(Kind::Reply(ReplyFields {
            in_reply_to_status_id: required(raw, "in_reply_to_status_id")?,
            in_reply_to_user_id: required(raw, "in_reply_to_user_id")?,
            in_reply_to_user_link: required(raw, "in_reply_to_user_link")?,
        }));
    }
    if reply_present > 0 {
        return Err(partial("reply", &REPLY_FIELDS, raw));
    }

    Ok(Kind::Status)
}

fn partial(kind: &str, fields: &[&str], raw: &RawItem) -> AppError {
    let missing: Vec<&str> = fields.iter().copied().filter(|f| !raw.has(f)).collect();
    AppError::validation(format!("incomplete {kind}: missing {}", missing.join(", ")))
}

/// A record type that can live in a feed document.
pub trait Record: Clone + Send + Sync + 'static {
    fn decode(codec: &ItemCodec, raw: &RawItem) -> Result<Self>;
    fn encode(&self, codec: &ItemCodec) -> Result<RawItem>;
}

impl Record for Post {
    fn decode(codec: &ItemCodec, raw: &RawItem) -> Result<Self> {
        codec.parse_post(raw)
    }

    fn encode(&self, codec: &ItemCodec) -> Result<RawItem> {
        codec.serialize_post(self)
    }
}

impl Record for Source {
    fn decode(codec: &ItemCodec, raw: &RawItem) -> Result<Self> {
        codec.parse_source(raw)
    }

    fn encode(&self, codec: &ItemCodec) -> Result<RawItem> {
        codec.serialize_source(self)
    }
}

/// Parse a whole document. Items that fail to decode are skipped and
/// reported in [`ParsedDocument::rejected`].
pub fn decode_document<T: Record>(codec: &ItemCodec, bytes: &[u8]) -> Result<ParsedDocument<T>> {
    let raw = xml::read_raw(bytes)?;
    let channel = decode_channel(&raw.channel);

    let mut items = Vec::with_capacity(raw.items.len());
    let mut rejected = Vec::new();
    for (index, record) in raw.items.iter().enumerate() {
        match T::decode(codec, record) {
            Ok(item) => items.push(item),
            Err(e) => rejected.push(Rejected {
                index,
                reason: e.to_string(),
            }),
        }
    }

    Ok(ParsedDocument {
        document: Document { channel, items },
        rejected,
    })
}

/// Serialize a whole document. Fails if any item is not standard.
pub fn encode_document<T: Record>(codec: &ItemCodec, document: &Document<T>) -> Result<Vec<u8>> {
    let items = document
        .items
        .iter()
        .map(|item| item.encode(codec))
        .collect::<Result<Vec<_>>>()?;

    xml::write_raw(&RawDocument {
        channel: encode_channel(&document.channel),
        items,
    })
}

fn decode_channel(elements: &[RawElement]) -> Channel {
    let mut channel = Channel::default();
    for element in elements {
        let text = Some(element.text.clone()).filter(|t| !t.is_empty());
        match element.name.as_str() {
            "username" => channel.username = text,
            "user_id" => channel.user_id = text,
            "user_full_name" => channel.user_full_name = text,
            "description" => channel.description = text,
            "link" => channel.link = text,
            "language" => channel.language = text,
            "lastBuildDate" => {
                channel.last_build_date = text.as_deref().and_then(|t| match parse_date(t) {
                    Ok(date) => Some(date),
                    Err(e) => {
                        log::debug!("Ignoring lastBuildDate: {}", e);
                        None
                    }
                })
            }
            "next_node" => channel.next_node = text,
            "blocks" => channel.blocks = decode_list_ref(element),
            "follows" => channel.follows = decode_list_ref(element),
            "docs" => channel.docs = text,
            "relocate" => channel.relocate = text,
            _ => {}
        }
    }
    channel
}

fn decode_list_ref(element: &RawElement) -> Option<ListRef> {
    let count = element.attr("count").and_then(|c| c.trim().parse().ok());
    if element.text.is_empty() && count.is_none() {
        return None;
    }
    Some(ListRef {
        url: element.text.clone(),
        count: count.unwrap_or(0),
    })
}

fn encode_channel(channel: &Channel) -> Vec<RawElement> {
    let mut elements = Vec::new();
    let mut scalar = |name: &str, value: &Option<String>| {
        if let Some(value) = value {
            elements.push(RawElement::new(name, value.as_str()));
        }
    };

    scalar("username", &channel.username);
    scalar("user_id", &channel.user_id);
    scalar("user_full_name", &channel.user_full_name);
    scalar("description", &channel.description);
    scalar("link", &channel.link);
    scalar("language", &channel.language);
    scalar("lastBuildDate", &channel.last_build_date.as_ref().map(format_date));
    scalar("next_node", &channel.next_node);
    scalar("docs", &channel.docs);
    scalar("relocate", &channel.relocate);

    for (name, list) in [("blocks", &channel.blocks), ("follows", &channel.follows)] {
        if let Some(list) = list {
            elements.push(
                RawElement::new(name, list.url.as_str()).with_attr("count", list.count.to_string()),
            );
        }
    }
    elements
}
