//! Raw XML reading and writing for feed documents.
//!
//! Works on untyped element/field lists; the typed mapping lives in the
//! parent module.

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::error::{AppError, Result};

/// A scalar element directly under `channel`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
}

impl RawElement {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            text: text.into(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// An `item` record as an ordered list of named fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawItem {
    fields: Vec<(String, String)>,
}

impl RawItem {
    pub fn new() -> Self {
        Self::default()
    }

    /// First non-blank value of the named field.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// An untyped feed document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDocument {
    pub channel: Vec<RawElement>,
    pub items: Vec<RawItem>,
}

enum Step {
    Open(String, Vec<(String, String)>, bool),
    Text(String),
    Close,
    Skip,
}

/// Where the reader currently collects text.
enum Target {
    Scalar(RawElement),
    Field(String),
}

/// Parse a document.
///
/// The first `channel` element is the root. Its scalar children become
/// [`RawElement`]s; every `item` below it (optionally wrapped in `items`)
/// becomes a [`RawItem`]. Anything nested deeper than an item's fields is
/// ignored.
pub fn read_raw(bytes: &[u8]) -> Result<RawDocument> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut doc = RawDocument::default();
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut channel_depth: Option<usize> = None;
    let mut channel_closed = false;
    let mut item: Option<(usize, RawItem)> = None;
    let mut target: Option<(usize, Target)> = None;
    let mut text = String::new();

    loop {
        let step = match reader.read_event_into(&mut buf)? {
            Event::Start(e) => Step::Open(local_name(&e), read_attrs(&e)?, false),
            Event::Empty(e) => Step::Open(local_name(&e), read_attrs(&e)?, true),
            Event::Text(e) => Step::Text(e.unescape()?.into_owned()),
            Event::CData(e) => Step::Text(String::from_utf8_lossy(&e.into_inner()).into_owned()),
            Event::End(_) => Step::Close,
            Event::Eof => break,
            _ => Step::Skip,
        };
        buf.clear();

        let (name, attrs, closes_now) = match step {
            Step::Open(name, attrs, closes_now) => (name, attrs, closes_now),
            Step::Text(chunk) => {
                if target.as_ref().is_some_and(|(d, _)| *d == depth) {
                    text.push_str(&chunk);
                }
                continue;
            }
            Step::Close => {
                close(depth, &mut doc, &mut item, &mut target, &mut text);
                if channel_depth == Some(depth) {
                    channel_closed = true;
                    channel_depth = None;
                }
                depth = depth.saturating_sub(1);
                continue;
            }
            Step::Skip => continue,
        };

        depth += 1;
        match channel_depth {
            None if name == "channel" && !channel_closed => channel_depth = Some(depth),
            Some(cd) => {
                if let Some((item_depth, _)) = &item {
                    if depth == item_depth + 1 {
                        text.clear();
                        target = Some((depth, Target::Field(name)));
                    }
                } else if name == "item" {
                    item = Some((depth, RawItem::new()));
                } else if depth == cd + 1 && name != "items" {
                    text.clear();
                    let element = RawElement {
                        name,
                        attrs,
                        text: String::new(),
                    };
                    target = Some((depth, Target::Scalar(element)));
                }
            }
            None => {}
        }

        if closes_now {
            close(depth, &mut doc, &mut item, &mut target, &mut text);
            if channel_depth == Some(depth) {
                channel_closed = true;
                channel_depth = None;
            }
            depth -= 1;
        }
    }

    if channel_depth.is_some() {
        return Err(AppError::validation("channel element is not terminated"));
    }
    if !channel_closed {
        return Err(AppError::validation("document has no channel element"));
    }
    Ok(doc)
}

fn close(
    depth: usize,
    doc: &mut RawDocument,
    item: &mut Option<(usize, RawItem)>,
    target: &mut Option<(usize, Target)>,
    text: &mut String,
) {
    if target.as_ref().is_some_and(|(d, _)| *d == depth) {
        let value = std::mem::take(text).trim().to_string();
        match target.take() {
            Some((_, Target::Field(name))) => {
                if let Some((_, record)) = item.as_mut() {
                    record.push(name, value);
                }
            }
            Some((_, Target::Scalar(mut element))) => {
                element.text = value;
                doc.channel.push(element);
            }
            None => {}
        }
    } else if item.as_ref().is_some_and(|(d, _)| *d == depth) {
        if let Some((_, record)) = item.take() {
            doc.items.push(record);
        }
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn read_attrs(e: &BytesStart<'_>) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        attrs.push((key, attr.unescape_value()?.into_owned()));
    }
    Ok(attrs)
}

/// Serialize a document with two-space indentation.
pub fn write_raw(doc: &RawDocument) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("channel")))?;

    for element in &doc.channel {
        write_element(&mut writer, &element.name, &element.attrs, &element.text)?;
    }
    for item in &doc.items {
        writer.write_event(Event::Start(BytesStart::new("item")))?;
        for (name, value) in item.fields() {
            write_element(&mut writer, name, &[], value)?;
        }
        writer.write_event(Event::End(BytesEnd::new("item")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("channel")))?;
    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

fn write_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    attrs: &[(String, String)],
    text: &str,
) -> Result<()> {
    let mut start = BytesStart::new(name);
    for (key, value) in attrs {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if text.is_empty() {
        writer.write_event(Event::Empty(start))?;
    } else {
        writer.write_event(Event::Start(start))?;
        writer.write_event(Event::Text(BytesText::new(text)))?;
        writer.write_event(Event::End(BytesEnd::new(name)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_channel_and_items() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
        <channel>
          <username>brian</username>
          <description><![CDATA[Writes <b>things</b>]]></description>
          <follows count="2">https://b.example/follows.xml</follows>
          <next_node/>
          <item>
            <guid>1</guid>
            <description>fish &amp; chips</description>
            <unknown><nested>ignored</nested></unknown>
          </item>
          <items>
            <item><guid>2</guid></item>
          </items>
        </channel>"#;

        let doc = read_raw(xml.as_bytes()).unwrap();

        assert_eq!(doc.channel[0], RawElement::new("username", "brian"));
        assert_eq!(doc.channel[1].text, "Writes <b>things</b>");
        assert_eq!(doc.channel[2].attr("count"), Some("2"));
        assert_eq!(doc.channel[3], RawElement::new("next_node", ""));
        assert_eq!(doc.items.len(), 2);
        assert_eq!(doc.items[0].get("description"), Some("fish & chips"));
        assert_eq!(doc.items[0].get("unknown"), None);
        assert_eq!(doc.items[1].get("guid"), Some("2"));
    }

    #[test]
    fn test_channel_may_be_nested_in_rss() {
        let xml = "<rss><channel><username>a</username></channel></rss>";
        let doc = read_raw(xml.as_bytes()).unwrap();
        assert_eq!(doc.channel.len(), 1);
    }

    #[test]
    fn test_missing_channel_is_rejected() {
        assert!(read_raw(b"<feed><item><guid>1</guid></item></feed>").is_err());
    }

    #[test]
    fn test_malformed_xml_is_rejected() {
        assert!(read_raw(b"<channel><item><guid>1</item></channel>").is_err());
    }

    #[test]
    fn test_written_document_reads_back() {
        let doc = RawDocument {
            channel: vec![
                RawElement::new("username", "a <b>"),
                RawElement::new("blocks", "").with_attr("count", "0"),
            ],
            items: vec![RawItem::new().with("guid", "x").with("description", "1 < 2 & 3")],
        };

        let bytes = write_raw(&doc).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("<?xml"));
        assert!(text.contains(r#"<blocks count="0"/>"#));

        assert_eq!(read_raw(&bytes).unwrap(), doc);
    }
}
