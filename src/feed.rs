//! Atom Activity Streams feed adapter.
//!
//! The hub and salmon endpoint treat feeds as opaque payloads; this module
//! models just enough of the format to parse them, serialize them back,
//! locate the `self` link a feed is published under and derive an author's
//! account URI. Unknown markup is skipped, not preserved.

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use std::fmt::Write as _;
use std::io;
use thiserror::Error;

use crate::hub;

/// Media type of serialized feeds and entries.
pub const MEDIA_TYPE: &str = "application/atom+xml";

const ATOM_NAMESPACE: &str = "http://www.w3.org/2005/Atom";
const ACTIVITY_NAMESPACE: &str = "http://activitystrea.ms/spec/1.0/";
const THREAD_NAMESPACE: &str = "http://purl.org/syndication/thread/1.0";

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed feed: {0}")]
    Xml(String),

    #[error("missing {0} element")]
    MissingElement(&'static str),
}

/// An activity stream feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feed {
    pub id: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub updated: Option<String>,
    pub logo: Option<String>,
    pub author: Option<Person>,
    pub links: Vec<Link>,
    pub entries: Vec<Entry>,
}

/// A feed item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub id: String,
    pub title: String,
    pub links: Vec<Link>,
    pub published: Option<String>,
    pub updated: Option<String>,
    pub author: Option<Person>,
    pub summary: Option<Text>,
    pub content: Option<Text>,
    pub object_type: Option<String>,
    pub verb: Option<String>,
    pub in_reply_to: Option<InReplyTo>,
}

/// A relationship between a feed, entry or person and a URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Link {
    pub rel: String,
    pub media_type: Option<String>,
    pub href: String,
}

/// A person, typically an author.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Person {
    pub id: Option<String>,
    pub uri: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub object_type: Option<String>,
}

/// A typed text construct (summary, content).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Text {
    pub media_type: Option<String>,
    pub body: String,
}

/// Marks an entry as a response to another resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InReplyTo {
    pub reference: String,
    pub href: Option<String>,
}

impl Feed {
    /// Parses a feed document (root `<feed>`).
    pub fn from_xml(input: &str) -> Result<Self, Error> {
        let mut reader = Reader::from_str(input);
        loop {
            match read_event(&mut reader)? {
                XmlEvent::Start(start) if start.local_name().as_ref() == b"feed" => {
                    return read_feed(&mut reader);
                }
                XmlEvent::Eof => return Err(Error::MissingElement("feed")),
                _ => {}
            }
        }
    }

    /// Serializes the feed with an XML declaration.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = write!(
            out,
            "<feed xmlns=\"{ATOM_NAMESPACE}\" xmlns:activity=\"{ACTIVITY_NAMESPACE}\" xmlns:thr=\"{THREAD_NAMESPACE}\">"
        );
        write_element(&mut out, "id", &self.id);
        write_element(&mut out, "title", &self.title);
        if let Some(subtitle) = &self.subtitle {
            write_element(&mut out, "subtitle", subtitle);
        }
        if let Some(updated) = &self.updated {
            write_element(&mut out, "updated", updated);
        }
        if let Some(logo) = &self.logo {
            write_element(&mut out, "logo", logo);
        }
        if let Some(author) = &self.author {
            write_person(&mut out, author);
        }
        for link in &self.links {
            write_link(&mut out, link);
        }
        for entry in &self.entries {
            out.push_str("<entry>");
            write_entry_body(&mut out, entry);
            out.push_str("</entry>");
        }
        out.push_str("</feed>");
        out
    }

    /// Returns the link the feed is published under, if any.
    pub fn self_link(&self) -> Option<&Link> {
        self.links.iter().find(|link| link.rel == "self")
    }
}

impl Entry {
    /// Parses a standalone entry document (root `<entry>`), as carried in
    /// salmon envelopes.
    pub fn from_xml(input: &str) -> Result<Self, Error> {
        let mut reader = Reader::from_str(input);
        loop {
            match read_event(&mut reader)? {
                XmlEvent::Start(start) if start.local_name().as_ref() == b"entry" => {
                    return read_entry(&mut reader);
                }
                XmlEvent::Eof => return Err(Error::MissingElement("entry")),
                _ => {}
            }
        }
    }

    /// Serializes a standalone entry document with an XML declaration.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = write!(
            out,
            "<entry xmlns=\"{ATOM_NAMESPACE}\" xmlns:activity=\"{ACTIVITY_NAMESPACE}\" xmlns:thr=\"{THREAD_NAMESPACE}\">"
        );
        write_entry_body(&mut out, self);
        out.push_str("</entry>");
        out
    }
}

impl Person {
    /// Returns the account URI used to look the person up over discovery.
    ///
    /// A bare `user@host` is given the `acct:` scheme; anything that already
    /// carries a scheme is returned as-is.
    pub fn account_uri(&self) -> Option<String> {
        let raw = self
            .uri
            .as_deref()
            .filter(|value| !value.is_empty())
            .or_else(|| self.email.as_deref().filter(|value| !value.is_empty()))?;
        if raw.contains('@') && !raw.contains(':') {
            Some(format!("acct:{raw}"))
        } else {
            Some(raw.to_string())
        }
    }
}

/// Feeds are what the hub distributes: the topic is the `self` link and the
/// notification body is the Atom serialization.
impl hub::Event for Feed {
    fn media_type(&self) -> String {
        MEDIA_TYPE.to_string()
    }

    fn topic(&self) -> String {
        self.self_link().map(|link| link.href.clone()).unwrap_or_default()
    }

    fn write_to(&self, writer: &mut dyn io::Write) -> io::Result<()> {
        writer.write_all(self.to_xml().as_bytes())
    }
}

fn read_event<'a>(reader: &mut Reader<&'a [u8]>) -> Result<XmlEvent<'a>, Error> {
    reader.read_event().map_err(|e| Error::Xml(e.to_string()))
}

/// Collects the character data of the element whose start tag was just read,
/// consuming everything up to (and including) the matching end tag.
fn read_text(reader: &mut Reader<&[u8]>) -> Result<String, Error> {
    let mut depth = 0usize;
    let mut text = String::new();
    loop {
        match read_event(reader)? {
            XmlEvent::Start(_) => depth += 1,
            XmlEvent::End(_) => {
                if depth == 0 {
                    return Ok(text);
                }
                depth -= 1;
            }
            XmlEvent::Text(chunk) => {
                if depth == 0 {
                    text.push_str(&chunk.unescape().map_err(|e| Error::Xml(e.to_string()))?);
                }
            }
            XmlEvent::CData(chunk) => {
                if depth == 0 {
                    text.push_str(
                        std::str::from_utf8(&chunk.into_inner())
                            .map_err(|e| Error::Xml(e.to_string()))?,
                    );
                }
            }
            XmlEvent::Eof => return Err(Error::Xml("unexpected end of document".to_string())),
            _ => {}
        }
    }
}

fn skip_element(reader: &mut Reader<&[u8]>) -> Result<(), Error> {
    read_text(reader).map(|_| ())
}

fn attribute(start: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, Error> {
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| Error::Xml(e.to_string()))?;
        if attribute.key.local_name().as_ref() == name {
            return Ok(Some(
                attribute
                    .unescape_value()
                    .map_err(|e| Error::Xml(e.to_string()))?
                    .into_owned(),
            ));
        }
    }
    Ok(None)
}

fn read_link(start: &BytesStart<'_>) -> Result<Link, Error> {
    Ok(Link {
        rel: attribute(start, b"rel")?.unwrap_or_default(),
        media_type: attribute(start, b"type")?,
        href: attribute(start, b"href")?.unwrap_or_default(),
    })
}

fn read_in_reply_to(start: &BytesStart<'_>) -> Result<InReplyTo, Error> {
    Ok(InReplyTo {
        reference: attribute(start, b"ref")?.unwrap_or_default(),
        href: attribute(start, b"href")?,
    })
}

fn read_feed(reader: &mut Reader<&[u8]>) -> Result<Feed, Error> {
    let mut feed = Feed::default();
    loop {
        match read_event(reader)? {
            XmlEvent::Start(start) => match start.local_name().as_ref() {
                b"id" => feed.id = read_text(reader)?,
                b"title" => feed.title = read_text(reader)?,
                b"subtitle" => feed.subtitle = Some(read_text(reader)?),
                b"updated" => feed.updated = Some(read_text(reader)?),
                b"logo" => feed.logo = Some(read_text(reader)?),
                b"author" => feed.author = Some(read_person(reader)?),
                b"link" => {
                    feed.links.push(read_link(&start)?);
                    skip_element(reader)?;
                }
                b"entry" => feed.entries.push(read_entry(reader)?),
                _ => skip_element(reader)?,
            },
            XmlEvent::Empty(start) => {
                if start.local_name().as_ref() == b"link" {
                    feed.links.push(read_link(&start)?);
                }
            }
            XmlEvent::End(_) => return Ok(feed),
            XmlEvent::Eof => return Err(Error::Xml("unexpected end of document".to_string())),
            _ => {}
        }
    }
}

fn read_entry(reader: &mut Reader<&[u8]>) -> Result<Entry, Error> {
    let mut entry = Entry::default();
    loop {
        match read_event(reader)? {
            XmlEvent::Start(start) => match start.local_name().as_ref() {
                b"id" => entry.id = read_text(reader)?,
                b"title" => entry.title = read_text(reader)?,
                b"published" => entry.published = Some(read_text(reader)?),
                b"updated" => entry.updated = Some(read_text(reader)?),
                b"author" => entry.author = Some(read_person(reader)?),
                b"summary" => {
                    entry.summary = Some(Text {
                        media_type: attribute(&start, b"type")?,
                        body: read_text(reader)?,
                    });
                }
                b"content" => {
                    entry.content = Some(Text {
                        media_type: attribute(&start, b"type")?,
                        body: read_text(reader)?,
                    });
                }
                b"object-type" => entry.object_type = Some(read_text(reader)?),
                b"verb" => entry.verb = Some(read_text(reader)?),
                b"in-reply-to" => {
                    entry.in_reply_to = Some(read_in_reply_to(&start)?);
                    skip_element(reader)?;
                }
                b"link" => {
                    entry.links.push(read_link(&start)?);
                    skip_element(reader)?;
                }
                _ => skip_element(reader)?,
            },
            XmlEvent::Empty(start) => match start.local_name().as_ref() {
                b"link" => entry.links.push(read_link(&start)?),
                b"in-reply-to" => entry.in_reply_to = Some(read_in_reply_to(&start)?),
                _ => {}
            },
            XmlEvent::End(_) => return Ok(entry),
            XmlEvent::Eof => return Err(Error::Xml("unexpected end of document".to_string())),
            _ => {}
        }
    }
}

fn read_person(reader: &mut Reader<&[u8]>) -> Result<Person, Error> {
    let mut person = Person::default();
    loop {
        match read_event(reader)? {
            XmlEvent::Start(start) => match start.local_name().as_ref() {
                b"id" => person.id = Some(read_text(reader)?),
                b"uri" => person.uri = Some(read_text(reader)?),
                b"name" => person.name = read_text(reader)?,
                b"email" => person.email = Some(read_text(reader)?),
                b"object-type" => person.object_type = Some(read_text(reader)?),
                _ => skip_element(reader)?,
            },
            XmlEvent::End(_) => return Ok(person),
            XmlEvent::Eof => return Err(Error::Xml("unexpected end of document".to_string())),
            _ => {}
        }
    }
}

fn write_element(out: &mut String, name: &str, value: &str) {
    let _ = write!(out, "<{name}>{}</{name}>", escape(value));
}

fn write_link(out: &mut String, link: &Link) {
    out.push_str("<link");
    if !link.rel.is_empty() {
        let _ = write!(out, " rel=\"{}\"", escape(&link.rel));
    }
    if let Some(media_type) = &link.media_type {
        let _ = write!(out, " type=\"{}\"", escape(media_type));
    }
    let _ = write!(out, " href=\"{}\"/>", escape(&link.href));
}

fn write_person(out: &mut String, person: &Person) {
    out.push_str("<author>");
    if let Some(id) = &person.id {
        write_element(out, "id", id);
    }
    if let Some(uri) = &person.uri {
        write_element(out, "uri", uri);
    }
    write_element(out, "name", &person.name);
    if let Some(email) = &person.email {
        write_element(out, "email", email);
    }
    if let Some(object_type) = &person.object_type {
        write_element(out, "activity:object-type", object_type);
    }
    out.push_str("</author>");
}

fn write_entry_body(out: &mut String, entry: &Entry) {
    write_element(out, "id", &entry.id);
    write_element(out, "title", &entry.title);
    if let Some(published) = &entry.published {
        write_element(out, "published", published);
    }
    if let Some(updated) = &entry.updated {
        write_element(out, "updated", updated);
    }
    if let Some(author) = &entry.author {
        write_person(out, author);
    }
    if let Some(summary) = &entry.summary {
        write_text(out, "summary", summary);
    }
    if let Some(content) = &entry.content {
        write_text(out, "content", content);
    }
    if let Some(object_type) = &entry.object_type {
        write_element(out, "activity:object-type", object_type);
    }
    if let Some(verb) = &entry.verb {
        write_element(out, "activity:verb", verb);
    }
    if let Some(in_reply_to) = &entry.in_reply_to {
        let _ = write!(out, "<thr:in-reply-to ref=\"{}\"", escape(&in_reply_to.reference));
        if let Some(href) = &in_reply_to.href {
            let _ = write!(out, " href=\"{}\"", escape(href));
        }
        out.push_str("/>");
    }
    for link in &entry.links {
        write_link(out, link);
    }
}

fn write_text(out: &mut String, name: &str, text: &Text) {
    match &text.media_type {
        Some(media_type) => {
            let _ = write!(
                out,
                "<{name} type=\"{}\">{}</{name}>",
                escape(media_type),
                escape(&text.body)
            );
        }
        None => write_element(out, name, &text.body),
    }
}
