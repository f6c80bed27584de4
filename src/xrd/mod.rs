//! Extensible resource descriptors.
//!
//! A resource descriptor lists relations and hrefs for a subject URI. It
//! round-trips through two carriers: the XRD XML document and the JRD JSON
//! object. Property and title maps serialize as repeated `<Property key="…">`
//! / `<Title key="…">` elements in XML and as object fields in JSON.

pub mod client;
pub mod handler;
pub mod hostmeta;
pub mod lrdd;
pub mod webfinger;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;

/// XML namespace of the XRD carrier.
pub const XML_NAMESPACE: &str = "http://docs.oasis-open.org/ns/xri/xrd-1.0";

/// Errors produced by descriptor serialization, lookup and discovery.
#[derive(Debug, Error)]
pub enum Error {
    /// Returned by backends when the requested resource does not exist.
    #[error("no such resource")]
    NoSuchResource,

    #[error("resource request failed with status {0}")]
    Status(http::StatusCode),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unsupported descriptor format {0:?}")]
    UnsupportedFormat(String),

    #[error("malformed descriptor: {0}")]
    Xml(String),

    #[error("malformed descriptor: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The account URI carries neither an authority nor `user@host` opaque
    /// data to take a host from.
    #[error("cannot extract host from account URI")]
    NoHost,

    #[error("no {0:?} link in descriptor")]
    MissingLink(&'static str),
}

/// A resource descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub properties: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub links: Vec<Link>,
}

/// A relationship between a resource and a URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Link {
    #[serde(default)]
    pub rel: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub titles: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub properties: BTreeMap<String, String>,
}

impl Resource {
    /// Returns the first link with the given relation.
    pub fn link(&self, rel: &str) -> Option<&Link> {
        self.links.iter().find(|link| link.rel == rel)
    }

    /// Serializes the XRD carrier with an XML declaration.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = write!(out, "<XRD xmlns=\"{XML_NAMESPACE}\">");
        if let Some(subject) = &self.subject {
            let _ = write!(out, "<Subject>{}</Subject>", escape(subject));
        }
        for alias in &self.aliases {
            let _ = write!(out, "<Alias>{}</Alias>", escape(alias));
        }
        write_map(&mut out, "Property", &self.properties);
        for link in &self.links {
            out.push_str("<Link");
            if !link.rel.is_empty() {
                let _ = write!(out, " rel=\"{}\"", escape(&link.rel));
            }
            if let Some(media_type) = &link.media_type {
                let _ = write!(out, " type=\"{}\"", escape(media_type));
            }
            if let Some(href) = &link.href {
                let _ = write!(out, " href=\"{}\"", escape(href));
            }
            if let Some(template) = &link.template {
                let _ = write!(out, " template=\"{}\"", escape(template));
            }
            if link.titles.is_empty() && link.properties.is_empty() {
                out.push_str("/>");
            } else {
                out.push('>');
                write_map(&mut out, "Title", &link.titles);
                write_map(&mut out, "Property", &link.properties);
                out.push_str("</Link>");
            }
        }
        out.push_str("</XRD>");
        out
    }

    /// Parses the XRD carrier. Namespace prefixes are ignored.
    pub fn from_xml(input: &str) -> Result<Self, Error> {
        let mut reader = Reader::from_str(input);
        loop {
            match read_event(&mut reader)? {
                XmlEvent::Start(start) if start.local_name().as_ref() == b"XRD" => {
                    return read_resource(&mut reader);
                }
                XmlEvent::Eof => return Err(Error::Xml("missing XRD element".to_string())),
                _ => {}
            }
        }
    }
}

fn write_map(out: &mut String, element: &str, map: &BTreeMap<String, String>) {
    for (key, value) in map {
        let _ = write!(
            out,
            "<{element} key=\"{}\">{}</{element}>",
            escape(key),
            escape(value)
        );
    }
}

fn read_event<'a>(reader: &mut Reader<&'a [u8]>) -> Result<XmlEvent<'a>, Error> {
    reader.read_event().map_err(|e| Error::Xml(e.to_string()))
}

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
            XmlEvent::Eof => return Err(Error::Xml("unexpected end of document".to_string())),
            _ => {}
        }
    }
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

fn read_resource(reader: &mut Reader<&[u8]>) -> Result<Resource, Error> {
    let mut resource = Resource::default();
    loop {
        match read_event(reader)? {
            XmlEvent::Start(start) => match start.local_name().as_ref() {
                b"Subject" => resource.subject = Some(read_text(reader)?),
                b"Alias" => resource.aliases.push(read_text(reader)?),
                b"Property" => {
                    let key = attribute(&start, b"key")?.unwrap_or_default();
                    resource.properties.insert(key, read_text(reader)?);
                }
                b"Link" => resource.links.push(read_link(reader, &start)?),
                _ => {
                    read_text(reader)?;
                }
            },
            XmlEvent::Empty(start) => match start.local_name().as_ref() {
                b"Link" => resource.links.push(link_from_attributes(&start)?),
                b"Property" => {
                    let key = attribute(&start, b"key")?.unwrap_or_default();
                    resource.properties.insert(key, String::new());
                }
                _ => {}
            },
            XmlEvent::End(_) => return Ok(resource),
            XmlEvent::Eof => return Err(Error::Xml("unexpected end of document".to_string())),
            _ => {}
        }
    }
}

fn link_from_attributes(start: &BytesStart<'_>) -> Result<Link, Error> {
    Ok(Link {
        rel: attribute(start, b"rel")?.unwrap_or_default(),
        media_type: attribute(start, b"type")?,
        href: attribute(start, b"href")?,
        template: attribute(start, b"template")?,
        titles: BTreeMap::new(),
        properties: BTreeMap::new(),
    })
}

fn read_link(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>) -> Result<Link, Error> {
    let mut link = link_from_attributes(start)?;
    loop {
        match read_event(reader)? {
            XmlEvent::Start(child) => match child.local_name().as_ref() {
                b"Title" => {
                    let key = attribute(&child, b"key")?.unwrap_or_default();
                    link.titles.insert(key, read_text(reader)?);
                }
                b"Property" => {
                    let key = attribute(&child, b"key")?.unwrap_or_default();
                    link.properties.insert(key, read_text(reader)?);
                }
                _ => {
                    read_text(reader)?;
                }
            },
            XmlEvent::Empty(child) => match child.local_name().as_ref() {
                b"Title" => {
                    let key = attribute(&child, b"key")?.unwrap_or_default();
                    link.titles.insert(key, String::new());
                }
                b"Property" => {
                    let key = attribute(&child, b"key")?.unwrap_or_default();
                    link.properties.insert(key, String::new());
                }
                _ => {}
            },
            XmlEvent::End(_) => return Ok(link),
            XmlEvent::Eof => return Err(Error::Xml("unexpected end of document".to_string())),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_resource() -> Resource {
        Resource {
            subject: Some("acct:alice@example.com".to_string()),
            aliases: vec!["https://example.com/users/alice".to_string()],
            properties: BTreeMap::from([(
                "http://example.com/ns/role".to_string(),
                "author".to_string(),
            )]),
            links: vec![
                Link {
                    rel: "magic-public-key".to_string(),
                    media_type: None,
                    href: Some("data:application/magic-public-key,RSA.abc.AQAB".to_string()),
                    template: None,
                    titles: BTreeMap::new(),
                    properties: BTreeMap::new(),
                },
                Link {
                    rel: "lrdd".to_string(),
                    media_type: Some("application/jrd+json".to_string()),
                    href: None,
                    template: Some(
                        "https://example.com/.well-known/webfinger?resource={uri}".to_string(),
                    ),
                    titles: BTreeMap::from([("default".to_string(), "Discovery".to_string())]),
                    properties: BTreeMap::from([(
                        "http://example.com/ns/priority".to_string(),
                        "1".to_string(),
                    )]),
                },
            ],
        }
    }

    #[test]
    fn xml_round_trips() {
        let resource = sample_resource();
        let xml = resource.to_xml();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<Property key=\"http://example.com/ns/role\">author</Property>"));

        let reparsed = Resource::from_xml(&xml).expect("own serialization parses");
        assert_eq!(reparsed, resource);
    }

    #[test]
    fn json_round_trips() {
        let resource = sample_resource();
        let json = serde_json::to_string(&resource).unwrap();
        let reparsed: Resource = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed, resource);

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["subject"], "acct:alice@example.com");
        assert_eq!(value["links"][1]["type"], "application/jrd+json");
        assert_eq!(value["links"][1]["properties"]["http://example.com/ns/priority"], "1");
    }

    #[test]
    fn empty_collections_are_omitted_from_json() {
        let resource = Resource::default();
        let json = serde_json::to_string(&resource).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn parses_prefixed_xrd_documents() {
        let input = r#"<?xml version="1.0"?>
<xrd:XRD xmlns:xrd="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <xrd:Subject>https://example.com/feeds/alice.atom</xrd:Subject>
  <xrd:Link rel="hub" href="https://example.com/hub"/>
</xrd:XRD>"#;

        let resource = Resource::from_xml(input).expect("prefixed document parses");
        assert_eq!(resource.subject.as_deref(), Some("https://example.com/feeds/alice.atom"));
        assert_eq!(
            resource.link("hub").and_then(|link| link.href.as_deref()),
            Some("https://example.com/hub")
        );
    }

    #[test]
    fn link_lookup_returns_first_match() {
        let resource = sample_resource();
        assert_eq!(resource.link("lrdd").map(|l| l.rel.as_str()), Some("lrdd"));
        assert!(resource.link("salmon").is_none());
    }
}
