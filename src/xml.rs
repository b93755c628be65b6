//! XML document handling for manifests.
//!
//! A small owned element tree with an event-based parser (`quick-xml`)
//! and a deterministic compact serializer. The serializer writes no
//! inter-element whitespace and double-quotes attributes, so a document
//! serializes to the same bytes every time; signatures are computed over
//! fragments of exactly those bytes, located with [`extract_fragment`]
//! rather than by re-serializing a subtree.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fmt::Write as _;

use crate::error::{Error, Result};

/// XML document declaration emitted ahead of every serialized manifest.
pub const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

/// One XML element: name, attributes in insertion order, text or children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<Element>,
}

impl Element {
    /// Creates an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Element {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Creates an element holding only text.
    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut element = Element::new(name);
        element.text = Some(text.into());
        element
    }

    /// Returns the element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the element's text content, if any.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Sets the element's text content.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = Some(text.into());
    }

    /// Returns the value of the named attribute, if present.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Appends or replaces an attribute.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.attributes.iter_mut().find(|(key, _)| *key == name) {
            slot.1 = value;
        } else {
            self.attributes.push((name, value));
        }
    }

    /// Appends a child element.
    pub fn push(&mut self, child: Element) {
        self.children.push(child);
    }

    /// Returns all direct children.
    pub fn children(&self) -> &[Element] {
        &self.children
    }

    /// Finds the first element at a `/`-separated path below this one.
    pub fn find(&self, path: &str) -> Option<&Element> {
        let mut current = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = current
                .children
                .iter()
                .find(|child| child.name == segment)?;
        }
        Some(current)
    }

    /// Finds every element at a `/`-separated path below this one; only
    /// the final segment may match more than once.
    pub fn find_all(&self, path: &str) -> Vec<&Element> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            return Vec::new();
        };
        let mut current = self;
        for segment in parents {
            match current.children.iter().find(|child| child.name == *segment) {
                Some(child) => current = child,
                None => return Vec::new(),
            }
        }
        current
            .children
            .iter()
            .filter(|child| child.name == *last)
            .collect()
    }

    /// Parses an XML document into its root element.
    pub fn parse(xml: &str) -> Result<Element> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| Error::InvalidManifest(format!("malformed XML: {e}")))?;
            match event {
                Event::Start(start) => {
                    let mut element =
                        Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
                    for attribute in start.attributes() {
                        let attribute = attribute
                            .map_err(|e| Error::InvalidManifest(format!("bad attribute: {e}")))?;
                        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
                        let value = attribute
                            .unescape_value()
                            .map_err(|e| Error::InvalidManifest(format!("bad attribute: {e}")))?
                            .into_owned();
                        element.attributes.push((key, value));
                    }
                    stack.push(element);
                }
                Event::Empty(start) => {
                    let mut element =
                        Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
                    for attribute in start.attributes() {
                        let attribute = attribute
                            .map_err(|e| Error::InvalidManifest(format!("bad attribute: {e}")))?;
                        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
                        let value = attribute
                            .unescape_value()
                            .map_err(|e| Error::InvalidManifest(format!("bad attribute: {e}")))?
                            .into_owned();
                        element.attributes.push((key, value));
                    }
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None if root.is_none() => root = Some(element),
                        None => {
                            return Err(Error::InvalidManifest(
                                "multiple root elements".to_string(),
                            ))
                        }
                    }
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| Error::InvalidManifest(format!("bad text node: {e}")))?;
                    if text.trim().is_empty() {
                        continue;
                    }
                    match stack.last_mut() {
                        Some(element) => match &mut element.text {
                            Some(existing) => existing.push_str(&text),
                            None => element.text = Some(text.into_owned()),
                        },
                        None => {
                            return Err(Error::InvalidManifest(
                                "text outside the root element".to_string(),
                            ))
                        }
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| Error::InvalidManifest("unbalanced XML".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None if root.is_none() => root = Some(element),
                        None => {
                            return Err(Error::InvalidManifest(
                                "multiple root elements".to_string(),
                            ))
                        }
                    }
                }
                Event::Eof => break,
                // Declarations, comments and processing instructions carry
                // no manifest content.
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(Error::InvalidManifest("unterminated XML".to_string()));
        }
        root.ok_or_else(|| Error::InvalidManifest("document has no root element".to_string()))
    }

    /// Serializes this element as a complete document with declaration.
    pub fn to_document_string(&self) -> String {
        let mut out = String::from(XML_DECL);
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            let _ = write!(out, " {key}=\"{}\"", escape(value.as_str()));
        }
        if self.text.is_none() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if let Some(text) = &self.text {
            out.push_str(&escape(text.as_str()));
        }
        for child in &self.children {
            child.write_into(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Extracts the literal `<name>…</name>` byte range from serialized XML.
///
/// The match is textual, not structural: the returned slice is exactly
/// the bytes the serializer emitted, which is what signatures cover.
/// Returns `None` when the element is absent or self-closed.
pub fn extract_fragment<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let start_tag = format!("<{name}>");
    let end_tag = format!("</{name}>");
    let start = xml.find(&start_tag)?;
    let end = xml.find(&end_tag)?;
    Some(&xml[start..end + end_tag.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_navigate() {
        let root = Element::parse(
            "<?xml version=\"1.0\"?><book><title>Systems</title>\
             <author salutation=\"Dr.\">Knuth</author>\
             <chapter>one</chapter><chapter>two</chapter></book>",
        )
        .unwrap();
        assert_eq!(root.name(), "book");
        assert_eq!(root.find("title").unwrap().text(), Some("Systems"));
        assert_eq!(
            root.find("author").unwrap().attribute("salutation"),
            Some("Dr.")
        );
        let chapters = root.find_all("chapter");
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[1].text(), Some("two"));
        assert!(root.find("missing").is_none());
    }

    #[test]
    fn test_serialization_is_compact_and_stable() {
        let mut root = Element::new("manifest");
        root.push(Element::with_text("version", "3"));
        let mut digest = Element::with_text("digest", "abcd");
        digest.set_attribute("algorithm", "SHA1");
        root.push(digest);

        let expected = format!(
            "{XML_DECL}<manifest><version>3</version>\
             <digest algorithm=\"SHA1\">abcd</digest></manifest>"
        );
        assert_eq!(root.to_document_string(), expected);
        assert_eq!(root.to_document_string(), expected);
    }

    #[test]
    fn test_roundtrip_preserves_structure() {
        let mut root = Element::new("outer");
        let mut inner = Element::new("inner");
        inner.push(Element::with_text("value", "a&b<c>"));
        root.push(inner);

        let serialized = root.to_document_string();
        let reparsed = Element::parse(&serialized).unwrap();
        assert_eq!(reparsed, root);
    }

    #[test]
    fn test_extract_fragment_is_literal() {
        let xml = "<?xml?><manifest><image><name>x</name></image><signature>ff</signature></manifest>";
        assert_eq!(
            extract_fragment(xml, "image"),
            Some("<image><name>x</name></image>")
        );
        assert_eq!(extract_fragment(xml, "machine_configuration"), None);
    }

    #[test]
    fn test_parse_rejects_malformed_documents() {
        assert!(Element::parse("<a><b></a></b>").is_err());
        assert!(Element::parse("").is_err());
    }

    #[test]
    fn test_escaped_text_roundtrip() {
        let root =
            Element::parse("<m><name>a&amp;b &lt;tag&gt;</name></m>").unwrap();
        assert_eq!(root.find("name").unwrap().text(), Some("a&b <tag>"));
    }
}
