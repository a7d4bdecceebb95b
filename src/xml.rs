//! Markup boundary: structural events to and from XML text.

use std::collections::VecDeque;

use quick_xml::escape::{escape, unescape};

use crate::codec::EventSink;
use crate::error::ProtocolError;
use crate::Event;

/// Serializes structural events as XML text.
#[derive(Debug, Default)]
pub struct XmlWriter {
    out: String,
}

impl XmlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer that starts with the XML declaration.
    pub fn document() -> Self {
        Self {
            out: String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    pub fn into_string(self) -> String {
        self.out
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out.into_bytes()
    }
}

impl EventSink for XmlWriter {
    fn open(&mut self, name: &str) {
        self.out.push('<');
        self.out.push_str(name);
        self.out.push('>');
    }

    fn close(&mut self, name: &str) {
        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push('>');
    }

    fn text(&mut self, chars: &str) {
        self.out.push_str(&escape(chars));
    }
}

/// Push tokenizer producing structural events from XML byte chunks.
///
/// Chunks may split the input anywhere; an event is emitted only once all
/// of its bytes have arrived. Declarations, processing instructions,
/// comments and doctypes are skipped, attributes are ignored, CDATA is
/// passed through as text and `<x/>` yields an open and a close.
#[derive(Debug, Default)]
pub struct XmlReader {
    buf: Vec<u8>,
    pos: usize,
    /// Bytes past `pos` already searched for the current terminator.
    scanned: usize,
    pending: VecDeque<Event>,
}

impl XmlReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
        self.scanned = 0;
        self.pending.clear();
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete event, or `None` when more input is needed.
    pub fn next_event(&mut self) -> Result<Option<Event>, ProtocolError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        loop {
            let rest = &self.buf[self.pos..];
            if rest.is_empty() {
                return self.need_more();
            }

            if rest[0] != b'<' {
                let Some(end) = self.find(0, b"<") else {
                    return self.need_more();
                };
                let raw = utf8(&self.buf[self.pos..self.pos + end])?;
                let text = unescape(raw)
                    .map_err(|e| ProtocolError::Markup(e.to_string()))?
                    .into_owned();
                self.pos += end;
                return Ok(Some(Event::Text(text)));
            }

            if rest.starts_with(b"<!--") {
                match self.find(4, b"-->") {
                    Some(end) => self.pos += end + 3,
                    None => return self.need_more(),
                }
                continue;
            }

            if rest.starts_with(b"<![CDATA[") {
                let Some(end) = self.find(9, b"]]>") else {
                    return self.need_more();
                };
                let text = utf8(&self.buf[self.pos + 9..self.pos + end])?.to_string();
                self.pos += end + 3;
                return Ok(Some(Event::Text(text)));
            }

            if rest.starts_with(b"<?") {
                match self.find(2, b"?>") {
                    Some(end) => self.pos += end + 2,
                    None => return self.need_more(),
                }
                continue;
            }

            let Some(end) = tag_end(rest) else {
                return self.need_more();
            };

            if rest.starts_with(b"<!") {
                self.pos += end + 1;
                continue;
            }

            let tag = utf8(&rest[1..end])?;
            self.pos += end + 1;

            if let Some(name) = tag.strip_prefix('/') {
                return Ok(Some(Event::Close(element_name(name)?)));
            }

            return match tag.strip_suffix('/') {
                Some(tag) => {
                    let name = element_name(tag)?;
                    self.pending.push_back(Event::Close(name.clone()));
                    Ok(Some(Event::Open(name)))
                }
                None => Ok(Some(Event::Open(element_name(tag)?))),
            };
        }
    }

    /// Offset of `needle` from `pos`, searching from `start` but never
    /// re-reading bytes a previous miss already covered.
    fn find(&mut self, start: usize, needle: &[u8]) -> Option<usize> {
        let rest = &self.buf[self.pos..];
        let from = start.max(self.scanned.saturating_sub(needle.len() - 1));
        match find(&rest[from.min(rest.len())..], needle) {
            Some(at) => {
                self.scanned = 0;
                Some(from + at)
            }
            None => {
                self.scanned = rest.len();
                None
            }
        }
    }

    fn need_more(&mut self) -> Result<Option<Event>, ProtocolError> {
        self.compact();
        Ok(None)
    }

    fn compact(&mut self) {
        self.buf.drain(..self.pos);
        self.pos = 0;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Index of the `>` closing the tag at the start of `rest`, skipping quoted
/// attribute values and a doctype's internal subset.
fn tag_end(rest: &[u8]) -> Option<usize> {
    let mut quote = None;
    let mut depth = 0usize;
    for (i, &b) in rest.iter().enumerate().skip(1) {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(b),
            (None, b'[') => depth += 1,
            (None, b']') => depth = depth.saturating_sub(1),
            (None, b'>') if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn utf8(bytes: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(bytes).map_err(|e| ProtocolError::Markup(e.to_string()))
}

fn element_name(tag: &str) -> Result<String, ProtocolError> {
    let name = tag.split_whitespace().next().unwrap_or_default();
    if name.is_empty() {
        return Err(ProtocolError::Markup(format!("empty element name in <{tag}>")));
    }
    Ok(name.to_string())
}
