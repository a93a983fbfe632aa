//! Content-based payload classification
//!
//! Checks run in a fixed order and the first match wins, so `"123"` is numeric and
//! never text. Every byte sequence maps to exactly one type.

use std::fmt;
use std::str::FromStr;

use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "null")]
    Empty,
    #[serde(rename = "number")]
    Numeric,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "xml")]
    Xml,
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "byte")]
    Binary,
}

impl MessageType {
    /// Name stored in the `type` column
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Empty => "null",
            MessageType::Numeric => "number",
            MessageType::Boolean => "boolean",
            MessageType::Json => "json",
            MessageType::Xml => "xml",
            MessageType::Text => "text",
            MessageType::Binary => "byte",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "null" => Ok(MessageType::Empty),
            "number" => Ok(MessageType::Numeric),
            "boolean" => Ok(MessageType::Boolean),
            "json" => Ok(MessageType::Json),
            "xml" => Ok(MessageType::Xml),
            "text" => Ok(MessageType::Text),
            "byte" => Ok(MessageType::Binary),
            other => Err(Error::BadParameter(format!("unknown message type {:?}", other))),
        }
    }
}

pub fn classify(payload: &[u8]) -> MessageType {
    if payload.is_empty() {
        return MessageType::Empty;
    }
    let trimmed = trim(payload);
    if parse_number(trimmed).is_some() {
        MessageType::Numeric
    } else if parse_bool(trimmed).is_some() {
        MessageType::Boolean
    } else if is_json(trimmed) {
        MessageType::Json
    } else if is_xml(trimmed) {
        MessageType::Xml
    } else if std::str::from_utf8(payload).is_ok() {
        MessageType::Text
    } else {
        MessageType::Binary
    }
}

/// Strips Unicode whitespace from UTF-8 payloads and ASCII whitespace from anything else
pub(crate) fn trim(data: &[u8]) -> &[u8] {
    match std::str::from_utf8(data) {
        Ok(text) => text.trim().as_bytes(),
        Err(_) => data.trim_ascii(),
    }
}

/// Parses a decimal number. Infinity and NaN only count when spelled out, so
/// `1e400` is not a number.
pub(crate) fn parse_number(data: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(data).ok()?;
    let value = text.parse::<f64>().ok()?;
    if value.is_finite() {
        return Some(value);
    }
    let spelled = text.trim_start_matches(['+', '-']).to_ascii_lowercase();
    matches!(spelled.as_str(), "inf" | "infinity" | "nan").then_some(value)
}

/// Accepts the usual boolean spellings: 1, t, true and 0, f, false in lower, upper and
/// title case
pub(crate) fn parse_bool(data: &[u8]) -> Option<bool> {
    match data {
        b"1" | b"t" | b"T" | b"true" | b"TRUE" | b"True" => Some(true),
        b"0" | b"f" | b"F" | b"false" | b"FALSE" | b"False" => Some(false),
        _ => None,
    }
}

fn is_json(data: &[u8]) -> bool {
    let delimited = matches!(
        (data.first(), data.last()),
        (Some(b'{'), Some(b'}')) | (Some(b'['), Some(b']'))
    );
    delimited && serde_json::from_slice::<IgnoredAny>(data).is_ok()
}

fn is_xml(data: &[u8]) -> bool {
    if !(data.starts_with(b"<") && data.ends_with(b">")) {
        return false;
    }

    let mut reader = Reader::from_reader(data);
    let mut buf = Vec::new();
    let mut depth: usize = 0;
    let mut elements = 0;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(_)) => {
                depth += 1;
                elements += 1;
            }
            Ok(XmlEvent::End(_)) => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            Ok(XmlEvent::Empty(_)) => elements += 1,
            Ok(XmlEvent::Eof) => return depth == 0 && elements > 0,
            Ok(_) => {}
            Err(_) => return false,
        }
        buf.clear();
    }
}
