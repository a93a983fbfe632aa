use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::classify::{parse_bool, parse_number, trim};
use super::{MessageType, StoredMessage};

/// Presentation of a stored message with a value re-derived from its payload
///
/// Numeric, boolean and JSON payloads carry a typed `value`. Text and XML carry the
/// trimmed string, binary the raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    pub id: i64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub ts: DateTime<Utc>,
    pub topic: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl From<&StoredMessage> for MessageView {
    fn from(message: &StoredMessage) -> Self {
        let trimmed = trim(&message.payload);
        let text = || Value::String(String::from_utf8_lossy(trimmed).into_owned());

        let (payload, value) = match message.message_type {
            MessageType::Empty => (Value::Null, Value::Null),
            MessageType::Text => (text(), text()),
            MessageType::Xml => (text(), Value::Null),
            MessageType::Numeric => (
                text(),
                parse_number(trimmed)
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            ),
            MessageType::Boolean => (
                text(),
                parse_bool(trimmed).map(Value::Bool).unwrap_or(Value::Null),
            ),
            MessageType::Json => (
                text(),
                serde_json::from_slice(trimmed).unwrap_or(Value::Null),
            ),
            MessageType::Binary => (
                Value::Array(message.payload.iter().map(|b| Value::from(*b)).collect()),
                Value::Null,
            ),
        };

        Self {
            id: message.id,
            message_type: message.message_type,
            ts: message.ts,
            topic: message.topic.clone(),
            payload,
            value,
        }
    }
}

impl From<StoredMessage> for MessageView {
    fn from(message: StoredMessage) -> Self {
        MessageView::from(&message)
    }
}
