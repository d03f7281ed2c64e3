//! Message normalization and delivery
//!
//! Broker payloads become [`NormalizedMessage`]s: a payload starting with `{`
//! is decoded as a JSON notification, anything else is taken as the plain
//! text body. Normalized messages are handed to a [`DeliverySink`].

use std::fmt;

use serde::de::{IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

/// A notification ready for delivery
///
/// JSON field names match case-insensitively and a repeated field overwrites
/// the earlier one. Unknown fields are ignored and `null` leaves a field
/// unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizedMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Body text; empty when the field is missing or `null`
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<Map<String, Value>>,
}

impl<'de> Deserialize<'de> for NormalizedMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(NotificationVisitor)
    }
}

struct NotificationVisitor;

impl<'de> Visitor<'de> for NotificationVisitor {
    type Value = NormalizedMessage;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a notification object")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut out = NormalizedMessage::default();
        while let Some(key) = map.next_key::<String>()? {
            match key.to_lowercase().as_str() {
                "title" => {
                    if let Some(title) = map.next_value::<Option<String>>()? {
                        out.title = Some(title);
                    }
                }
                "message" => {
                    if let Some(message) = map.next_value::<Option<String>>()? {
                        out.message = message;
                    }
                }
                "priority" => {
                    if let Some(priority) = map.next_value::<Option<i64>>()? {
                        out.priority = Some(priority);
                    }
                }
                "extras" => out.extras = map.next_value()?,
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(out)
    }
}

impl NormalizedMessage {
    /// A message with only a body
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Turn a raw broker payload into a notification
///
/// Returns `None` only when the payload looks like JSON (first byte `{`) but
/// does not decode as a notification object; such payloads are dropped.
pub fn normalize(payload: &[u8]) -> Option<NormalizedMessage> {
    if payload.first() == Some(&b'{') {
        return match serde_json::from_slice::<NormalizedMessage>(payload) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!("Dropping malformed JSON payload ({} bytes): {}", payload.len(), e);
                None
            }
        };
    }

    Some(NormalizedMessage::text(String::from_utf8_lossy(payload)))
}

/// Receiver of normalized notifications
///
/// Called from broker session tasks; implementations must not block.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, message: NormalizedMessage);
}

impl<F> DeliverySink for F
where
    F: Fn(NormalizedMessage) + Send + Sync,
{
    fn deliver(&self, message: NormalizedMessage) {
        self(message)
    }
}

/// Sink that forwards notifications into a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<NormalizedMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<NormalizedMessage>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NormalizedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DeliverySink for ChannelSink {
    fn deliver(&self, message: NormalizedMessage) {
        if self.tx.send(message).is_err() {
            debug!("Notification receiver closed, dropping message");
        }
    }
}
