//! Protocol message types shared between the connector and its transport.

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Meta channel names and pattern matching.
///
/// Meta channels carry transport-level control traffic (handshake, connect,
/// subscribe, disconnect) as opposed to application event payloads.
pub mod meta {
    pub const HANDSHAKE: &str = "/meta/handshake";
    pub const CONNECT: &str = "/meta/connect";
    pub const SUBSCRIBE: &str = "/meta/subscribe";
    pub const UNSUBSCRIBE: &str = "/meta/unsubscribe";
    pub const DISCONNECT: &str = "/meta/disconnect";

    /// Whether `channel` is a meta channel.
    #[must_use]
    pub fn is_meta(channel: &str) -> bool {
        channel.starts_with("/meta/")
    }

    /// Match a listener pattern against a channel name.
    ///
    /// A pattern is either an exact channel (`/meta/handshake`) or a
    /// single-segment wildcard (`/meta/*`).
    #[must_use]
    pub fn matches(pattern: &str, channel: &str) -> bool {
        match pattern.strip_suffix("/*") {
            Some(prefix) => channel
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .is_some_and(|tail| !tail.is_empty() && !tail.contains('/')),
            None => pattern == channel,
        }
    }
}

/// A transport-level control message.
///
/// The `ext` object carries protocol extensions: the replay support flag on
/// handshakes and, on failures, a nested failure reason reported by the
/// server alongside the top-level `error` field.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaMessage {
    /// The meta channel this message belongs to.
    pub channel: String,
    /// Whether the exchange succeeded.
    pub successful: bool,
    /// Server-reported error, e.g. `401::Authentication invalid`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Protocol extension object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
}

impl MetaMessage {
    /// A successful exchange on `channel`.
    #[must_use]
    pub fn success<S: Into<String>>(channel: S) -> Self {
        Self {
            channel: channel.into(),
            successful: true,
            error: None,
            ext: None,
        }
    }

    /// A failed exchange on `channel` carrying a server error.
    #[must_use]
    pub fn failure<S: Into<String>, E: Into<String>>(channel: S, error: E) -> Self {
        Self {
            channel: channel.into(),
            successful: false,
            error: Some(error.into()),
            ext: None,
        }
    }

    /// The `ext` object, created if absent.
    pub fn ext_object(&mut self) -> &mut Map<String, Value> {
        if !matches!(self.ext, Some(Value::Object(_))) {
            self.ext = Some(Value::Object(Map::new()));
        }
        match self.ext {
            Some(Value::Object(ref mut map)) => map,
            // unreachable: just replaced with an object above
            _ => unreachable!("ext was seeded with an object"),
        }
    }

    /// Whether the server advertised replay support in this message's ext.
    #[must_use]
    pub fn replay_supported(&self) -> bool {
        self.ext
            .as_ref()
            .and_then(|ext| ext.get("replay"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// A failure reason nested inside the ext object, either at the top
    /// level or one object deep (servers wrap it in a vendor namespace).
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        let ext = self.ext.as_ref()?.as_object()?;
        if let Some(reason) = ext.get("failureReason").and_then(Value::as_str) {
            return Some(reason);
        }
        ext.values()
            .filter_map(Value::as_object)
            .find_map(|nested| nested.get("failureReason").and_then(Value::as_str))
    }

    /// The best available description of why this exchange failed: the
    /// top-level error if present, otherwise the nested failure reason.
    #[must_use]
    pub fn server_error(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.failure_reason().map(str::to_owned))
            .unwrap_or_else(|| format!("{} exchange failed", self.channel))
    }
}

/// Encoding of an event payload on the wire.
#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadFormat {
    /// Structured JSON records
    #[default]
    Structured,
    /// Compact schema-encoded binary, delivered base64-wrapped
    Compact,
}

/// An application event delivered on a subscribed topic.
///
/// `replay_id` is the server-assigned position of this event in the topic's
/// stream; the connector records it so a later resubscribe resumes without
/// gaps or duplicates. `schema_id` keys the payload decoder — decoding
/// itself is the caller's concern.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct TopicEvent {
    /// The raw channel the event arrived on.
    #[builder(into)]
    pub channel: String,
    /// Server-assigned replay position, when the server provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_id: Option<i64>,
    /// Identifier of the payload schema, for decoder lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub schema_id: Option<String>,
    /// How the payload is encoded.
    #[serde(default)]
    #[builder(default)]
    pub format: PayloadFormat,
    /// The opaque event payload.
    #[builder(default = Value::Null)]
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn meta_pattern_matching() {
        assert!(meta::matches("/meta/handshake", "/meta/handshake"));
        assert!(meta::matches("/meta/*", "/meta/connect"));
        assert!(meta::matches("/meta/*", "/meta/handshake"));
        assert!(!meta::matches("/meta/*", "/topic/orders"));
        assert!(!meta::matches("/meta/handshake", "/meta/connect"));
    }

    #[test]
    fn failure_reason_nested_one_level() {
        let mut message = MetaMessage::failure(meta::CONNECT, "");
        message.error = None;
        message.ext = Some(json!({"sfdc": {"failureReason": "401::Session invalidated"}}));

        assert_eq!(
            message.failure_reason(),
            Some("401::Session invalidated")
        );
        assert_eq!(message.server_error(), "401::Session invalidated");
    }

    #[test]
    fn server_error_prefers_top_level() {
        let mut message = MetaMessage::failure(meta::HANDSHAKE, "403::Forbidden");
        message.ext = Some(json!({"failureReason": "401::other"}));

        assert_eq!(message.server_error(), "403::Forbidden");
    }

    #[test]
    fn replay_support_flag() {
        let mut message = MetaMessage::success(meta::HANDSHAKE);
        assert!(!message.replay_supported());

        message.ext_object().insert("replay".to_owned(), json!(true));
        assert!(message.replay_supported());
    }

    #[test]
    fn topic_event_wire_shape() {
        let event = TopicEvent::builder()
            .channel("/topic/orders")
            .replay_id(42)
            .schema_id("3PbW2cpuG0")
            .payload(json!({"OrderId": "o-1"}))
            .build();

        let encoded = serde_json::to_value(&event).expect("serializes");
        assert_eq!(encoded["replayId"], 42);
        assert_eq!(encoded["schemaId"], "3PbW2cpuG0");
        assert_eq!(encoded["format"], "STRUCTURED");
    }
}
