//! Room event model.
//!
//! Events arrive as loosely shaped JSON whose `content` depends on the event
//! `type` (and, for messages, on `content.msgtype`). [`RoomEvent`] keeps the
//! wire shape intact so it can be handed back to the crypto layer verbatim,
//! while [`RoomEvent::body`] classifies it into an [`EventBody`] variant that
//! callers match on instead of probing fields directly.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Event type of an end-to-end encrypted room event.
pub const ENCRYPTED_EVENT_TYPE: &str = "m.room.encrypted";

/// Event type of a room message.
pub const MESSAGE_EVENT_TYPE: &str = "m.room.message";

/// Event type of a redaction.
pub const REDACTION_EVENT_TYPE: &str = "m.room.redaction";

/// Event type of a reaction.
pub const REACTION_EVENT_TYPE: &str = "m.reaction";

/// Relation type declaring an event as the replacement of an earlier one.
pub const REPLACE_REL_TYPE: &str = "m.replace";

const ANNOTATION_REL_TYPE: &str = "m.annotation";
const RELATES_TO_KEY: &str = "m.relates_to";
const IN_REPLY_TO_KEY: &str = "m.in_reply_to";

/// A timeline event as delivered by the homeserver.
///
/// Unknown top-level fields (`unsigned`, `age`, ...) are preserved in
/// [`RoomEvent::extra`] so that re-serializing the event loses nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    /// Opaque identifier, unique within a room.
    pub event_id: String,

    /// Event type tag, e.g. `m.room.message`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Fully qualified user id of the sender.
    #[serde(default)]
    pub sender: String,

    /// Room id. Omitted by the homeserver inside sync timelines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,

    /// Milliseconds since the epoch on the originating server.
    #[serde(default)]
    pub origin_server_ts: i64,

    /// Type-dependent payload. Empty for redacted events.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: Map<String, Value>,

    /// Present only on state events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    /// Target of a redaction (room versions before v11).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,

    /// Every other top-level field, untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Classified view over a [`RoomEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    /// An `m.room.message` carrying a `msgtype`.
    Message(MessageContent),
    /// Ciphertext that has not (yet) been decrypted.
    Encrypted,
    /// A redaction of another event.
    Redaction { redacts: Option<String> },
    /// An annotation (emoji reaction) on another event.
    Reaction {
        target: Option<String>,
        key: Option<String>,
    },
    /// Any state event.
    State { state_key: String },
    /// Anything else, including messages whose content was redacted.
    Unknown,
}

/// Content of an `m.room.message` event.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContent {
    pub msgtype: MsgType,
    pub body: String,
    pub formatted_body: Option<String>,
    pub relation: Option<Relation>,
}

/// The `msgtype` of a room message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgType {
    Text,
    Notice,
    Emote,
    Other(String),
}

impl MsgType {
    /// Whether messages of this type are plain text worth indexing.
    pub fn is_indexable(&self) -> bool {
        matches!(self, Self::Text | Self::Notice)
    }
}

impl From<&str> for MsgType {
    fn from(value: &str) -> Self {
        match value {
            "m.text" => Self::Text,
            "m.notice" => Self::Notice,
            "m.emote" => Self::Emote,
            other => Self::Other(other.to_string()),
        }
    }
}

/// The `m.relates_to` block of an event's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// This event replaces `event_id` (an edit).
    Replace { event_id: String },
    /// A reaction to `event_id`.
    Annotation { event_id: String, key: Option<String> },
    /// A rich reply to `event_id`.
    Reply { event_id: String },
    /// Threads, references and future relation types.
    Other {
        rel_type: String,
        event_id: Option<String>,
    },
}

/// Some servers send `"content": null` for redacted or malformed events.
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl RoomEvent {
    /// Parse an event from raw JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an object with at least an
    /// `event_id` and a `type`.
    pub fn from_value(value: Value) -> Result<Self> {
        if value.get("event_id").and_then(Value::as_str).is_none() {
            return Err(Error::InvalidField {
                field: "event_id",
                reason: "missing or not a string".to_string(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize back to the wire representation.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Whether this is still an encrypted envelope.
    pub fn is_encrypted(&self) -> bool {
        self.event_type == ENCRYPTED_EVENT_TYPE
    }

    /// The `content.msgtype` field, if any.
    pub fn msgtype(&self) -> Option<&str> {
        self.content.get("msgtype").and_then(Value::as_str)
    }

    /// Parse the `m.relates_to` block, if present.
    ///
    /// Encrypted envelopes keep this block in cleartext, so this works before
    /// decryption too.
    pub fn relation(&self) -> Option<Relation> {
        let relates_to = self.content.get(RELATES_TO_KEY)?.as_object()?;
        let event_id = relates_to
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        match relates_to.get("rel_type").and_then(Value::as_str) {
            Some(REPLACE_REL_TYPE) => event_id.map(|event_id| Relation::Replace { event_id }),
            Some(ANNOTATION_REL_TYPE) => event_id.map(|event_id| Relation::Annotation {
                event_id,
                key: relates_to
                    .get("key")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            Some(rel_type) => Some(Relation::Other {
                rel_type: rel_type.to_string(),
                event_id,
            }),
            None => relates_to
                .get(IN_REPLY_TO_KEY)
                .and_then(|reply| reply.get("event_id"))
                .and_then(Value::as_str)
                .map(|event_id| Relation::Reply {
                    event_id: event_id.to_string(),
                }),
        }
    }

    /// The id of the event this one replaces, if it is an edit.
    pub fn replaced_event_id(&self) -> Option<String> {
        match self.relation()? {
            Relation::Replace { event_id } => Some(event_id),
            _ => None,
        }
    }

    /// Classify the event by its type tag.
    pub fn body(&self) -> EventBody {
        match self.event_type.as_str() {
            ENCRYPTED_EVENT_TYPE => EventBody::Encrypted,
            REDACTION_EVENT_TYPE => EventBody::Redaction {
                redacts: self.redacts.clone().or_else(|| {
                    self.content
                        .get("redacts")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                }),
            },
            REACTION_EVENT_TYPE => match self.relation() {
                Some(Relation::Annotation { event_id, key }) => EventBody::Reaction {
                    target: Some(event_id),
                    key,
                },
                _ => EventBody::Reaction {
                    target: None,
                    key: None,
                },
            },
            MESSAGE_EVENT_TYPE => match self.msgtype() {
                Some(msgtype) => EventBody::Message(MessageContent {
                    msgtype: MsgType::from(msgtype),
                    body: self
                        .content
                        .get("body")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    formatted_body: self
                        .content
                        .get("formatted_body")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    relation: self.relation(),
                }),
                None => EventBody::Unknown,
            },
            _ => match &self.state_key {
                Some(state_key) => EventBody::State {
                    state_key: state_key.clone(),
                },
                None => EventBody::Unknown,
            },
        }
    }

    /// Replace an encrypted envelope with the plaintext event it wraps.
    ///
    /// Identity fields (`event_id`, `sender`, `origin_server_ts`, ...) are
    /// kept from the envelope; `type` and `content` come from the plaintext.
    /// The cleartext `m.relates_to` of the envelope is carried over when the
    /// plaintext content does not repeat it.
    ///
    /// # Errors
    ///
    /// Returns an error if the plaintext lacks a string `type` or an object
    /// `content`.
    pub fn with_decrypted(mut self, plaintext: &Value) -> Result<Self> {
        let event_type = plaintext
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidField {
                field: "type",
                reason: "decrypted payload has no type".to_string(),
            })?;

        let mut content = match plaintext.get("content") {
            Some(Value::Object(map)) => map.clone(),
            _ => {
                return Err(Error::InvalidField {
                    field: "content",
                    reason: "decrypted payload has no content object".to_string(),
                });
            }
        };

        if !content.contains_key(RELATES_TO_KEY)
            && let Some(relates_to) = self.content.get(RELATES_TO_KEY)
        {
            content.insert(RELATES_TO_KEY.to_string(), relates_to.clone());
        }

        self.event_type = event_type.to_string();
        self.content = content;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> RoomEvent {
        RoomEvent::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_text_message() {
        let ev = event(json!({
            "event_id": "$a:example.org",
            "type": "m.room.message",
            "sender": "@alice:example.org",
            "origin_server_ts": 1700000000000i64,
            "content": { "msgtype": "m.text", "body": "hello" }
        }));

        match ev.body() {
            EventBody::Message(msg) => {
                assert_eq!(msg.msgtype, MsgType::Text);
                assert_eq!(msg.body, "hello");
                assert!(msg.relation.is_none());
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_missing_event_id_rejected() {
        let err = RoomEvent::from_value(json!({ "type": "m.room.message" })).unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "event_id", .. }));
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let raw = json!({
            "event_id": "$a",
            "type": "m.room.message",
            "sender": "@a:b",
            "origin_server_ts": 1,
            "content": {},
            "unsigned": { "age": 42 }
        });
        let ev = event(raw.clone());
        assert_eq!(ev.extra.get("unsigned"), Some(&json!({ "age": 42 })));
        assert_eq!(ev.to_value().unwrap(), raw);
    }

    #[test]
    fn test_null_content_is_empty() {
        let ev = event(json!({
            "event_id": "$a",
            "type": "m.room.message",
            "sender": "@alice:example.org",
            "content": null
        }));

        assert!(ev.content.is_empty());
        assert_eq!(ev.body(), EventBody::Unknown);
    }

    #[test]
    fn test_redacted_message_is_unknown() {
        let ev = event(json!({
            "event_id": "$a",
            "type": "m.room.message",
            "content": {}
        }));
        assert_eq!(ev.body(), EventBody::Unknown);
    }

    #[test]
    fn test_classify_other_kinds() {
        let encrypted = event(json!({
            "event_id": "$e", "type": "m.room.encrypted",
            "content": { "algorithm": "m.megolm.v1.aes-sha2", "ciphertext": "xyz" }
        }));
        assert_eq!(encrypted.body(), EventBody::Encrypted);
        assert!(encrypted.is_encrypted());

        let redaction = event(json!({
            "event_id": "$r", "type": "m.room.redaction", "redacts": "$x", "content": {}
        }));
        assert_eq!(
            redaction.body(),
            EventBody::Redaction { redacts: Some("$x".to_string()) }
        );

        let v11_redaction = event(json!({
            "event_id": "$r", "type": "m.room.redaction", "content": { "redacts": "$y" }
        }));
        assert_eq!(
            v11_redaction.body(),
            EventBody::Redaction { redacts: Some("$y".to_string()) }
        );

        let reaction = event(json!({
            "event_id": "$re", "type": "m.reaction",
            "content": { "m.relates_to": { "rel_type": "m.annotation", "event_id": "$t", "key": "👍" } }
        }));
        assert_eq!(
            reaction.body(),
            EventBody::Reaction { target: Some("$t".to_string()), key: Some("👍".to_string()) }
        );

        let state = event(json!({
            "event_id": "$s", "type": "m.room.name", "state_key": "", "content": { "name": "Lobby" }
        }));
        assert_eq!(state.body(), EventBody::State { state_key: String::new() });
    }

    #[test]
    fn test_edit_relation() {
        let ev = event(json!({
            "event_id": "$e2",
            "type": "m.room.message",
            "content": {
                "msgtype": "m.text",
                "body": "* fixed",
                "m.new_content": { "msgtype": "m.text", "body": "fixed" },
                "m.relates_to": { "rel_type": "m.replace", "event_id": "$e1" }
            }
        }));
        assert_eq!(ev.replaced_event_id().as_deref(), Some("$e1"));
        assert_eq!(
            ev.relation(),
            Some(Relation::Replace { event_id: "$e1".to_string() })
        );
    }

    #[test]
    fn test_reply_relation() {
        let ev = event(json!({
            "event_id": "$r",
            "type": "m.room.message",
            "content": {
                "msgtype": "m.text",
                "body": "> quoted\n\nreply",
                "m.relates_to": { "m.in_reply_to": { "event_id": "$orig" } }
            }
        }));
        assert_eq!(ev.relation(), Some(Relation::Reply { event_id: "$orig".to_string() }));
        assert!(ev.replaced_event_id().is_none());
    }

    #[test]
    fn test_with_decrypted_keeps_envelope_identity() {
        let envelope = event(json!({
            "event_id": "$enc",
            "type": "m.room.encrypted",
            "sender": "@bob:example.org",
            "origin_server_ts": 55,
            "content": {
                "ciphertext": "abc",
                "m.relates_to": { "rel_type": "m.replace", "event_id": "$old" }
            }
        }));
        let plaintext = json!({
            "type": "m.room.message",
            "room_id": "!room:example.org",
            "content": { "msgtype": "m.text", "body": "secret" }
        });

        let decrypted = envelope.with_decrypted(&plaintext).unwrap();
        assert_eq!(decrypted.event_id, "$enc");
        assert_eq!(decrypted.sender, "@bob:example.org");
        assert_eq!(decrypted.origin_server_ts, 55);
        assert_eq!(decrypted.event_type, "m.room.message");
        assert_eq!(decrypted.replaced_event_id().as_deref(), Some("$old"));
        assert!(!decrypted.is_encrypted());
    }

    #[test]
    fn test_with_decrypted_rejects_malformed_plaintext() {
        let envelope = event(json!({ "event_id": "$enc", "type": "m.room.encrypted", "content": {} }));
        assert!(envelope.clone().with_decrypted(&json!({ "content": {} })).is_err());
        assert!(envelope.with_decrypted(&json!({ "type": "m.room.message" })).is_err());
    }

    #[test]
    fn test_msgtype_indexable() {
        assert!(MsgType::Text.is_indexable());
        assert!(MsgType::Notice.is_indexable());
        assert!(!MsgType::Emote.is_indexable());
        assert!(!MsgType::from("m.image").is_indexable());
    }
}
