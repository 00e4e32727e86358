//! Search documents derived from room messages.
//!
//! Documents are a derived, lossy view of events: the id is rewritten into an
//! identifier-safe alphabet and user identifiers are scrubbed from message
//! text before anything reaches the search backend.

use crate::event::RoomEvent;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::LazyLock;

/// Replacement text for user identifiers found in message bodies.
pub const MXID_PLACEHOLDER: &str = "<mxid>";

/// Matches `@localpart:server.name` with an optional port.
static MXID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@[A-Za-z0-9._=\-/+]+:[A-Za-z0-9.\-]+(?::[0-9]+)?")
        .expect("mxid regex should compile")
});

/// A message as stored in the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    /// Normalized event id, see [`normalize_event_id`].
    pub id: String,
    pub sender: String,
    /// Event content with user identifiers redacted from the text fields.
    pub content: Map<String, Value>,
    pub room_id: String,
    pub origin_server_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
}

impl IndexedDocument {
    /// Build a document from a (decrypted) message event.
    pub fn from_event(event: &RoomEvent, room_id: &str, room_name: Option<String>) -> Self {
        Self {
            id: normalize_event_id(&event.event_id),
            sender: event.sender.clone(),
            content: redact_content(event.content.clone()),
            room_id: room_id.to_string(),
            origin_server_ts: event.origin_server_ts,
            room_name,
        }
    }

    /// The plain-text body, if the content has one.
    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(Value::as_str)
    }
}

/// Rewrite an event id into the `[A-Za-z0-9_-]` alphabet.
///
/// The `$` sigil is dropped and every other character outside the alphabet
/// (`:`, `.`, `!`, `+`, `/`, `=`, ...) becomes `_`. The transform is
/// deterministic but not reversible.
pub fn normalize_event_id(event_id: &str) -> String {
    event_id
        .chars()
        .filter(|c| *c != '$')
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Replace every user identifier in `text` with [`MXID_PLACEHOLDER`].
pub fn redact_mxids(text: &str) -> Cow<'_, str> {
    MXID_REGEX.replace_all(text, MXID_PLACEHOLDER)
}

/// Redact user identifiers from `body` and `formatted_body`.
pub fn redact_content(mut content: Map<String, Value>) -> Map<String, Value> {
    for key in ["body", "formatted_body"] {
        if let Some(Value::String(text)) = content.get_mut(key)
            && MXID_REGEX.is_match(text)
        {
            *text = redact_mxids(text).into_owned();
        }
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_strips_sigils() {
        let id = normalize_event_id("$abc:def.org");
        assert_eq!(id, "abc_def_org");
        assert!(!id.contains('$'));
        assert!(!id.contains(':'));
        assert!(!id.contains('.'));
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let raw = "$Rqnc-F-dvnEYJTyHq_iKxU2bZ1CI92-kuZq3a5lr5Zg";
        assert_eq!(normalize_event_id(raw), normalize_event_id(raw));
        assert_eq!(normalize_event_id(raw), "Rqnc-F-dvnEYJTyHq_iKxU2bZ1CI92-kuZq3a5lr5Zg");
    }

    #[test]
    fn test_normalize_base64_ids() {
        assert_eq!(normalize_event_id("$a+b/c=!x"), "a_b_c__x");
    }

    #[test]
    fn test_redact_body() {
        assert_eq!(redact_mxids("hello @alice:example.org"), "hello <mxid>");
    }

    #[test]
    fn test_redact_multiple_and_ports() {
        assert_eq!(
            redact_mxids("@bob:matrix.org and @carol.x:localhost:8448 said hi"),
            "<mxid> and <mxid> said hi"
        );
    }

    #[test]
    fn test_redact_leaves_plain_text_borrowed() {
        assert!(matches!(redact_mxids("nothing to see"), Cow::Borrowed(_)));
        assert!(matches!(redact_mxids("mail me @ home"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_document_from_event() {
        let event = RoomEvent::from_value(json!({
            "event_id": "$abc:def.org",
            "type": "m.room.message",
            "sender": "@alice:example.org",
            "origin_server_ts": 1700000000000i64,
            "content": {
                "msgtype": "m.text",
                "body": "hello @alice:example.org",
                "format": "org.matrix.custom.html",
                "formatted_body": "hello <a href=\"https://matrix.to/#/@alice:example.org\">@alice:example.org</a>"
            }
        }))
        .unwrap();

        let doc = IndexedDocument::from_event(&event, "!room:example.org", Some("Lobby".into()));
        assert_eq!(doc.id, "abc_def_org");
        assert_eq!(doc.body(), Some("hello <mxid>"));
        assert!(
            !doc.content["formatted_body"]
                .as_str()
                .unwrap()
                .contains("@alice:example.org")
        );
        assert_eq!(doc.sender, "@alice:example.org");
        assert_eq!(doc.room_id, "!room:example.org");
        assert_eq!(doc.room_name.as_deref(), Some("Lobby"));
        assert_eq!(doc.origin_server_ts, 1700000000000);
    }

    #[test]
    fn test_document_without_room_name_omits_field() {
        let event = RoomEvent::from_value(json!({
            "event_id": "$x",
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": "hi" }
        }))
        .unwrap();
        let doc = IndexedDocument::from_event(&event, "!r:s", None);
        let value = serde_json::to_value(&doc).unwrap();
        assert!(value.get("room_name").is_none());
    }
}
