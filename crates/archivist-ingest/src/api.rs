//! Typed client-server API endpoints over [`Transport`].
//!
//! [`HomeserverApi`] is the seam the engines are written against. The
//! production implementation is [`HomeserverClient`]; tests substitute a
//! scripted fake.

use crate::crypto::{OutgoingRequest, RequestKind};
use crate::transport::{CallKind, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

const CLIENT_PREFIX: [&str; 3] = ["_matrix", "client", "v3"];

/// Response of `GET /account/whoami`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WhoAmI {
    pub user_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Response of one long-poll `GET /sync`.
///
/// Only the sections the indexer consumes are modelled; the rest of the
/// payload is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Token to pass as `since` on the next poll.
    pub next_batch: String,

    #[serde(default)]
    pub rooms: Rooms,

    #[serde(default)]
    pub to_device: ToDevice,

    #[serde(default)]
    pub device_lists: DeviceLists,

    #[serde(default)]
    pub device_one_time_keys_count: BTreeMap<String, u64>,

    #[serde(
        default,
        alias = "org.matrix.msc2732.device_unused_fallback_key_types"
    )]
    pub device_unused_fallback_key_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rooms {
    #[serde(default)]
    pub join: BTreeMap<String, JoinedRoom>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    /// Raw events in timeline order.
    #[serde(default)]
    pub events: Vec<Value>,

    #[serde(default)]
    pub limited: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToDevice {
    #[serde(default)]
    pub events: Vec<Value>,
}

/// Users whose device lists changed, or who no longer share a room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceLists {
    #[serde(default)]
    pub changed: Vec<String>,
    #[serde(default)]
    pub left: Vec<String>,
}

/// Parameters of a backward `GET /rooms/{roomId}/messages` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagesRequest {
    /// Pagination token; `None` starts from the most recent event.
    pub from: Option<String>,
    /// Maximum events per page.
    pub limit: u32,
    /// Event types to return. Empty means all.
    pub types: Vec<String>,
}

/// One page of room history.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessagesPage {
    /// Raw events, newest first for backward pagination.
    #[serde(default)]
    pub chunk: Vec<Value>,

    #[serde(default)]
    pub start: Option<String>,

    /// Token for the next (older) page. Absent once history is exhausted.
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoinedRoomsResponse {
    #[serde(default)]
    joined_rooms: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    chunk: Vec<Value>,
}

/// Homeserver endpoints used by the engines.
#[async_trait]
pub trait HomeserverApi: Send + Sync {
    /// Resolve the account behind the access token.
    async fn whoami(&self) -> Result<WhoAmI>;

    /// Long-poll for new events since `since`.
    async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncResponse>;

    /// Rooms the account is joined to.
    async fn joined_rooms(&self) -> Result<Vec<String>>;

    /// Fetch one backward page of room history.
    async fn room_messages(&self, room_id: &str, request: &MessagesRequest)
    -> Result<MessagesPage>;

    /// The `m.room.name` of a room. `Ok(None)` when the room has no name.
    async fn room_name(&self, room_id: &str) -> Result<Option<String>>;

    /// User ids of members whose membership is `join` or `invite`.
    async fn room_members(&self, room_id: &str) -> Result<Vec<String>>;

    /// Deliver an outgoing crypto request and return the raw response.
    async fn send_crypto_request(&self, request: &OutgoingRequest) -> Result<Value>;

    /// Send a room message and return its event id.
    async fn send_message(&self, room_id: &str, content: &Value) -> Result<String>;

    /// Redact an event.
    async fn redact(&self, room_id: &str, event_id: &str, reason: Option<&str>) -> Result<()>;
}

/// [`HomeserverApi`] over the HTTP [`Transport`].
pub struct HomeserverClient {
    transport: Transport,
}

impl HomeserverClient {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    async fn call(
        &self,
        method: Method,
        path: &[&str],
        query: &[(&str, String)],
        body: Option<&Value>,
        kind: CallKind,
    ) -> Result<Value> {
        let segments: Vec<&str> = CLIENT_PREFIX.iter().copied().chain(path.iter().copied()).collect();
        self.transport
            .request(method, &segments, query, body, kind)
            .await
    }
}

/// Fresh transaction id for idempotent PUT endpoints.
fn txn_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Whether a membership state event is `join` or `invite`.
fn is_tracked_membership(event: &Value) -> bool {
    matches!(
        event
            .get("content")
            .and_then(|c| c.get("membership"))
            .and_then(Value::as_str),
        Some("join" | "invite")
    )
}

/// Resolve a crypto request to its endpoint.
///
/// Returns `None` for request kinds no endpoint exists for.
fn crypto_endpoint(kind: &RequestKind) -> Option<(Method, Vec<&str>, Vec<(&'static str, String)>)> {
    let endpoint = match kind {
        RequestKind::KeysUpload => (Method::POST, vec!["keys", "upload"], vec![]),
        RequestKind::KeysQuery => (Method::POST, vec!["keys", "query"], vec![]),
        RequestKind::KeysClaim => (Method::POST, vec!["keys", "claim"], vec![]),
        RequestKind::SignatureUpload => (Method::POST, vec!["keys", "signatures", "upload"], vec![]),
        RequestKind::KeysBackup { version } => (
            Method::PUT,
            vec!["room_keys", "keys"],
            version
                .iter()
                .map(|v| ("version", v.clone()))
                .collect(),
        ),
        RequestKind::ToDevice { event_type, txn_id } => (
            Method::PUT,
            vec!["sendToDevice", event_type.as_str(), txn_id.as_str()],
            vec![],
        ),
        RequestKind::RoomMessage {
            room_id,
            event_type,
            txn_id,
        } => (
            Method::PUT,
            vec!["rooms", room_id.as_str(), "send", event_type.as_str(), txn_id.as_str()],
            vec![],
        ),
        RequestKind::Unknown(_) => return None,
    };
    Some(endpoint)
}

#[async_trait]
impl HomeserverApi for HomeserverClient {
    async fn whoami(&self) -> Result<WhoAmI> {
        let value = self
            .call(Method::GET, &["account", "whoami"], &[], None, CallKind::Control)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncResponse> {
        let mut query = vec![("timeout", timeout_ms.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }
        let value = self
            .call(Method::GET, &["sync"], &query, None, CallKind::Long)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn joined_rooms(&self) -> Result<Vec<String>> {
        let value = self
            .call(Method::GET, &["joined_rooms"], &[], None, CallKind::Control)
            .await?;
        let parsed: JoinedRoomsResponse = serde_json::from_value(value)?;
        Ok(parsed.joined_rooms)
    }

    async fn room_messages(
        &self,
        room_id: &str,
        request: &MessagesRequest,
    ) -> Result<MessagesPage> {
        let mut query = vec![
            ("dir", "b".to_string()),
            ("limit", request.limit.to_string()),
        ];
        if let Some(from) = &request.from {
            query.push(("from", from.clone()));
        }
        if !request.types.is_empty() {
            query.push(("filter", json!({ "types": request.types }).to_string()));
        }

        let value = self
            .call(
                Method::GET,
                &["rooms", room_id, "messages"],
                &query,
                None,
                CallKind::Long,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn room_name(&self, room_id: &str) -> Result<Option<String>> {
        let result = self
            .call(
                Method::GET,
                &["rooms", room_id, "state", "m.room.name", ""],
                &[],
                None,
                CallKind::Control,
            )
            .await;

        match result {
            Ok(value) => Ok(value
                .get("name")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .map(str::to_string)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn room_members(&self, room_id: &str) -> Result<Vec<String>> {
        let value = self
            .call(
                Method::GET,
                &["rooms", room_id, "members"],
                &[],
                None,
                CallKind::Control,
            )
            .await?;
        let parsed: MembersResponse = serde_json::from_value(value)?;

        Ok(parsed
            .chunk
            .iter()
            .filter(|event| is_tracked_membership(event))
            .filter_map(|event| event.get("state_key").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    async fn send_crypto_request(&self, request: &OutgoingRequest) -> Result<Value> {
        let (method, path, query) = crypto_endpoint(&request.kind).ok_or_else(|| {
            Error::Crypto(format!("no endpoint for request type {}", request.kind))
        })?;
        self.call(method, &path, &query, Some(&request.body), CallKind::Control)
            .await
    }

    async fn send_message(&self, room_id: &str, content: &Value) -> Result<String> {
        let txn = txn_id();
        let value = self
            .call(
                Method::PUT,
                &["rooms", room_id, "send", "m.room.message", &txn],
                &[],
                Some(content),
                CallKind::Control,
            )
            .await?;
        let parsed: SendResponse = serde_json::from_value(value)?;
        Ok(parsed.event_id)
    }

    async fn redact(&self, room_id: &str, event_id: &str, reason: Option<&str>) -> Result<()> {
        let txn = txn_id();
        let body = match reason {
            Some(reason) => json!({ "reason": reason }),
            None => json!({}),
        };
        self.call(
            Method::PUT,
            &["rooms", room_id, "redact", event_id, &txn],
            &[],
            Some(&body),
            CallKind::Control,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sync_response() {
        let raw = json!({
            "next_batch": "s72595_4483_1934",
            "rooms": {
                "join": {
                    "!room:example.org": {
                        "timeline": {
                            "events": [
                                { "event_id": "$1", "type": "m.room.message", "content": { "msgtype": "m.text", "body": "hi" } }
                            ],
                            "limited": true,
                            "prev_batch": "p1"
                        },
                        "state": { "events": [] }
                    }
                },
                "leave": {}
            },
            "to_device": { "events": [{ "type": "m.room_key", "content": {} }] },
            "device_lists": { "changed": ["@bob:example.org"] },
            "device_one_time_keys_count": { "signed_curve25519": 12 },
            "org.matrix.msc2732.device_unused_fallback_key_types": ["signed_curve25519"]
        });

        let sync: SyncResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(sync.next_batch, "s72595_4483_1934");
        let room = &sync.rooms.join["!room:example.org"];
        assert_eq!(room.timeline.events.len(), 1);
        assert!(room.timeline.limited);
        assert_eq!(sync.to_device.events.len(), 1);
        assert_eq!(sync.device_lists.changed, vec!["@bob:example.org".to_string()]);
        assert!(sync.device_lists.left.is_empty());
        assert_eq!(sync.device_one_time_keys_count["signed_curve25519"], 12);
        assert_eq!(
            sync.device_unused_fallback_key_types,
            Some(vec!["signed_curve25519".to_string()])
        );
    }

    #[test]
    fn test_parse_minimal_sync_response() {
        let sync: SyncResponse = serde_json::from_value(json!({ "next_batch": "t" })).unwrap();
        assert!(sync.rooms.join.is_empty());
        assert!(sync.device_unused_fallback_key_types.is_none());
    }

    #[test]
    fn test_parse_messages_page_without_end() {
        let page: MessagesPage =
            serde_json::from_value(json!({ "chunk": [], "start": "t1" })).unwrap();
        assert!(page.end.is_none());
        assert_eq!(page.start.as_deref(), Some("t1"));
    }

    #[test]
    fn test_membership_filter() {
        assert!(is_tracked_membership(&json!({ "content": { "membership": "join" } })));
        assert!(is_tracked_membership(&json!({ "content": { "membership": "invite" } })));
        assert!(!is_tracked_membership(&json!({ "content": { "membership": "leave" } })));
        assert!(!is_tracked_membership(&json!({ "content": {} })));
    }

    #[test]
    fn test_crypto_endpoints() {
        let (method, path, query) = crypto_endpoint(&RequestKind::KeysClaim).unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(path, vec!["keys", "claim"]);
        assert!(query.is_empty());

        let kind = RequestKind::KeysBackup {
            version: Some("3".to_string()),
        };
        let (method, path, query) = crypto_endpoint(&kind).unwrap();
        assert_eq!(method, Method::PUT);
        assert_eq!(path, vec!["room_keys", "keys"]);
        assert_eq!(query, vec![("version", "3".to_string())]);

        let kind = RequestKind::ToDevice {
            event_type: "m.room.encrypted".to_string(),
            txn_id: "txn1".to_string(),
        };
        let (_, path, _) = crypto_endpoint(&kind).unwrap();
        assert_eq!(path, vec!["sendToDevice", "m.room.encrypted", "txn1"]);

        let kind = RequestKind::RoomMessage {
            room_id: "!r:s".to_string(),
            event_type: "m.room.encrypted".to_string(),
            txn_id: "t".to_string(),
        };
        let (_, path, _) = crypto_endpoint(&kind).unwrap();
        assert_eq!(path, vec!["rooms", "!r:s", "send", "m.room.encrypted", "t"]);

        assert!(crypto_endpoint(&RequestKind::Unknown("m.weird".to_string())).is_none());
    }

    #[test]
    fn test_txn_ids_unique() {
        assert_ne!(txn_id(), txn_id());
    }
}
