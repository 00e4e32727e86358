//! The crypto engine seam and its request types.

use crate::api::{DeviceLists, SyncResponse};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Endpoint family of an outgoing crypto request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    KeysUpload,
    KeysQuery,
    KeysClaim,
    /// Upload to server-side key backup.
    KeysBackup {
        version: Option<String>,
    },
    SignatureUpload,
    ToDevice {
        event_type: String,
        txn_id: String,
    },
    /// An encrypted room message emitted by the engine itself.
    RoomMessage {
        room_id: String,
        event_type: String,
        txn_id: String,
    },
    /// A request type this build does not know how to deliver.
    Unknown(String),
}

impl RequestKind {
    /// Stable label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::KeysUpload => "keys_upload",
            Self::KeysQuery => "keys_query",
            Self::KeysClaim => "keys_claim",
            Self::KeysBackup { .. } => "keys_backup",
            Self::SignatureUpload => "signature_upload",
            Self::ToDevice { .. } => "to_device",
            Self::RoomMessage { .. } => "room_message",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(tag) => write!(f, "unknown({tag})"),
            other => f.write_str(other.label()),
        }
    }
}

/// A request queued by the crypto engine for delivery to the homeserver.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRequest {
    /// Engine-assigned id, echoed back in [`CryptoEngine::mark_request_as_sent`].
    pub id: String,
    pub kind: RequestKind,
    /// JSON request body.
    pub body: Value,
}

/// The crypto-relevant slice of one sync response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncChanges {
    pub to_device_events: Vec<Value>,
    pub device_lists: DeviceLists,
    pub one_time_key_counts: BTreeMap<String, u64>,
    pub unused_fallback_keys: Option<Vec<String>>,
}

impl From<&SyncResponse> for SyncChanges {
    fn from(sync: &SyncResponse) -> Self {
        Self {
            to_device_events: sync.to_device.events.clone(),
            device_lists: sync.device_lists.clone(),
            one_time_key_counts: sync.device_one_time_keys_count.clone(),
            unused_fallback_keys: sync.device_unused_fallback_key_types.clone(),
        }
    }
}

/// End-to-end encryption state machine.
///
/// Implementations own device keys, Olm/Megolm sessions and the queue of
/// requests that must reach the homeserver to keep that state current.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Whether this engine can decrypt at all.
    fn decrypts(&self) -> bool {
        true
    }

    /// Feed to-device events, device list changes and key counts from a sync.
    async fn receive_sync_changes(&self, changes: SyncChanges) -> Result<()>;

    /// Requests currently waiting for delivery. Re-derived on every call.
    async fn outgoing_requests(&self) -> Result<Vec<OutgoingRequest>>;

    /// Report the homeserver's response to a delivered request.
    async fn mark_request_as_sent(
        &self,
        request_id: &str,
        kind: &RequestKind,
        response: &Value,
    ) -> Result<()>;

    /// Start tracking the devices of these users.
    async fn update_tracked_users(&self, users: &[String]) -> Result<()>;

    /// A key claim for users lacking an Olm session, if any.
    async fn missing_sessions(&self, users: &[String]) -> Result<Option<OutgoingRequest>>;

    /// Decrypt a serialized `m.room.encrypted` event.
    ///
    /// Returns the plaintext event (`type` + `content`).
    async fn decrypt_room_event(&self, event: &Value, room_id: &str) -> Result<Value>;
}

/// Engine for deployments that opt out of end-to-end encryption.
///
/// Never queues requests and fails every decrypt, so encrypted events stay
/// unreadable and are skipped by the indexer. Backfill leaves rooms with
/// encrypted history incomplete under this engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCryptoEngine;

#[async_trait]
impl CryptoEngine for NullCryptoEngine {
    fn decrypts(&self) -> bool {
        false
    }

    async fn receive_sync_changes(&self, _changes: SyncChanges) -> Result<()> {
        Ok(())
    }

    async fn outgoing_requests(&self) -> Result<Vec<OutgoingRequest>> {
        Ok(Vec::new())
    }

    async fn mark_request_as_sent(
        &self,
        _request_id: &str,
        _kind: &RequestKind,
        _response: &Value,
    ) -> Result<()> {
        Ok(())
    }

    async fn update_tracked_users(&self, _users: &[String]) -> Result<()> {
        Ok(())
    }

    async fn missing_sessions(&self, _users: &[String]) -> Result<Option<OutgoingRequest>> {
        Ok(None)
    }

    async fn decrypt_room_event(&self, _event: &Value, _room_id: &str) -> Result<Value> {
        Err(Error::Decrypt("no crypto engine configured".to_string()))
    }
}
