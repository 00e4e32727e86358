//! [`CryptoEngine`] backed by the matrix-sdk Olm machine.
//!
//! The machine keeps device keys and Olm/Megolm sessions in a SQLite crypto
//! store, so the device identity survives restarts. Requests and responses
//! cross the seam as JSON bodies: requests are serialized from the machine's
//! typed requests, responses are parsed back into the typed responses the
//! machine expects.

use super::engine::{CryptoEngine, OutgoingRequest, RequestKind, SyncChanges};
use crate::{Error, Result};
use async_trait::async_trait;
use matrix_sdk::ruma::api::IncomingResponse;
use matrix_sdk::ruma::api::client::keys::{claim_keys, get_keys, upload_keys, upload_signatures};
use matrix_sdk::ruma::api::client::sync::sync_events::DeviceLists;
use matrix_sdk::ruma::api::client::to_device::send_event_to_device;
use matrix_sdk::ruma::events::AnyToDeviceEvent;
use matrix_sdk::ruma::serde::Raw;
use matrix_sdk::ruma::{
    OneTimeKeyAlgorithm, OwnedDeviceId, OwnedTransactionId, OwnedUserId, RoomId, UInt, UserId,
};
use matrix_sdk_crypto::types::events::room::encrypted::EncryptedEvent;
use matrix_sdk_crypto::types::requests::AnyOutgoingRequest;
use matrix_sdk_crypto::{
    DecryptionSettings, EncryptionSyncChanges, OlmMachine, TrustRequirement,
};
use matrix_sdk_sqlite::SqliteCryptoStore;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

fn crypto_error(e: impl fmt::Display) -> Error {
    Error::Crypto(e.to_string())
}

fn raw<T>(value: &Value) -> Result<Raw<T>> {
    Ok(Raw::from_json(serde_json::value::to_raw_value(value)?))
}

/// Add `"timeout"` in milliseconds when the machine set one.
fn with_timeout(mut body: Value, timeout: Option<Duration>) -> Value {
    if let (Some(timeout), Some(object)) = (timeout, body.as_object_mut()) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        object.insert("timeout".to_string(), json!(millis));
    }
    body
}

/// Parse user ids, dropping (and logging) malformed ones.
fn parse_user_ids(users: &[String]) -> Vec<OwnedUserId> {
    users
        .iter()
        .filter_map(|user| match UserId::parse(user.as_str()) {
            Ok(user_id) => Some(user_id),
            Err(e) => {
                tracing::debug!("Ignoring malformed user id {}: {}", user, e);
                None
            }
        })
        .collect()
}

/// Turn a response body into the typed response the machine expects.
fn parse_response<R>(body: &Value) -> Result<R>
where
    R: IncomingResponse,
    R::EndpointError: fmt::Display,
{
    let bytes = serde_json::to_vec(body)?;
    let response = http::Response::builder()
        .status(200)
        .body(bytes)
        .map_err(crypto_error)?;
    R::try_from_http_response(response).map_err(crypto_error)
}

/// Convert one of the machine's requests into an [`OutgoingRequest`].
fn convert_request(id: String, request: &AnyOutgoingRequest) -> Result<OutgoingRequest> {
    let (kind, body) = match request {
        AnyOutgoingRequest::KeysUpload(request) => (
            RequestKind::KeysUpload,
            json!({
                "device_keys": serde_json::to_value(&request.device_keys)?,
                "one_time_keys": serde_json::to_value(&request.one_time_keys)?,
                "fallback_keys": serde_json::to_value(&request.fallback_keys)?,
            }),
        ),
        AnyOutgoingRequest::KeysQuery(request) => (
            RequestKind::KeysQuery,
            with_timeout(
                json!({ "device_keys": serde_json::to_value(&request.device_keys)? }),
                request.timeout,
            ),
        ),
        AnyOutgoingRequest::SignatureUpload(request) => (
            RequestKind::SignatureUpload,
            serde_json::to_value(&request.signed_keys)?,
        ),
        AnyOutgoingRequest::ToDeviceRequest(request) => (
            RequestKind::ToDevice {
                event_type: request.event_type.to_string(),
                txn_id: request.txn_id.to_string(),
            },
            json!({ "messages": serde_json::to_value(&request.messages)? }),
        ),
        // Only emitted for in-room verification, which the indexer never starts.
        AnyOutgoingRequest::RoomMessage(request) => (
            RequestKind::Unknown(format!("room message in {}", request.room_id)),
            Value::Null,
        ),
        #[allow(unreachable_patterns)]
        _ => (RequestKind::Unknown("unsupported".to_string()), Value::Null),
    };

    Ok(OutgoingRequest { id, kind, body })
}

/// Olm/Megolm engine over a persistent crypto store.
pub struct OlmEngine {
    machine: OlmMachine,
    decryption: DecryptionSettings,
}

impl OlmEngine {
    /// Open (or create) the crypto store in `store_dir` for this device.
    ///
    /// The device id must be the one the access token belongs to; keys in
    /// an existing store are bound to it.
    pub async fn open(
        user_id: &str,
        device_id: &str,
        store_dir: &Path,
        passphrase: Option<&str>,
    ) -> Result<Self> {
        let user_id = UserId::parse(user_id).map_err(crypto_error)?;
        let device_id: OwnedDeviceId = device_id.into();

        let store = SqliteCryptoStore::open(store_dir, passphrase)
            .await
            .map_err(crypto_error)?;
        let machine = OlmMachine::with_store(&user_id, &device_id, store, None)
            .await
            .map_err(crypto_error)?;

        tracing::info!(
            "Crypto store opened at {} for {} ({})",
            store_dir.display(),
            user_id,
            device_id
        );
        Ok(Self::from_machine(machine))
    }

    /// Engine with an in-memory store; keys are lost on drop.
    pub async fn in_memory(user_id: &str, device_id: &str) -> Result<Self> {
        let user_id = UserId::parse(user_id).map_err(crypto_error)?;
        let device_id: OwnedDeviceId = device_id.into();
        let machine = OlmMachine::new(&user_id, &device_id).await;
        Ok(Self::from_machine(machine))
    }

    fn from_machine(machine: OlmMachine) -> Self {
        Self {
            machine,
            // Index whatever can be read, regardless of sender verification.
            decryption: DecryptionSettings {
                sender_device_trust_requirement: TrustRequirement::Untrusted,
            },
        }
    }
}

#[async_trait]
impl CryptoEngine for OlmEngine {
    async fn receive_sync_changes(&self, changes: SyncChanges) -> Result<()> {
        let to_device_events = changes
            .to_device_events
            .iter()
            .map(raw::<AnyToDeviceEvent>)
            .collect::<Result<Vec<_>>>()?;

        let mut device_lists = DeviceLists::default();
        device_lists.changed = parse_user_ids(&changes.device_lists.changed);
        device_lists.left = parse_user_ids(&changes.device_lists.left);

        let counts: BTreeMap<OneTimeKeyAlgorithm, UInt> = changes
            .one_time_key_counts
            .iter()
            .map(|(algorithm, count)| {
                (
                    OneTimeKeyAlgorithm::from(algorithm.as_str()),
                    UInt::new_saturating(*count),
                )
            })
            .collect();
        let fallback: Option<Vec<OneTimeKeyAlgorithm>> =
            changes.unused_fallback_keys.as_ref().map(|keys| {
                keys.iter()
                    .map(|key| OneTimeKeyAlgorithm::from(key.as_str()))
                    .collect()
            });

        self.machine
            .receive_sync_changes(
                EncryptionSyncChanges {
                    to_device_events,
                    changed_devices: &device_lists,
                    one_time_keys_counts: &counts,
                    unused_fallback_keys: fallback.as_deref(),
                    next_batch_token: None,
                },
                &self.decryption,
            )
            .await
            .map_err(crypto_error)?;
        Ok(())
    }

    async fn outgoing_requests(&self) -> Result<Vec<OutgoingRequest>> {
        let requests = self
            .machine
            .outgoing_requests()
            .await
            .map_err(crypto_error)?;

        requests
            .iter()
            .map(|request| convert_request(request.request_id().to_string(), request.request()))
            .collect()
    }

    async fn mark_request_as_sent(
        &self,
        request_id: &str,
        kind: &RequestKind,
        response: &Value,
    ) -> Result<()> {
        let id = OwnedTransactionId::from(request_id.to_owned());

        let marked = match kind {
            RequestKind::KeysUpload => {
                let response: upload_keys::v3::Response = parse_response(response)?;
                self.machine.mark_request_as_sent(&id, &response).await
            }
            RequestKind::KeysQuery => {
                let response: get_keys::v3::Response = parse_response(response)?;
                self.machine.mark_request_as_sent(&id, &response).await
            }
            RequestKind::KeysClaim => {
                let response: claim_keys::v3::Response = parse_response(response)?;
                self.machine.mark_request_as_sent(&id, &response).await
            }
            RequestKind::SignatureUpload => {
                let response: upload_signatures::v3::Response = parse_response(response)?;
                self.machine.mark_request_as_sent(&id, &response).await
            }
            RequestKind::ToDevice { .. } => {
                let response: send_event_to_device::v3::Response = parse_response(response)?;
                self.machine.mark_request_as_sent(&id, &response).await
            }
            other => {
                return Err(Error::Crypto(format!(
                    "cannot acknowledge {other} request {request_id}"
                )));
            }
        };

        marked.map_err(crypto_error)
    }

    async fn update_tracked_users(&self, users: &[String]) -> Result<()> {
        let users = parse_user_ids(users);
        let users: Vec<&UserId> = users.iter().map(|user| &**user).collect();
        self.machine
            .update_tracked_users(users)
            .await
            .map_err(crypto_error)
    }

    async fn missing_sessions(&self, users: &[String]) -> Result<Option<OutgoingRequest>> {
        let users = parse_user_ids(users);
        let missing = self
            .machine
            .get_missing_sessions(users.iter().map(|user| &**user))
            .await
            .map_err(crypto_error)?;

        let Some((txn_id, request)) = missing else {
            return Ok(None);
        };

        Ok(Some(OutgoingRequest {
            id: txn_id.to_string(),
            kind: RequestKind::KeysClaim,
            body: with_timeout(
                json!({ "one_time_keys": serde_json::to_value(&request.one_time_keys)? }),
                request.timeout,
            ),
        }))
    }

    async fn decrypt_room_event(&self, event: &Value, room_id: &str) -> Result<Value> {
        let room_id = RoomId::parse(room_id).map_err(crypto_error)?;
        let event: Raw<EncryptedEvent> = raw(event)?;

        let decrypted = self
            .machine
            .decrypt_room_event(&event, &room_id, &self.decryption)
            .await
            .map_err(|e| Error::Decrypt(e.to_string()))?;

        Ok(serde_json::from_str(decrypted.event.json().get())?)
    }
}
