//! Scripted in-process fakes shared by the engine tests.

use crate::api::{HomeserverApi, MessagesPage, MessagesRequest, SyncResponse, WhoAmI};
use crate::crypto::{CryptoEngine, OutgoingRequest, RequestKind, SyncChanges};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub(crate) fn transient() -> Error {
    Error::Http {
        status: 502,
        errcode: "M_UNKNOWN".to_string(),
        message: "bad gateway".to_string(),
    }
}

// =============================================================================
// Event builders
// =============================================================================

pub(crate) fn text_event(event_id: &str, sender: &str, body: &str, ts: i64) -> Value {
    json!({
        "event_id": event_id,
        "type": "m.room.message",
        "sender": sender,
        "origin_server_ts": ts,
        "content": { "msgtype": "m.text", "body": body }
    })
}

pub(crate) fn edit_event(event_id: &str, sender: &str, target: &str, body: &str, ts: i64) -> Value {
    json!({
        "event_id": event_id,
        "type": "m.room.message",
        "sender": sender,
        "origin_server_ts": ts,
        "content": {
            "msgtype": "m.text",
            "body": format!("* {body}"),
            "m.new_content": { "msgtype": "m.text", "body": body },
            "m.relates_to": { "rel_type": "m.replace", "event_id": target }
        }
    })
}

pub(crate) fn encrypted_event(event_id: &str, sender: &str, ts: i64) -> Value {
    json!({
        "event_id": event_id,
        "type": "m.room.encrypted",
        "sender": sender,
        "origin_server_ts": ts,
        "content": {
            "algorithm": "m.megolm.v1.aes-sha2",
            "ciphertext": "AwgAEpAB",
            "session_id": "s1"
        }
    })
}

pub(crate) fn sync_response(next_batch: &str, rooms: &[(&str, Vec<Value>)]) -> SyncResponse {
    let join: serde_json::Map<String, Value> = rooms
        .iter()
        .map(|(room, events)| {
            (
                room.to_string(),
                json!({ "timeline": { "events": events } }),
            )
        })
        .collect();
    serde_json::from_value(json!({
        "next_batch": next_batch,
        "rooms": { "join": join }
    }))
    .unwrap()
}

pub(crate) fn page(chunk: Vec<Value>, end: Option<&str>) -> MessagesPage {
    MessagesPage {
        chunk,
        start: None,
        end: end.map(str::to_string),
    }
}

// =============================================================================
// FakeApi
// =============================================================================

/// A scripted reply.
pub(crate) enum Scripted<T> {
    Ok(T),
    Transient,
}

impl<T> Scripted<T> {
    fn into_result(self) -> Result<T> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Transient => Err(transient()),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeApi {
    user_id: String,
    syncs: Mutex<VecDeque<Scripted<SyncResponse>>>,
    stop_when_drained: Mutex<Option<Arc<AtomicBool>>>,
    sync_calls: Mutex<Vec<Option<String>>>,
    joined: Mutex<Option<Vec<String>>>,
    pages: Mutex<HashMap<String, VecDeque<Scripted<MessagesPage>>>>,
    page_calls: Mutex<Vec<(String, Option<String>)>>,
    names: Mutex<HashMap<String, VecDeque<Scripted<Option<String>>>>>,
    name_calls: AtomicUsize,
    members: Mutex<HashMap<String, Vec<String>>>,
    member_calls: Mutex<Vec<String>>,
    crypto_failures: AtomicUsize,
    crypto_requests: Mutex<Vec<OutgoingRequest>>,
    sent: Mutex<Vec<(String, Value)>>,
    redactions: Mutex<Vec<(String, String)>>,
}

impl FakeApi {
    pub(crate) fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn push_sync(&self, sync: SyncResponse) {
        self.syncs.lock().push_back(Scripted::Ok(sync));
    }

    pub(crate) fn push_sync_failure(&self) {
        self.syncs.lock().push_back(Scripted::Transient);
    }

    /// Clear `running` once every scripted sync has been served.
    pub(crate) fn stop_when_drained(&self, running: Arc<AtomicBool>) {
        *self.stop_when_drained.lock() = Some(running);
    }

    pub(crate) fn set_joined_rooms(&self, rooms: &[&str]) {
        *self.joined.lock() = Some(rooms.iter().map(|r| r.to_string()).collect());
    }

    pub(crate) fn push_page(&self, room_id: &str, page: MessagesPage) {
        self.pages
            .lock()
            .entry(room_id.to_string())
            .or_default()
            .push_back(Scripted::Ok(page));
    }

    pub(crate) fn push_page_failure(&self, room_id: &str) {
        self.pages
            .lock()
            .entry(room_id.to_string())
            .or_default()
            .push_back(Scripted::Transient);
    }

    pub(crate) fn push_room_name(&self, room_id: &str, name: Option<&str>) {
        self.names
            .lock()
            .entry(room_id.to_string())
            .or_default()
            .push_back(Scripted::Ok(name.map(str::to_string)));
    }

    pub(crate) fn push_room_name_failure(&self, room_id: &str) {
        self.names
            .lock()
            .entry(room_id.to_string())
            .or_default()
            .push_back(Scripted::Transient);
    }

    pub(crate) fn set_members(&self, room_id: &str, members: &[&str]) {
        self.members.lock().insert(
            room_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub(crate) fn fail_next_crypto_requests(&self, count: usize) {
        self.crypto_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn sync_calls(&self) -> Vec<Option<String>> {
        self.sync_calls.lock().clone()
    }

    pub(crate) fn page_calls(&self) -> Vec<(String, Option<String>)> {
        self.page_calls.lock().clone()
    }

    pub(crate) fn name_calls(&self) -> usize {
        self.name_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn member_calls(&self) -> Vec<String> {
        self.member_calls.lock().clone()
    }

    pub(crate) fn crypto_requests(&self) -> Vec<OutgoingRequest> {
        self.crypto_requests.lock().clone()
    }

    pub(crate) fn sent_messages(&self) -> Vec<(String, Value)> {
        self.sent.lock().clone()
    }

    pub(crate) fn redactions(&self) -> Vec<(String, String)> {
        self.redactions.lock().clone()
    }
}

#[async_trait]
impl HomeserverApi for FakeApi {
    async fn whoami(&self) -> Result<WhoAmI> {
        Ok(WhoAmI {
            user_id: self.user_id.clone(),
            device_id: Some("TESTDEVICE".to_string()),
        })
    }

    async fn sync(&self, since: Option<&str>, _timeout_ms: u64) -> Result<SyncResponse> {
        self.sync_calls.lock().push(since.map(str::to_string));

        let next = self.syncs.lock().pop_front();
        match next {
            Some(scripted) => scripted.into_result(),
            None => {
                if let Some(running) = self.stop_when_drained.lock().as_ref() {
                    running.store(false, Ordering::SeqCst);
                }
                Err(transient())
            }
        }
    }

    async fn joined_rooms(&self) -> Result<Vec<String>> {
        match self.joined.lock().clone() {
            Some(rooms) => Ok(rooms),
            None => Err(transient()),
        }
    }

    async fn room_messages(
        &self,
        room_id: &str,
        request: &MessagesRequest,
    ) -> Result<MessagesPage> {
        self.page_calls
            .lock()
            .push((room_id.to_string(), request.from.clone()));

        let next = self
            .pages
            .lock()
            .get_mut(room_id)
            .and_then(VecDeque::pop_front);
        match next {
            Some(scripted) => scripted.into_result(),
            None => Ok(MessagesPage::default()),
        }
    }

    async fn room_name(&self, room_id: &str) -> Result<Option<String>> {
        self.name_calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .names
            .lock()
            .get_mut(room_id)
            .and_then(VecDeque::pop_front);
        match next {
            Some(scripted) => scripted.into_result(),
            None => Ok(None),
        }
    }

    async fn room_members(&self, room_id: &str) -> Result<Vec<String>> {
        self.member_calls.lock().push(room_id.to_string());
        Ok(self.members.lock().get(room_id).cloned().unwrap_or_default())
    }

    async fn send_crypto_request(&self, request: &OutgoingRequest) -> Result<Value> {
        self.crypto_requests.lock().push(request.clone());
        let remaining = self.crypto_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.crypto_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(transient());
        }
        Ok(json!({}))
    }

    async fn send_message(&self, room_id: &str, content: &Value) -> Result<String> {
        let mut sent = self.sent.lock();
        sent.push((room_id.to_string(), content.clone()));
        Ok(format!("$sent{}", sent.len()))
    }

    async fn redact(&self, room_id: &str, event_id: &str, _reason: Option<&str>) -> Result<()> {
        self.redactions
            .lock()
            .push((room_id.to_string(), event_id.to_string()));
        Ok(())
    }
}

// =============================================================================
// FakeCrypto
// =============================================================================

/// Crypto engine that decrypts only events it was given plaintext for.
#[derive(Default)]
pub(crate) struct FakeCrypto {
    received: Mutex<Vec<SyncChanges>>,
    queue: Mutex<Vec<OutgoingRequest>>,
    marked: Mutex<Vec<String>>,
    tracked: Mutex<Vec<String>>,
    missing: Mutex<Option<OutgoingRequest>>,
    plaintexts: Mutex<HashMap<String, Value>>,
    decrypt_calls: AtomicUsize,
}

impl FakeCrypto {
    pub(crate) fn add_plaintext(&self, event_id: &str, plaintext: Value) {
        self.plaintexts
            .lock()
            .insert(event_id.to_string(), plaintext);
    }

    pub(crate) fn queue_request(&self, request: OutgoingRequest) {
        self.queue.lock().push(request);
    }

    pub(crate) fn set_missing_sessions(&self, request: OutgoingRequest) {
        *self.missing.lock() = Some(request);
    }

    pub(crate) fn received(&self) -> Vec<SyncChanges> {
        self.received.lock().clone()
    }

    pub(crate) fn marked(&self) -> Vec<String> {
        self.marked.lock().clone()
    }

    pub(crate) fn tracked_users(&self) -> Vec<String> {
        self.tracked.lock().clone()
    }

    pub(crate) fn decrypt_calls(&self) -> usize {
        self.decrypt_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CryptoEngine for FakeCrypto {
    async fn receive_sync_changes(&self, changes: SyncChanges) -> Result<()> {
        self.received.lock().push(changes);
        Ok(())
    }

    async fn outgoing_requests(&self) -> Result<Vec<OutgoingRequest>> {
        Ok(self.queue.lock().clone())
    }

    async fn mark_request_as_sent(
        &self,
        request_id: &str,
        _kind: &RequestKind,
        _response: &Value,
    ) -> Result<()> {
        self.queue.lock().retain(|r| r.id != request_id);
        self.marked.lock().push(request_id.to_string());
        Ok(())
    }

    async fn update_tracked_users(&self, users: &[String]) -> Result<()> {
        self.tracked.lock().extend(users.iter().cloned());
        Ok(())
    }

    async fn missing_sessions(&self, _users: &[String]) -> Result<Option<OutgoingRequest>> {
        Ok(self.missing.lock().take())
    }

    async fn decrypt_room_event(&self, event: &Value, _room_id: &str) -> Result<Value> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        let event_id = event
            .get("event_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.plaintexts
            .lock()
            .get(event_id)
            .cloned()
            .ok_or_else(|| Error::Decrypt(format!("no session for {event_id}")))
    }
}
