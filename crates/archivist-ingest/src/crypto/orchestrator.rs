//! Drives a [`CryptoEngine`] against the homeserver.

use super::engine::{CryptoEngine, RequestKind, SyncChanges};
use crate::api::{HomeserverApi, SyncResponse};
use crate::transport::{RetryPolicy, with_retry};
use crate::Result;
use archivist_core::RoomEvent;
use metrics::counter;
use std::sync::Arc;

/// Outcome of one [`CryptoOrchestrator::flush_outgoing`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Requests delivered and acknowledged to the engine.
    pub sent: usize,
    /// Requests that failed; the engine re-queues them for the next pass.
    pub failed: usize,
    /// Requests of unknown type, never delivered.
    pub dropped: usize,
}

/// Orchestrates device tracking, key traffic and decryption.
///
/// Per-room device membership is not cached: it is refreshed every time an
/// encrypted event from that room needs decrypting.
pub struct CryptoOrchestrator {
    engine: Arc<dyn CryptoEngine>,
    api: Arc<dyn HomeserverApi>,
    claim_retry: RetryPolicy,
}

impl CryptoOrchestrator {
    pub fn new(engine: Arc<dyn CryptoEngine>, api: Arc<dyn HomeserverApi>) -> Self {
        Self {
            engine,
            api,
            claim_retry: RetryPolicy::KEY_CLAIM,
        }
    }

    /// Override the retry policy used for one-time key claims.
    pub fn with_claim_retry(mut self, policy: RetryPolicy) -> Self {
        self.claim_retry = policy;
        self
    }

    /// Whether the engine can decrypt anything.
    pub fn decrypts(&self) -> bool {
        self.engine.decrypts()
    }

    /// Feed the crypto-relevant parts of a sync response to the engine.
    pub async fn receive_sync(&self, sync: &SyncResponse) -> Result<()> {
        self.engine
            .receive_sync_changes(SyncChanges::from(sync))
            .await
    }

    /// Deliver every request the engine has queued.
    ///
    /// Failures never propagate: a request that could not be delivered stays
    /// in the engine's queue and is picked up by the next call. Unknown
    /// request types are dropped.
    pub async fn flush_outgoing(&self) -> FlushStats {
        let mut stats = FlushStats::default();

        let requests = match self.engine.outgoing_requests().await {
            Ok(requests) => requests,
            Err(e) => {
                tracing::warn!("Failed to read outgoing crypto requests: {}", e);
                return stats;
            }
        };

        for request in requests {
            if let RequestKind::Unknown(tag) = &request.kind {
                tracing::warn!(
                    "Dropping outgoing crypto request {} of unknown type {}",
                    request.id,
                    tag
                );
                counter!("crypto_requests_dropped_total").increment(1);
                stats.dropped += 1;
                continue;
            }

            let response = match self.api.send_crypto_request(&request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        "Crypto request {} ({}) failed, retrying next sync: {}",
                        request.id,
                        request.kind,
                        e
                    );
                    counter!("crypto_requests_failed_total").increment(1);
                    stats.failed += 1;
                    continue;
                }
            };

            match self
                .engine
                .mark_request_as_sent(&request.id, &request.kind, &response)
                .await
            {
                Ok(()) => {
                    counter!("crypto_requests_sent_total", "kind" => request.kind.label())
                        .increment(1);
                    stats.sent += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Engine rejected response for crypto request {}: {}",
                        request.id,
                        e
                    );
                    stats.failed += 1;
                }
            }
        }

        if stats.sent + stats.failed + stats.dropped > 0 {
            tracing::debug!(
                "Crypto flush: {} sent, {} failed, {} dropped",
                stats.sent,
                stats.failed,
                stats.dropped
            );
        }

        stats
    }

    /// Decrypt `event` if it is encrypted.
    ///
    /// Plaintext events are returned untouched. When decryption fails the
    /// original envelope is returned, which downstream treats as unreadable.
    pub async fn decrypt(&self, event: RoomEvent, room_id: &str) -> RoomEvent {
        if !event.is_encrypted() {
            return event;
        }

        if let Err(e) = self.prepare_room(room_id).await {
            tracing::debug!("Device tracking for {} incomplete: {}", room_id, e);
        }

        match self.try_decrypt(&event, room_id).await {
            Ok(decrypted) => decrypted,
            Err(e) => {
                tracing::warn!(
                    "Unable to decrypt {} in {}: {}",
                    event.event_id,
                    room_id,
                    e
                );
                counter!("crypto_decrypt_failures_total").increment(1);
                event
            }
        }
    }

    async fn try_decrypt(&self, event: &RoomEvent, room_id: &str) -> Result<RoomEvent> {
        let raw = event.to_value()?;
        let plaintext = self.engine.decrypt_room_event(&raw, room_id).await?;
        Ok(event.clone().with_decrypted(&plaintext)?)
    }

    /// Track the room's joined and invited members and claim any missing
    /// Olm sessions.
    async fn prepare_room(&self, room_id: &str) -> Result<()> {
        let members = self.api.room_members(room_id).await?;
        self.engine.update_tracked_users(&members).await?;

        if let Some(claim) = self.engine.missing_sessions(&members).await? {
            let response = with_retry("key claim", self.claim_retry, || {
                self.api.send_crypto_request(&claim)
            })
            .await?;
            self.engine
                .mark_request_as_sent(&claim.id, &claim.kind, &response)
                .await?;
        }

        Ok(())
    }
}
