//! Live sync engine.
//!
//! Long-polls the homeserver from the persisted cursor and hands every
//! decrypted timeline event to a handler. One loop iteration:
//!
//! 1. Load the cursor and poll with `since = cursor.current`
//! 2. On failure, wait and loop again with nothing mutated
//! 3. Feed the crypto slice of the response to the engine and flush its
//!    outgoing requests
//! 4. If the response token was already processed, skip its events
//! 5. Otherwise decrypt and dispatch each room's timeline in order
//! 6. Persist the advanced cursor
//!
//! Crypto state advances even for re-sent pages; only indexing is gated by
//! the duplicate check. A cursor write failure stops the engine.

use crate::api::HomeserverApi;
use crate::checkpoint::{CursorStore, SyncCursor};
use crate::crypto::CryptoOrchestrator;
use crate::Result;
use archivist_core::RoomEvent;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Configuration for the live sync loop.
#[derive(Debug, Clone)]
pub struct LiveSyncConfig {
    /// How long the server may hold a poll open waiting for events.
    pub poll_timeout: Duration,

    /// Pause after a failed poll before trying again.
    pub retry_delay: Duration,
}

impl Default for LiveSyncConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Stopped,
    Polling,
    Processing,
}

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A new page was processed.
    Processed { events: usize },
    /// The page was a re-send of one already processed.
    Duplicate,
    /// The poll failed and will be retried.
    Failed,
    /// The handler asked to stop.
    Stopped,
}

/// Counters accumulated over a live sync run.
#[derive(Debug, Clone, Default)]
pub struct LiveSyncStats {
    pub polls: usize,
    pub poll_errors: usize,
    pub duplicate_pages: usize,
    pub events_dispatched: usize,
    pub malformed_events: usize,
    /// Token of the last processed page.
    pub last_token: Option<String>,
}

/// Live sync engine.
pub struct LiveSync {
    api: Arc<dyn HomeserverApi>,
    crypto: Arc<CryptoOrchestrator>,
    store: CursorStore,
    config: LiveSyncConfig,
    running: Arc<AtomicBool>,
    phase: Mutex<SyncPhase>,
}

impl LiveSync {
    /// Create the engine. It runs while `running` is set.
    pub fn new(
        api: Arc<dyn HomeserverApi>,
        crypto: Arc<CryptoOrchestrator>,
        store: CursorStore,
        config: LiveSyncConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            api,
            crypto,
            store,
            config,
            running,
            phase: Mutex::new(SyncPhase::Stopped),
        }
    }

    /// Current phase of the loop.
    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the loop to exit at its next iteration boundary.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.lock() = phase;
    }

    /// Run until stopped or a fatal error occurs.
    ///
    /// The handler receives `(room_id, event)` pairs in room order, then
    /// timeline order within a room. Returning `Ok(false)` stops the loop.
    ///
    /// # Errors
    ///
    /// Returns the first checkpoint error (always fatal) or handler error.
    pub async fn run<F>(&self, mut handler: F) -> Result<LiveSyncStats>
    where
        F: FnMut(&str, RoomEvent) -> Result<bool> + Send,
    {
        let mut stats = LiveSyncStats::default();

        tracing::info!(
            "Starting live sync (poll timeout {:?})",
            self.config.poll_timeout
        );
        gauge!("sync_running").set(1.0);

        while self.is_running() {
            match self.poll_once(&mut handler, &mut stats).await {
                Ok(PollOutcome::Failed) => {
                    if self.is_running() {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
                Ok(PollOutcome::Stopped) => break,
                Ok(PollOutcome::Processed { .. } | PollOutcome::Duplicate) => {}
                Err(e) => {
                    if e.is_fatal() {
                        tracing::error!("Live sync stopping on checkpoint failure: {}", e);
                    } else {
                        tracing::error!("Live sync stopping: {}", e);
                    }
                    self.set_phase(SyncPhase::Stopped);
                    gauge!("sync_running").set(0.0);
                    return Err(e);
                }
            }
        }

        self.set_phase(SyncPhase::Stopped);
        gauge!("sync_running").set(0.0);
        tracing::info!(
            "Live sync stopped: {} polls, {} errors, {} duplicate pages, {} events",
            stats.polls,
            stats.poll_errors,
            stats.duplicate_pages,
            stats.events_dispatched
        );

        Ok(stats)
    }

    /// Perform one poll and process its result.
    pub async fn poll_once<F>(
        &self,
        handler: &mut F,
        stats: &mut LiveSyncStats,
    ) -> Result<PollOutcome>
    where
        F: FnMut(&str, RoomEvent) -> Result<bool> + Send,
    {
        let cursor = self.store.load()?;

        self.set_phase(SyncPhase::Polling);
        stats.polls += 1;
        counter!("sync_polls_total").increment(1);

        let since = cursor.as_ref().map(|c| c.current.as_str());
        let timeout_ms = self.config.poll_timeout.as_millis() as u64;
        let sync = match self.api.sync(since, timeout_ms).await {
            Ok(sync) => sync,
            Err(e) => {
                tracing::warn!("Sync poll failed: {}", e);
                stats.poll_errors += 1;
                counter!("sync_poll_errors_total").increment(1);
                return Ok(PollOutcome::Failed);
            }
        };

        self.set_phase(SyncPhase::Processing);

        if let Err(e) = self.crypto.receive_sync(&sync).await {
            tracing::warn!("Crypto engine rejected sync changes: {}", e);
        }
        self.crypto.flush_outgoing().await;

        let next = sync.next_batch;
        if let Some(cursor) = &cursor
            && cursor.is_duplicate(&next)
        {
            tracing::debug!("Sync token {} already processed, skipping page", next);
            stats.duplicate_pages += 1;
            counter!("sync_duplicate_pages_total").increment(1);
            self.store.save(cursor)?;
            return Ok(PollOutcome::Duplicate);
        }

        let mut dispatched = 0usize;
        for (room_id, room) in sync.rooms.join {
            for raw in room.timeline.events {
                let event = match RoomEvent::from_value(raw) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::debug!("Skipping malformed event in {}: {}", room_id, e);
                        stats.malformed_events += 1;
                        continue;
                    }
                };

                let event = self.crypto.decrypt(event, &room_id).await;
                dispatched += 1;
                stats.events_dispatched += 1;
                counter!("sync_events_total").increment(1);

                if !handler(&room_id, event)? {
                    // Leave the cursor where it was so the page is delivered
                    // again after restart.
                    tracing::info!("Event handler signaled stop");
                    self.stop();
                    return Ok(PollOutcome::Stopped);
                }
            }
        }

        let advanced = match &cursor {
            Some(cursor) => cursor.advance(next.clone()),
            None => SyncCursor::new(next.clone()),
        };
        self.store.save(&advanced)?;
        stats.last_token = Some(next);

        if dispatched > 0 {
            tracing::debug!("Dispatched {} live events", dispatched);
        }

        Ok(PollOutcome::Processed { events: dispatched })
    }
}
