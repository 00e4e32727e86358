//! One-shot historical backfill.
//!
//! For every joined room that is not yet marked complete, history is paged
//! backward from the present to the room's creation. Each page is fetched
//! with a bounded retry. Because history arrives newest first, an edit is
//! always seen before the event it replaces, so the replaced id is recorded
//! and skipped when the scan reaches it.
//!
//! A room enters the completion set only after its last page, and the set is
//! persisted immediately. A room with encrypted history is left incomplete
//! when no crypto engine is configured, so a later run with one can still
//! index it. Progress within a room is not checkpointed: a room
//! interrupted mid-scan is crawled again from the start on the next run.

use crate::api::{HomeserverApi, MessagesRequest};
use crate::checkpoint::{BackfillState, BackfillStore};
use crate::crypto::CryptoOrchestrator;
use crate::transport::{RetryPolicy, with_retry};
use crate::{Error, Result};
use archivist_core::{ENCRYPTED_EVENT_TYPE, MESSAGE_EVENT_TYPE, RoomEvent};
use metrics::{counter, gauge};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Configuration for the backfill engine.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Retry policy for each history page and the joined-rooms lookup.
    pub page_retry: RetryPolicy,

    /// Events requested per page.
    pub page_limit: u32,

    /// Event types requested from the server.
    ///
    /// Encrypted events must be included or encrypted history is filtered
    /// out before it can be decrypted.
    pub event_types: Vec<String>,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            page_retry: RetryPolicy::HISTORY_PAGE,
            page_limit: 100,
            event_types: vec![
                MESSAGE_EVENT_TYPE.to_string(),
                ENCRYPTED_EVENT_TYPE.to_string(),
            ],
        }
    }
}

/// Counters for one backfill run.
#[derive(Debug, Clone, Default)]
pub struct BackfillStats {
    /// Joined rooms at the start of the run.
    pub rooms_total: usize,
    /// Rooms already complete from an earlier run.
    pub rooms_skipped: usize,
    pub rooms_completed: usize,
    /// Rooms abandoned after page retries ran out.
    pub rooms_failed: usize,
    /// Rooms drained but left incomplete because their encrypted history
    /// could not be decrypted without a crypto engine.
    pub rooms_deferred: usize,
    pub pages: usize,
    pub events_dispatched: usize,
    /// Events skipped because a later edit superseded them.
    pub edits_skipped: usize,
    pub duration: Duration,
}

/// Backward page cursor over one room's history.
///
/// Restartable from any token it has handed out, but a fresh pager always
/// starts at the most recent event.
#[derive(Debug, Clone)]
pub struct HistoryPager {
    room_id: String,
    from: Option<String>,
    exhausted: bool,
}

impl HistoryPager {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            from: None,
            exhausted: false,
        }
    }

    /// Token the next page will be requested from.
    pub fn cursor(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Fetch the next page.
    ///
    /// Returns `Ok(None)` once the server stops returning a continuation
    /// token. A continuation equal to the current token also ends the scan.
    pub async fn next_page(
        &mut self,
        api: &dyn HomeserverApi,
        config: &BackfillConfig,
    ) -> Result<Option<Vec<Value>>> {
        if self.exhausted {
            return Ok(None);
        }

        let request = MessagesRequest {
            from: self.from.clone(),
            limit: config.page_limit,
            types: config.event_types.clone(),
        };

        let mut attempts = 0usize;
        let operation = format!("history page for {}", self.room_id);
        let room_id = self.room_id.as_str();
        let result = with_retry(&operation, config.page_retry, || {
            attempts += 1;
            api.room_messages(room_id, &request)
        })
        .await;

        if attempts > 1 {
            counter!("backfill_page_retries_total").increment((attempts - 1) as u64);
        }
        let page = result?;

        match page.end {
            Some(end) if self.from.as_deref() != Some(end.as_str()) => self.from = Some(end),
            _ => self.exhausted = true,
        }

        Ok(Some(page.chunk))
    }
}

/// Ids of events superseded by an edit seen earlier in the same run.
#[derive(Debug, Default)]
pub struct EditTracker {
    superseded: HashSet<String>,
}

impl EditTracker {
    pub fn is_superseded(&self, event_id: &str) -> bool {
        self.superseded.contains(event_id)
    }

    /// Record the target of `event` if it is an edit. Returns whether it was.
    pub fn record(&mut self, event: &RoomEvent) -> bool {
        match event.replaced_event_id() {
            Some(target) => {
                self.superseded.insert(target);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.superseded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.superseded.is_empty()
    }
}

enum RoomOutcome {
    Complete,
    /// Drained, but `undecrypted` events need a crypto engine.
    Deferred {
        undecrypted: usize,
    },
    Failed(Error),
    Interrupted,
}

/// Backfill engine.
pub struct Backfill {
    api: Arc<dyn HomeserverApi>,
    crypto: Arc<CryptoOrchestrator>,
    store: BackfillStore,
    config: BackfillConfig,
    running: Arc<AtomicBool>,
}

impl Backfill {
    pub fn new(
        api: Arc<dyn HomeserverApi>,
        crypto: Arc<CryptoOrchestrator>,
        store: BackfillStore,
        config: BackfillConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            api,
            crypto,
            store,
            config,
            running,
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Crawl every incomplete joined room once.
    ///
    /// The handler receives `(room_id, event)` pairs newest first. Returning
    /// `Ok(false)` stops the whole process.
    ///
    /// # Errors
    ///
    /// Returns checkpoint errors (fatal) and handler errors. Network trouble
    /// is logged and costs at most the affected room.
    pub async fn run<F>(&self, mut handler: F) -> Result<BackfillStats>
    where
        F: FnMut(&str, RoomEvent) -> Result<bool> + Send,
    {
        let start = Instant::now();
        let mut stats = BackfillStats::default();
        let mut state = self.store.load()?;

        let rooms = match with_retry("joined rooms", self.config.page_retry, || {
            self.api.joined_rooms()
        })
        .await
        {
            Ok(rooms) => rooms,
            Err(e) => {
                tracing::warn!("Skipping backfill, cannot list joined rooms: {}", e);
                return Ok(stats);
            }
        };

        stats.rooms_total = rooms.len();
        tracing::info!(
            "Starting backfill of {} rooms ({} already complete)",
            rooms.len(),
            rooms.iter().filter(|r| state.is_complete(r)).count()
        );
        gauge!("backfill_running").set(1.0);

        let mut edits = EditTracker::default();
        let result = self
            .crawl(&rooms, &mut state, &mut edits, &mut handler, &mut stats)
            .await;

        gauge!("backfill_running").set(0.0);
        stats.duration = start.elapsed();
        result?;

        tracing::info!(
            "Backfill finished in {:?}: {} rooms completed, {} skipped, {} failed, {} deferred, {} pages, {} events, {} superseded",
            stats.duration,
            stats.rooms_completed,
            stats.rooms_skipped,
            stats.rooms_failed,
            stats.rooms_deferred,
            stats.pages,
            stats.events_dispatched,
            stats.edits_skipped
        );

        Ok(stats)
    }

    async fn crawl<F>(
        &self,
        rooms: &[String],
        state: &mut BackfillState,
        edits: &mut EditTracker,
        handler: &mut F,
        stats: &mut BackfillStats,
    ) -> Result<()>
    where
        F: FnMut(&str, RoomEvent) -> Result<bool> + Send,
    {
        for room_id in rooms {
            if !self.is_running() {
                tracing::info!("Backfill interrupted by shutdown");
                break;
            }
            if state.is_complete(room_id) {
                stats.rooms_skipped += 1;
                continue;
            }

            match self.backfill_room(room_id, edits, handler, stats).await? {
                RoomOutcome::Complete => {
                    state.mark_complete(room_id);
                    self.store.save(state).inspect_err(|e| {
                        tracing::error!("Backfill stopping on checkpoint failure: {}", e);
                    })?;
                    stats.rooms_completed += 1;
                    counter!("backfill_rooms_completed_total").increment(1);
                    tracing::info!("Backfilled {}", room_id);
                }
                RoomOutcome::Deferred { undecrypted } => {
                    tracing::warn!(
                        "Leaving {} incomplete: {} encrypted events need a crypto engine",
                        room_id,
                        undecrypted
                    );
                    stats.rooms_deferred += 1;
                }
                RoomOutcome::Failed(e) => {
                    tracing::warn!("Abandoning backfill of {} until next start: {}", room_id, e);
                    stats.rooms_failed += 1;
                    counter!("backfill_rooms_failed_total").increment(1);
                }
                RoomOutcome::Interrupted => break,
            }
        }
        Ok(())
    }

    fn drained(&self, undecrypted: usize) -> RoomOutcome {
        if undecrypted > 0 && !self.crypto.decrypts() {
            RoomOutcome::Deferred { undecrypted }
        } else {
            RoomOutcome::Complete
        }
    }

    async fn backfill_room<F>(
        &self,
        room_id: &str,
        edits: &mut EditTracker,
        handler: &mut F,
        stats: &mut BackfillStats,
    ) -> Result<RoomOutcome>
    where
        F: FnMut(&str, RoomEvent) -> Result<bool> + Send,
    {
        let mut pager = HistoryPager::new(room_id);
        let mut undecrypted = 0usize;

        loop {
            if pager.is_exhausted() {
                return Ok(self.drained(undecrypted));
            }
            if !self.is_running() {
                return Ok(RoomOutcome::Interrupted);
            }

            let chunk = match pager.next_page(self.api.as_ref(), &self.config).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return Ok(self.drained(undecrypted)),
                Err(e) => return Ok(RoomOutcome::Failed(e)),
            };
            stats.pages += 1;
            counter!("backfill_pages_total").increment(1);
            tracing::debug!(
                "Backfill page {} of {}: {} events",
                stats.pages,
                room_id,
                chunk.len()
            );

            for raw in chunk {
                let event = match RoomEvent::from_value(raw) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::debug!("Skipping malformed history event in {}: {}", room_id, e);
                        continue;
                    }
                };

                if edits.is_superseded(&event.event_id) {
                    stats.edits_skipped += 1;
                    counter!("backfill_edits_skipped_total").increment(1);
                    continue;
                }

                // Encrypted envelopes carry the relation in cleartext; the
                // plaintext may carry it too.
                edits.record(&event);
                let event = self.crypto.decrypt(event, room_id).await;
                edits.record(&event);
                if event.is_encrypted() {
                    undecrypted += 1;
                }

                stats.events_dispatched += 1;
                counter!("backfill_events_total").increment(1);

                if !handler(room_id, event)? {
                    tracing::info!("Event handler signaled stop");
                    self.running.store(false, Ordering::SeqCst);
                    return Ok(RoomOutcome::Interrupted);
                }
            }
        }
    }
}
