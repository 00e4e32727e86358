//! Ingestion coordinator.
//!
//! Both engines hand their events to the same [`Coordinator`]. Each event is
//! processed in its own supervised task so the engines never wait on search
//! storage. Per event:
//!
//! 1. Ignore anything that is not an `m.text`/`m.notice` message
//! 2. Intercept live commands from the bot's own account
//! 3. For an `m.replace` edit, delete the replaced document (missing is fine)
//! 4. Resolve the room name and upsert the document
//!
//! Documents can land in storage in a different order than they were
//! discovered. Convergence is eventual. Edited ids are remembered, so an
//! original whose task finishes after its edit's is dropped rather than
//! resurrected.
//!
//! A backend that buffers writes is flushed every
//! [`CoordinatorConfig::flush_interval`] while the engines run, and once more
//! after the final drain.

use super::command::{CommandHandler, parse_command};
use super::room_names::RoomNameCache;
use super::supervisor::TaskSupervisor;
use crate::api::HomeserverApi;
use crate::storage::SearchStorage;
use crate::sync::{Backfill, BackfillStats, LiveSync, LiveSyncStats};
use crate::Result;
use archivist_core::{EventBody, IndexedDocument, MsgType, RoomEvent, normalize_event_id};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Prefix marking the bot's own messages as commands.
    pub command_prefix: String,

    /// Hits per notice page in command replies.
    pub page_size: usize,

    /// Period between search storage flushes while the engines run.
    pub flush_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            command_prefix: "!archivist".to_string(),
            page_size: 20,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Which engine discovered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Live,
    Backfill,
}

/// What [`Coordinator::handle_message`] did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Not an indexable message.
    Ignored,
    /// Upserted under `id`; `replaced` is the normalized id of the edited
    /// event, if any.
    Indexed { id: String, replaced: Option<String> },
    /// Handled as a command; `pages` notices were sent.
    Command { pages: usize },
    /// An edit of this event was already processed; not stored.
    Superseded,
}

struct Inner {
    storage: Arc<dyn SearchStorage>,
    names: RoomNameCache,
    commands: CommandHandler,
    supervisor: TaskSupervisor,
    user_id: String,
    flush_interval: Duration,
    /// Normalized ids replaced by an edit seen this run.
    superseded: Mutex<HashSet<String>>,
}

/// Routes events from both engines into search storage.
///
/// Cheap to clone; clones share the room-name cache and task supervisor.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// # Arguments
    ///
    /// * `api` - homeserver access for room names and command replies
    /// * `storage` - search backend
    /// * `user_id` - the bot's own account, the only one allowed to issue commands
    pub fn new(
        api: Arc<dyn HomeserverApi>,
        storage: Arc<dyn SearchStorage>,
        user_id: impl Into<String>,
        config: CoordinatorConfig,
    ) -> Self {
        let commands = CommandHandler::new(
            api.clone(),
            storage.clone(),
            config.command_prefix,
            config.page_size,
        );
        Self {
            inner: Arc::new(Inner {
                storage,
                names: RoomNameCache::new(api),
                commands,
                supervisor: TaskSupervisor::new(),
                user_id: user_id.into(),
                flush_interval: config.flush_interval,
                superseded: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.inner.supervisor
    }

    pub fn room_names(&self) -> &RoomNameCache {
        &self.inner.names
    }

    /// Process `event` in the background.
    pub fn dispatch(&self, room_id: &str, event: RoomEvent, origin: Origin) {
        let this = self.clone();
        let room_id = room_id.to_string();
        let label = format!("Indexing {} from {}", event.event_id, room_id);

        self.inner.supervisor.spawn(label, async move {
            this.handle_message(&room_id, event, origin).await?;
            Ok(())
        });
    }

    /// An engine handler that dispatches every event and never stops.
    pub fn handler(
        &self,
        origin: Origin,
    ) -> impl FnMut(&str, RoomEvent) -> Result<bool> + Send + 'static {
        let this = self.clone();
        move |room_id: &str, event: RoomEvent| {
            this.dispatch(room_id, event, origin);
            Ok(true)
        }
    }

    /// Process one event to completion.
    pub async fn handle_message(
        &self,
        room_id: &str,
        event: RoomEvent,
        origin: Origin,
    ) -> Result<MessageOutcome> {
        let message = match event.body() {
            EventBody::Message(message) if message.msgtype.is_indexable() => message,
            _ => return Ok(MessageOutcome::Ignored),
        };

        if event.sender == self.inner.user_id {
            if let Some(command) = parse_command(self.inner.commands.prefix(), &message.body) {
                if origin == Origin::Backfill {
                    return Ok(MessageOutcome::Ignored);
                }
                let pages = self
                    .inner
                    .commands
                    .handle(room_id, &event.event_id, command)
                    .await?;
                return Ok(MessageOutcome::Command { pages });
            }
            // Command replies.
            if message.msgtype == MsgType::Notice {
                return Ok(MessageOutcome::Ignored);
            }
        }

        let replaced = event
            .replaced_event_id()
            .map(|target| normalize_event_id(&target));
        if let Some(target) = &replaced {
            // Recorded before the delete so a concurrent upsert of the
            // original sees it on its re-check.
            self.inner.superseded.lock().insert(target.clone());
            match self.inner.storage.delete(target).await {
                Ok(()) => {
                    counter!("index_documents_deleted_total").increment(1);
                    tracing::debug!("Removed {} superseded by {}", target, event.event_id);
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Edited document {} was not indexed", target);
                }
                Err(e) => {
                    tracing::warn!("Failed to remove edited document {}: {}", target, e);
                }
            }
        }

        let id = normalize_event_id(&event.event_id);
        if self.is_superseded(&id) {
            tracing::debug!("Skipping {}; already replaced by an edit", event.event_id);
            return Ok(MessageOutcome::Superseded);
        }

        let room_name = self.inner.names.resolve(room_id).await;
        let document = IndexedDocument::from_event(&event, room_id, room_name);
        self.inner.storage.upsert(&document).await?;
        counter!("index_documents_upserted_total").increment(1);

        // The edit may have been handled while this upsert was in flight.
        if self.is_superseded(&document.id) {
            match self.inner.storage.delete(&document.id).await {
                Ok(()) => counter!("index_documents_deleted_total").increment(1),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            tracing::debug!("Removed {} after a concurrent edit", document.id);
            return Ok(MessageOutcome::Superseded);
        }

        Ok(MessageOutcome::Indexed {
            id: document.id,
            replaced,
        })
    }

    fn is_superseded(&self, id: &str) -> bool {
        self.inner.superseded.lock().contains(id)
    }

    /// Run live sync and (optionally) backfill concurrently.
    ///
    /// Returns when live sync stops and backfill has finished, or as soon as
    /// either fails. In-flight index tasks are drained and search storage is
    /// flushed before returning.
    pub async fn run(
        &self,
        live: &LiveSync,
        backfill: Option<&Backfill>,
    ) -> Result<(LiveSyncStats, Option<BackfillStats>)> {
        let live_run = live.run(self.handler(Origin::Live));
        let backfill_run = async {
            match backfill {
                Some(backfill) => backfill.run(self.handler(Origin::Backfill)).await.map(Some),
                None => Ok(None),
            }
        };
        let engines = async { tokio::try_join!(live_run, backfill_run) };
        tokio::pin!(engines);

        let mut flush_timer = tokio::time::interval(self.inner.flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                result = &mut engines => break result,
                _ = flush_timer.tick() => {
                    if let Err(e) = self.inner.storage.flush().await {
                        tracing::warn!("Failed to flush search storage: {}", e);
                    }
                }
            }
        };

        let drained = self.inner.supervisor.drain().await;
        tracing::info!(
            "Drained {} index tasks ({} failed in total)",
            drained,
            self.inner.supervisor.failures()
        );

        let flushed = self.inner.storage.flush().await;
        let stats = result?;
        flushed.inspect_err(|e| tracing::error!("Failed to save search storage: {}", e))?;
        Ok(stats)
    }
}
