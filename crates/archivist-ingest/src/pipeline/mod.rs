//! Indexing pipeline shared by both ingestion engines.
//!
//! - [`Coordinator`] - Routes engine events to search storage
//! - [`TaskSupervisor`] - Owns the per-event background tasks
//! - [`RoomNameCache`] - Remembers room display names
//! - [`CommandHandler`] - Answers `last`/`search` commands in the room
//!
//! # Architecture
//!
//! ```text
//! [LiveSync] ──┐
//!              ├──→ [Coordinator] ──spawn──→ [TaskSupervisor]
//! [Backfill] ──┘                                   │
//!                                                  ▼
//!                             edit? delete ──→ [SearchStorage] ←── upsert
//!                                                  ▲
//!                          own command ──→ [CommandHandler] (query)
//! ```
//!
//! Search storage is a derived index: losing it costs a re-crawl, not data.

mod command;
mod coordinator;
mod room_names;
mod supervisor;

pub use command::{Command, CommandHandler, MAX_RESULTS, parse_command, render_pages};
pub use coordinator::{Coordinator, CoordinatorConfig, MessageOutcome, Origin};
pub use room_names::{RoomName, RoomNameCache};
pub use supervisor::TaskSupervisor;
