//! Archivist ingestion components.
//!
//! This crate keeps a search index of the messages in every room a Matrix
//! account has joined, from the beginning of each room's history onward.
//!
//! # Modules
//!
//! - [`transport`] - Authenticated client-server HTTP calls and retry
//! - [`api`] - Typed homeserver endpoints behind [`HomeserverApi`]
//! - [`crypto`] - End-to-end encryption orchestration
//! - [`checkpoint`] - Durable sync cursor and backfill progress
//! - [`sync`] - Live sync and backfill engines
//! - [`pipeline`] - Event routing, indexing and bot commands
//! - [`storage`] - Search backends
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Homeserver    │  /sync, /messages, /keys/*
//! └────────┬────────┘
//!          │ Transport (bearer auth, timeouts, retry)
//!          ▼
//! ┌─────────────────┐
//! │ CryptoOrchestr. │  to-device + key traffic, decryption
//! └────────┬────────┘
//!          │
//!    ┌─────┴──────┐
//!    ▼            ▼
//! ┌────────┐  ┌──────────┐
//! │LiveSync│  │ Backfill │  bot.json / backfillState.json
//! └───┬────┘  └────┬─────┘
//!     └──────┬─────┘
//!            ▼
//! ┌─────────────────┐
//! │   Coordinator   │  edits, commands, room names
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │  SearchStorage  │  Meilisearch (or in-memory)
//! └─────────────────┘
//! ```

pub mod api;
pub mod checkpoint;
pub mod crypto;
pub mod error;
pub mod pipeline;
pub mod storage;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use api::{HomeserverApi, HomeserverClient};
pub use checkpoint::{BackfillState, BackfillStore, CursorStore, SyncCursor};
pub use crypto::{CryptoEngine, CryptoOrchestrator, NullCryptoEngine, OlmEngine};
pub use pipeline::{Coordinator, CoordinatorConfig, Origin, TaskSupervisor};
pub use storage::{MeilisearchConfig, MeilisearchStorage, MemoryStorage, SearchQuery, SearchStorage};
pub use sync::{Backfill, BackfillConfig, BackfillStats, LiveSync, LiveSyncConfig, LiveSyncStats};
pub use transport::{RetryPolicy, Transport, TransportConfig};
