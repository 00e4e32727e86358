//! Ingestion engines.
//!
//! Live sync and backfill run concurrently over the same account. Both
//! decrypt through the shared [`CryptoOrchestrator`] and feed the **same
//! event handler**; each keeps its own checkpoint.
//!
//! ```text
//! ┌──────────────────┐       ┌──────────────────┐
//! │    Live Sync     │       │     Backfill     │
//! │   (long-poll)    │       │  (one-shot crawl)│
//! └────────┬─────────┘       └────────┬─────────┘
//!          │ bot.json                 │ backfillState.json
//!          │                          │
//!          │ (room, event)            │ (room, event)
//!          └──────────┬───────────────┘
//!                     │
//!                     ▼
//!          ┌──────────────────────────┐
//!          │   Shared Event Handler   │
//!          │  (coordinator dispatch)  │
//!          └──────────────────────────┘
//! ```
//!
//! The two paths may see the same event during warm-up. The handler relies
//! on idempotent upserts rather than coordination between the engines.
//!
//! [`CryptoOrchestrator`]: crate::crypto::CryptoOrchestrator

pub mod backfill;
pub mod live;

pub use backfill::{Backfill, BackfillConfig, BackfillStats, EditTracker, HistoryPager};
pub use live::{LiveSync, LiveSyncConfig, LiveSyncStats, PollOutcome, SyncPhase};
