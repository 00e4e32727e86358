//! Encryption orchestration.
//!
//! The cryptographic primitives live behind [`CryptoEngine`]. This module
//! owns everything around them: feeding sync deltas into the engine,
//! delivering the engine's outgoing requests to the homeserver, preparing a
//! room's device list before a decrypt, and degrading decrypt failures into
//! unreadable events instead of errors.

mod engine;
mod olm;
mod orchestrator;

pub use engine::{CryptoEngine, NullCryptoEngine, OutgoingRequest, RequestKind, SyncChanges};
pub use olm::OlmEngine;
pub use orchestrator::{CryptoOrchestrator, FlushStats};
