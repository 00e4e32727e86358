//! Core types and shared utilities for the archivist indexing pipeline.
//!
//! This crate provides:
//! - The room event model and its classification into known event kinds
//! - Search document construction (id normalization, identifier redaction)
//! - Prometheus metrics helpers
//! - Shared error types

mod document;
mod error;
mod event;
pub mod metrics;

pub use document::{
    IndexedDocument, MXID_PLACEHOLDER, normalize_event_id, redact_content, redact_mxids,
};
pub use error::{Error, Result};
pub use event::{
    ENCRYPTED_EVENT_TYPE, EventBody, MESSAGE_EVENT_TYPE, MessageContent, MsgType,
    REACTION_EVENT_TYPE, REDACTION_EVENT_TYPE, REPLACE_REL_TYPE, Relation, RoomEvent,
};
