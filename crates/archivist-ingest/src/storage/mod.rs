//! Search storage collaborators.
//!
//! The indexer only needs three operations from a search backend: upsert a
//! document by id, delete a document by id, and run a filtered term query.
//! Two backends are provided:
//!
//! - [`MemoryStorage`] - process-local map, used when no search server is
//!   configured and in tests; optionally snapshotted to a JSON file
//! - [`MeilisearchStorage`] - Meilisearch over its HTTP API

mod meilisearch;
mod memory;

pub use meilisearch::{MeilisearchConfig, MeilisearchStorage};
pub use memory::MemoryStorage;

use crate::Result;
use archivist_core::IndexedDocument;
use async_trait::async_trait;

/// Default number of hits returned by a query.
pub const DEFAULT_QUERY_LIMIT: usize = 20;

/// Attribute filters applied to a query. All present filters must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub room_id: Option<String>,
    pub sender: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.room_id.is_none() && self.sender.is_none()
    }
}

/// A term query. An empty term matches every document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub term: String,
    pub filters: SearchFilters,
    pub limit: usize,
}

impl SearchQuery {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            filters: SearchFilters::default(),
            limit: DEFAULT_QUERY_LIMIT,
        }
    }

    pub fn in_room(mut self, room_id: impl Into<String>) -> Self {
        self.filters.room_id = Some(room_id.into());
        self
    }

    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.filters.sender = Some(sender.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// A search backend holding [`IndexedDocument`]s.
#[async_trait]
pub trait SearchStorage: Send + Sync {
    /// Insert or replace the document with `document.id`.
    async fn upsert(&self, document: &IndexedDocument) -> Result<()>;

    /// Remove a document.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StorageNotFound`] if no document has this id
    /// and the backend can tell.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Matching documents, newest first, at most `query.limit`.
    async fn query(&self, query: &SearchQuery) -> Result<Vec<IndexedDocument>>;

    /// Make accepted writes durable. Backends that persist on every write
    /// have nothing to do.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
