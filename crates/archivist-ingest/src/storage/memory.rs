//! In-process search storage.
//!
//! Opened with a snapshot path, the map is written to that file on
//! [`SearchStorage::flush`] and reloaded on the next start, so the index
//! keeps up with checkpoints that skip already-seen history.

use super::{SearchQuery, SearchStorage};
use crate::checkpoint::{read_json, write_json_atomic};
use crate::{Error, Result};
use archivist_core::IndexedDocument;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Search storage backed by a map keyed by document id.
///
/// Matching is a case-insensitive substring test on the document body.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    documents: RwLock<HashMap<String, IndexedDocument>>,
    snapshot: Option<PathBuf>,
    dirty: AtomicBool,
}

impl MemoryStorage {
    /// Volatile storage; nothing survives the process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage snapshotted to `path`, loading the previous snapshot if any.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot exists but cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let documents: Vec<IndexedDocument> = read_json(&path)?.unwrap_or_default();

        tracing::info!(
            "Loaded {} indexed documents from {}",
            documents.len(),
            path.display()
        );

        Ok(Self {
            documents: RwLock::new(
                documents
                    .into_iter()
                    .map(|doc| (doc.id.clone(), doc))
                    .collect(),
            ),
            snapshot: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn get(&self, id: &str) -> Option<IndexedDocument> {
        self.documents.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Sorted ids of every stored document.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn matches(document: &IndexedDocument, query: &SearchQuery, term: &str) -> bool {
    if let Some(room_id) = &query.filters.room_id
        && document.room_id != *room_id
    {
        return false;
    }
    if let Some(sender) = &query.filters.sender
        && document.sender != *sender
    {
        return false;
    }
    term.is_empty()
        || document
            .body()
            .is_some_and(|body| body.to_lowercase().contains(term))
}

#[async_trait]
impl SearchStorage for MemoryStorage {
    async fn upsert(&self, document: &IndexedDocument) -> Result<()> {
        self.documents
            .write()
            .insert(document.id.clone(), document.clone());
        self.touch();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match self.documents.write().remove(id) {
            Some(_) => {
                self.touch();
                Ok(())
            }
            None => Err(Error::StorageNotFound(id.to_string())),
        }
    }

    async fn query(&self, query: &SearchQuery) -> Result<Vec<IndexedDocument>> {
        let term = query.term.trim().to_lowercase();
        let mut hits: Vec<IndexedDocument> = self
            .documents
            .read()
            .values()
            .filter(|doc| matches(doc, query, &term))
            .cloned()
            .collect();

        hits.sort_by(|a, b| {
            b.origin_server_ts
                .cmp(&a.origin_server_ts)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut documents: Vec<IndexedDocument> =
            self.documents.read().values().cloned().collect();
        documents.sort_by(|a, b| a.id.cmp(&b.id));

        if let Err(e) = write_json_atomic(path, &documents) {
            self.touch();
            return Err(e);
        }
        tracing::debug!("Saved {} indexed documents", documents.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value, json};
    use tempfile::TempDir;

    fn doc(id: &str, room: &str, sender: &str, body: &str, ts: i64) -> IndexedDocument {
        let mut content = Map::new();
        content.insert("msgtype".to_string(), json!("m.text"));
        content.insert("body".to_string(), Value::String(body.to_string()));
        IndexedDocument {
            id: id.to_string(),
            sender: sender.to_string(),
            content,
            room_id: room.to_string(),
            origin_server_ts: ts,
            room_name: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let storage = MemoryStorage::new();
        let d = doc("a", "!r", "@u", "hello", 1);

        storage.upsert(&d).await.unwrap();
        let once = storage.ids();
        storage.upsert(&d).await.unwrap();

        assert_eq!(storage.ids(), once);
        assert_eq!(storage.get("a"), Some(d));
    }

    #[tokio::test]
    async fn test_upsert_last_write_wins() {
        let storage = MemoryStorage::new();
        storage.upsert(&doc("a", "!r", "@u", "first", 1)).await.unwrap();
        storage.upsert(&doc("a", "!r", "@u", "second", 1)).await.unwrap();

        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get("a").unwrap().body(), Some("second"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let storage = MemoryStorage::new();
        let err = storage.delete("ghost").await.unwrap_err();
        assert!(err.is_not_found());

        storage.upsert(&doc("a", "!r", "@u", "x", 1)).await.unwrap();
        storage.delete("a").await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_query_filters_and_orders() {
        let storage = MemoryStorage::new();
        storage.upsert(&doc("1", "!a", "@alice", "Rust is fun", 10)).await.unwrap();
        storage.upsert(&doc("2", "!a", "@bob", "rust again", 30)).await.unwrap();
        storage.upsert(&doc("3", "!b", "@alice", "more RUST", 20)).await.unwrap();
        storage.upsert(&doc("4", "!a", "@alice", "unrelated", 40)).await.unwrap();

        let ids = |hits: Vec<IndexedDocument>| hits.into_iter().map(|d| d.id).collect::<Vec<_>>();

        let hits = storage.query(&SearchQuery::new("rust")).await.unwrap();
        assert_eq!(ids(hits), vec!["2", "3", "1"]);

        let hits = storage.query(&SearchQuery::new("rust").in_room("!a")).await.unwrap();
        assert_eq!(ids(hits), vec!["2", "1"]);

        let hits = storage
            .query(&SearchQuery::new("rust").from_sender("@alice").with_limit(1))
            .await
            .unwrap();
        assert_eq!(ids(hits), vec!["3"]);

        let hits = storage.query(&SearchQuery::new("").in_room("!a")).await.unwrap();
        assert_eq!(ids(hits), vec!["4", "2", "1"]);
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");

        let storage = MemoryStorage::open(&path).unwrap();
        assert!(storage.is_empty());
        storage.upsert(&doc("a", "!r", "@u", "kept", 1)).await.unwrap();
        storage.upsert(&doc("b", "!r", "@u", "dropped", 2)).await.unwrap();
        storage.delete("b").await.unwrap();
        storage.flush().await.unwrap();
        drop(storage);

        let reopened = MemoryStorage::open(&path).unwrap();
        assert_eq!(reopened.ids(), vec!["a"]);
        assert_eq!(reopened.get("a").unwrap().body(), Some("kept"));
    }

    #[tokio::test]
    async fn test_flush_skips_clean_storage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");

        let storage = MemoryStorage::open(&path).unwrap();
        storage.flush().await.unwrap();
        assert!(!path.exists());

        storage.upsert(&doc("a", "!r", "@u", "x", 1)).await.unwrap();
        storage.flush().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_volatile_flush_is_noop() {
        let storage = MemoryStorage::new();
        storage.upsert(&doc("a", "!r", "@u", "x", 1)).await.unwrap();
        storage.flush().await.unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_corrupt_snapshot_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = MemoryStorage::open(&path).unwrap_err();
        assert!(matches!(err, Error::CorruptCheckpoint { .. }));
    }
}
