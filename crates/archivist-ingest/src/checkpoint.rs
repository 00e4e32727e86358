//! Durable checkpoints for crash recovery.
//!
//! Two independent records live in the storage directory:
//!
//! - `bot.json` - the live sync cursor, written only by the live sync engine
//! - `backfillState.json` - rooms whose history has been fully crawled,
//!   written only by the backfill engine
//!
//! Each write goes to a temporary file in the same directory which is fsynced
//! and then renamed over the target, so a crash leaves either the old or the
//! new record on disk, never a torn one. A failed write is reported as
//! [`Error::Persistence`], which callers must treat as fatal.

use crate::{Error, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of the live sync checkpoint.
pub const SYNC_CHECKPOINT_FILE: &str = "bot.json";

/// File name of the backfill checkpoint.
pub const BACKFILL_CHECKPOINT_FILE: &str = "backfillState.json";

/// Position in the live event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Token of the last fully processed response.
    #[serde(rename = "syncToken")]
    pub current: String,

    /// Token before `current`, kept to recognise a re-sent page.
    #[serde(default)]
    pub previous: Option<String>,
}

impl SyncCursor {
    pub fn new(current: impl Into<String>) -> Self {
        Self {
            current: current.into(),
            previous: None,
        }
    }

    /// The cursor after successfully processing a page ending at `next`.
    pub fn advance(&self, next: impl Into<String>) -> Self {
        Self {
            current: next.into(),
            previous: Some(self.current.clone()),
        }
    }

    /// Whether `next` is a token this cursor has already processed.
    pub fn is_duplicate(&self, next: &str) -> bool {
        self.current == next || self.previous.as_deref() == Some(next)
    }
}

/// Rooms whose history has been drained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillState {
    #[serde(default)]
    pub rooms: BTreeSet<String>,
}

impl BackfillState {
    pub fn is_complete(&self, room_id: &str) -> bool {
        self.rooms.contains(room_id)
    }

    /// Mark a room complete. Returns `false` if it already was.
    pub fn mark_complete(&mut self, room_id: &str) -> bool {
        self.rooms.insert(room_id.to_string())
    }
}

/// Store for the live sync cursor.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    /// Store backed by `bot.json` in `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(SYNC_CHECKPOINT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cursor. A missing file yields `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptCheckpoint`] if the file exists but cannot be
    /// parsed, and [`Error::Persistence`] if it cannot be read.
    pub fn load(&self) -> Result<Option<SyncCursor>> {
        read_json(&self.path)
    }

    /// Atomically replace the stored cursor.
    pub fn save(&self, cursor: &SyncCursor) -> Result<()> {
        write_json_atomic(&self.path, cursor)
    }
}

/// Store for the backfill completion set.
#[derive(Debug, Clone)]
pub struct BackfillStore {
    path: PathBuf,
}

impl BackfillStore {
    /// Store backed by `backfillState.json` in `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(BACKFILL_CHECKPOINT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state. A missing file yields an empty set.
    pub fn load(&self) -> Result<BackfillState> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn save(&self, state: &BackfillState) -> Result<()> {
        write_json_atomic(&self.path, state)
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::Persistence {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let persistence = |source: std::io::Error| Error::Persistence {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(persistence)?;
    tmp.write_all(&bytes).map_err(persistence)?;
    tmp.as_file().sync_all().map_err(persistence)?;
    tmp.persist(path).map_err(|e| persistence(e.error))?;

    tracing::trace!("Persisted {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_cursor_is_none() {
        let dir = TempDir::new().unwrap();
        let store = CursorStore::new(dir.path());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_cursor_round_trip_uses_wire_names() {
        let dir = TempDir::new().unwrap();
        let store = CursorStore::new(dir.path());

        let cursor = SyncCursor {
            current: "T1".to_string(),
            previous: Some("T0".to_string()),
        };
        store.save(&cursor).unwrap();
        assert_eq!(store.load().unwrap(), Some(cursor));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["syncToken"], "T1");
        assert_eq!(raw["previous"], "T0");
    }

    #[test]
    fn test_reads_record_without_previous() {
        let dir = TempDir::new().unwrap();
        let store = CursorStore::new(dir.path());
        std::fs::write(store.path(), r#"{"syncToken":"s1"}"#).unwrap();
        assert_eq!(store.load().unwrap(), Some(SyncCursor::new("s1")));
    }

    #[test]
    fn test_corrupt_cursor_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = CursorStore::new(dir.path());
        std::fs::write(store.path(), b"{not json").unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, Error::CorruptCheckpoint { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_save_into_missing_directory_fails_fatally() {
        let dir = TempDir::new().unwrap();
        let store = CursorStore::new(dir.path().join("does/not/exist"));

        let err = store.save(&SyncCursor::new("T1")).unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_save_overwrites_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = CursorStore::new(dir.path());
        store.save(&SyncCursor::new("a")).unwrap();
        store.save(&SyncCursor::new("a").advance("b")).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.current, "b");
        assert_eq!(loaded.previous.as_deref(), Some("a"));

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_cursor_advance_and_duplicates() {
        let cursor = SyncCursor::new("T0").advance("T1");
        assert_eq!(cursor.current, "T1");
        assert_eq!(cursor.previous.as_deref(), Some("T0"));

        assert!(cursor.is_duplicate("T1"));
        assert!(cursor.is_duplicate("T0"));
        assert!(!cursor.is_duplicate("T2"));
        assert!(!SyncCursor::new("T0").is_duplicate("T1"));
    }

    #[test]
    fn test_backfill_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = BackfillStore::new(dir.path());
        assert!(store.load().unwrap().rooms.is_empty());

        let mut state = BackfillState::default();
        assert!(state.mark_complete("!a:example.org"));
        assert!(!state.mark_complete("!a:example.org"));
        state.mark_complete("!b:example.org");
        store.save(&state).unwrap();

        let loaded = store.load().unwrap();
        assert!(loaded.is_complete("!a:example.org"));
        assert!(loaded.is_complete("!b:example.org"));
        assert!(!loaded.is_complete("!c:example.org"));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["rooms"], serde_json::json!(["!a:example.org", "!b:example.org"]));
    }
}
