//! Process-lifetime cache of room display names.

use crate::api::HomeserverApi;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A resolved cache entry. Rooms absent from the cache are unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomName {
    Named(String),
    /// Looked up; the room has no name.
    Unnamed,
}

impl RoomName {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name),
            Self::Unnamed => None,
        }
    }
}

/// Caches `m.room.name` lookups per room.
///
/// Only definite answers are cached. A failed lookup leaves the room unknown
/// so the next message retries it.
pub struct RoomNameCache {
    api: Arc<dyn HomeserverApi>,
    names: RwLock<HashMap<String, RoomName>>,
}

impl RoomNameCache {
    pub fn new(api: Arc<dyn HomeserverApi>) -> Self {
        Self {
            api,
            names: RwLock::new(HashMap::new()),
        }
    }

    /// The cached entry, if the room has been resolved.
    pub fn cached(&self, room_id: &str) -> Option<RoomName> {
        self.names.read().get(room_id).cloned()
    }

    /// Resolve the room's name, hitting the homeserver on a cache miss.
    pub async fn resolve(&self, room_id: &str) -> Option<String> {
        if let Some(entry) = self.cached(room_id) {
            return entry.as_str().map(str::to_string);
        }

        let entry = match self.api.room_name(room_id).await {
            Ok(Some(name)) => RoomName::Named(name),
            Ok(None) => RoomName::Unnamed,
            Err(e) => {
                tracing::debug!("Room name lookup for {} failed: {}", room_id, e);
                return None;
            }
        };

        let name = entry.as_str().map(str::to_string);
        self.names.write().insert(room_id.to_string(), entry);
        name
    }
}
