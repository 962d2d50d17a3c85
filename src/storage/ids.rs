use std::fmt::Display;
use std::sync::atomic::{AtomicI64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Numeric identifier of a namespace inside a single [`StorageContext`](super::StorageContext).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NamespaceId(i64);

impl NamespaceId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn is_local(self) -> bool {
        self == LOCAL_STORAGE_NAMESPACE_ID
    }
}

impl From<i64> for NamespaceId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl Display for NamespaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The one local storage namespace every context owns.
pub const LOCAL_STORAGE_NAMESPACE_ID: NamespaceId = NamespaceId(0);

/// Persistent id carried by the local namespace. Never written as a session.
pub const LOCAL_STORAGE_PERSISTENT_ID: &str = "";

/// Upper bound for the random offset added to every session id.
const MAX_SESSION_ID_OFFSET: i64 = 1000;

/// Lock-free session id allocator, shared between the context and its handles.
///
/// Ids start at a random offset so an id minted by one context is unlikely to
/// be valid in another. The offset is at least 1, which keeps the local
/// namespace id out of reach.
#[derive(Debug)]
pub struct SessionIdAllocator {
    sequence: AtomicI64,
    offset: i64,
}

impl SessionIdAllocator {
    pub fn new() -> Self {
        let offset = rand::rng().random_range(1..=MAX_SESSION_ID_OFFSET);
        Self::with_offset(offset)
    }

    pub(crate) fn with_offset(offset: i64) -> Self {
        Self {
            sequence: AtomicI64::new(0),
            offset: offset.max(1),
        }
    }

    /// May be called on any thread.
    pub fn allocate(&self) -> NamespaceId {
        NamespaceId(self.sequence.fetch_add(1, Ordering::Relaxed) + self.offset)
    }
}

impl Default for SessionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates a globally unique persistent session id. May be called on any thread.
pub fn allocate_persistent_session_id() -> String {
    // Dashes are swapped so the id is a single identifier token on disk.
    Uuid::new_v4().to_string().replace('-', "_")
}
