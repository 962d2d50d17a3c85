//! Retention policies consulted at shutdown and while scavenging.

use std::collections::HashSet;

use url::Origin;

/// Embedder policy about which origins keep their data when the context ends.
pub trait SpecialStoragePolicy: Send + Sync {
    /// Protected origins are never wiped by the context.
    fn is_storage_protected(&self, origin: &Origin) -> bool;

    /// Session-only origins lose their data at shutdown unless the session state is forcibly kept.
    fn is_storage_session_only(&self, origin: &Origin) -> bool;

    fn has_session_only_origins(&self) -> bool;
}

/// Decides whether a persisted session namespace outlives scavenging even
/// though nothing live references it and it is not in the protected set.
pub trait SessionRetentionPolicy: Send + Sync {
    fn retain(&self, persistent_id: &str, force_keep_session_state: bool) -> bool;
}

/// Keeps nothing beyond the live and protected ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExtraRetention;

impl SessionRetentionPolicy for NoExtraRetention {
    fn retain(&self, _persistent_id: &str, _force_keep_session_state: bool) -> bool {
        false
    }
}

/// Keeps every persisted namespace while the session state is forcibly kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetainWhenForced;

impl SessionRetentionPolicy for RetainWhenForced {
    fn retain(&self, _persistent_id: &str, force_keep_session_state: bool) -> bool {
        force_keep_session_state
    }
}

/// Fixed lists of session-only and protected origins.
#[derive(Debug, Default, Clone)]
pub struct StaticStoragePolicy {
    session_only: HashSet<Origin>,
    protected: HashSet<Origin>,
}

impl StaticStoragePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_only(mut self, origin: Origin) -> Self {
        self.session_only.insert(origin);
        self
    }

    pub fn protected(mut self, origin: Origin) -> Self {
        self.protected.insert(origin);
        self
    }
}

impl SpecialStoragePolicy for StaticStoragePolicy {
    fn is_storage_protected(&self, origin: &Origin) -> bool {
        self.protected.contains(origin)
    }

    fn is_storage_session_only(&self, origin: &Origin) -> bool {
        self.session_only.contains(origin)
    }

    fn has_session_only_origins(&self) -> bool {
        !self.session_only.is_empty()
    }
}
