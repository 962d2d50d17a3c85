//! DOM storage backend.
//!
//! This module owns the data behind HTML5 **localStorage** and
//! **sessionStorage** for one browser profile: the object graph, its
//! persistence, change notifications and the cleanup of stale session data.
//!
//! # Concepts
//!
//! - **Map** ([`StorageMap`]): an ordered key/value table. Maps are shared
//!   between areas after a namespace clone and copied on the first divergent
//!   write.
//! - **Area** ([`StorageArea`]): the storage of one origin in one namespace.
//!   Mutations go through the area so observers fire and commits get queued.
//! - **Namespace** ([`StorageNamespace`]): areas keyed by origin. There is one
//!   local namespace per context (id 0) and any number of session namespaces,
//!   each with a persistent id that survives restarts.
//! - **Context** ([`StorageContext`]): owns the namespaces, the stores, the
//!   observer table and the [`Scavenger`].
//!
//! # Threading
//!
//! Every mutation needs `&mut StorageContext`. In a running browser the context
//! is moved into a [`StorageWorker`] task (the single background sequence) and
//! reached from any thread through a cloneable [`StorageHandle`]. Id allocation
//! is lock-free and never leaves the calling thread.
//!
//! # Example
//!
//! ```no_run
//! use gosub_dom_storage::config::ContextConfig;
//! use gosub_dom_storage::storage::{StorageContext, StorageWorker, LOCAL_STORAGE_NAMESPACE_ID};
//! use url::Url;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ContextConfig::builder()
//!     .localstorage_directory("/tmp/profile/Local Storage")
//!     .build()?;
//! let (storage, _task) = StorageWorker::spawn(StorageContext::new(config)?);
//!
//! let page = Url::parse("https://example.com/index.html")?;
//! storage.set_item(LOCAL_STORAGE_NAMESPACE_ID, &page.origin(), "theme", "dark", &page).await?;
//!
//! let tab = storage.allocate_session_id();
//! storage.create_session_namespace(tab, &storage.allocate_persistent_session_id()).await?;
//! storage.shutdown().await?;
//! # Ok(()) }
//! ```

/// Storage area, the per-origin container.
pub mod area;
/// Persistence seams: store traits and per-area bindings.
pub mod backing;
/// Commands processed by the background sequence.
pub mod command;
/// The context, root of the storage object graph.
pub mod context;
/// Change events and observers.
pub mod event;
/// Cross-thread handle to a running worker.
pub mod handle;
/// Namespace ids and their allocation.
pub mod ids;
/// The shared key/value map.
pub mod map;
/// Namespaces of areas.
pub mod namespace;
/// Retention policies.
pub mod policy;
/// Reclamation of unused session storage.
pub mod scavenger;
/// Origins, usage records and memory accounting.
pub mod types;
/// The background sequence.
pub mod worker;

/// Local storage database implementations.
pub mod local {
    /// In-memory local storage database.
    pub mod in_memory;
    /// SQLite-backed local storage database.
    #[cfg(feature = "sqlite_storage")]
    pub mod sqlite_store;
}

/// Session storage database implementations.
pub mod session {
    /// In-memory session storage database.
    pub mod in_memory;
    /// SQLite-backed session storage database.
    #[cfg(feature = "sqlite_storage")]
    pub mod sqlite_store;
}

pub use area::StorageArea;
pub use backing::{CommitBatch, LocalStorageDatabase, SessionStorageDatabase};
pub use context::StorageContext;
pub use event::{AreaId, BroadcastObserver, EventBus, ObserverId, StorageEvent, StorageObserver, Subscription};
pub use handle::StorageHandle;
pub use ids::{NamespaceId, SessionIdAllocator, LOCAL_STORAGE_NAMESPACE_ID};
pub use local::in_memory::InMemoryLocalStorageDatabase;
pub use map::StorageMap;
pub use namespace::StorageNamespace;
pub use policy::{NoExtraRetention, RetainWhenForced, SessionRetentionPolicy, SpecialStoragePolicy, StaticStoragePolicy};
pub use scavenger::{ScavengePhase, Scavenger};
pub use session::in_memory::InMemorySessionStorageDatabase;
pub use types::{LocalStorageUsageInfo, MemoryUsage, SessionStorageUsageInfo};
pub use worker::StorageWorker;

#[cfg(feature = "sqlite_storage")]
pub use local::sqlite_store::SqliteLocalStorageDatabase;
#[cfg(feature = "sqlite_storage")]
pub use session::sqlite_store::SqliteSessionStorageDatabase;
