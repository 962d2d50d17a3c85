//! Storage context configuration.
//!
//! `ContextConfig` controls where a [`StorageContext`](crate::storage::StorageContext)
//! keeps its data on disk and how the background sequence paces its work.
//!
//! `ContextConfig` provides sensible defaults via [`Default`] and a fluent
//! [`ContextConfig::builder()`] for customization with validation.
//!
//! # Examples
//!
//! ## Use defaults (no disk backing)
//! ```rust
//! use gosub_dom_storage::config::ContextConfig;
//! let cfg = ContextConfig::default();
//! assert!(cfg.localstorage_directory.is_none());
//! ```
//!
//! ## Customize with the builder
//! ```rust
//! use std::time::Duration;
//! use gosub_dom_storage::config::ContextConfig;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = ContextConfig::builder()
//!     .localstorage_directory("/tmp/profile/Local Storage")
//!     .sessionstorage_directory("/tmp/profile/Session Storage")
//!     .commit_interval(Duration::from_secs(2))
//!     .build()?; // returns Result<ContextConfig, ContextConfigError>
//! # Ok(()) }
//! ```
//!
//! # Fields (summary)
//! - `localstorage_directory`: Where local storage lives. `None` (or an empty path) means memory only.
//! - `sessionstorage_directory`: Where session storage lives. Same rule as above.
//! - `per_area_quota`: Maximum bytes per area, keys and values counted as UTF-16 (default: 10 MiB).
//! - `commit_interval`: How often the worker writes dirty areas to disk (default: 5s).
//! - `scavenge_delay`: Delay before scavenging of unused session storage begins (default: 60s).
//! - `channel_capacity`: Capacity of the command channel feeding the worker (default: 64).

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PER_AREA_QUOTA: usize = 10 * 1024 * 1024;
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SCAVENGE_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub localstorage_directory: Option<PathBuf>,
    pub sessionstorage_directory: Option<PathBuf>,
    pub per_area_quota: usize,
    pub commit_interval: Duration,
    pub scavenge_delay: Duration,
    pub channel_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            localstorage_directory: None,
            sessionstorage_directory: None,
            per_area_quota: DEFAULT_PER_AREA_QUOTA,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            scavenge_delay: DEFAULT_SCAVENGE_DELAY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ContextConfig {
    pub fn builder() -> ContextConfigBuilder {
        ContextConfigBuilder::default()
    }
}

/// Empty paths mean "no disk backing" (incognito).
fn non_empty(path: PathBuf) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        None
    } else {
        Some(path)
    }
}

/// Builder for [`ContextConfig`], mirroring the zone config builder.
#[derive(Debug, Clone, Default)]
pub struct ContextConfigBuilder {
    inner: ContextConfig,
}

impl ContextConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut ContextConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn localstorage_directory<P: Into<PathBuf>>(self, dir: P) -> Self { self.map(|c| c.localstorage_directory = non_empty(dir.into())) }
    pub fn sessionstorage_directory<P: Into<PathBuf>>(self, dir: P) -> Self { self.map(|c| c.sessionstorage_directory = non_empty(dir.into())) }
    pub fn per_area_quota(self, bytes: usize) -> Self { self.map(|c| c.per_area_quota = bytes) }
    pub fn commit_interval(self, every: Duration) -> Self { self.map(|c| c.commit_interval = every) }
    pub fn scavenge_delay(self, delay: Duration) -> Self { self.map(|c| c.scavenge_delay = delay) }
    pub fn channel_capacity(self, n: usize) -> Self { self.map(|c| c.channel_capacity = n) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut ContextConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<ContextConfig, ContextConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

// ---------- Validation ----------

#[derive(Debug, Clone, PartialEq)]
pub enum ContextConfigError {
    ZeroQuota,
    ZeroCommitInterval,
    ZeroChannelCapacity,
}

impl fmt::Display for ContextConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextConfigError::ZeroQuota =>
                write!(f, "per_area_quota must be at least 1 byte"),
            ContextConfigError::ZeroCommitInterval =>
                write!(f, "commit_interval must be non-zero"),
            ContextConfigError::ZeroChannelCapacity =>
                write!(f, "channel_capacity must be at least 1"),
        }
    }
}
impl std::error::Error for ContextConfigError {}

pub(crate) fn validate(c: &ContextConfig) -> Result<(), ContextConfigError> {
    if c.per_area_quota == 0 {
        return Err(ContextConfigError::ZeroQuota);
    }
    if c.commit_interval.is_zero() {
        return Err(ContextConfigError::ZeroCommitInterval);
    }
    if c.channel_capacity == 0 {
        return Err(ContextConfigError::ZeroChannelCapacity);
    }
    Ok(())
}
