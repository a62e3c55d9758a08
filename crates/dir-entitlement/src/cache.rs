//! Cache-store abstraction for resolved entitlements
//!
//! Any key/value store with expiry qualifies; the in-process moka store
//! below suits a single-instance deployment, a shared store is needed
//! once invalidation must be visible across instances. Store failures
//! are always treated as a miss by the resolver, never as an error.

use dir_common::BusinessId;
use moka::{sync::Cache, Expiry};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::{Package, Subscription};

/// What the resolver caches per business: either a full snapshot of the
/// resolved subscription and package, or a sentinel meaning "fall back
/// to the default package".
///
/// The snapshot carries its own expiry fields (`end_date`,
/// `override.expires_at`); readers re-check those against the wall
/// clock on every hit, so a cached entry can never extend a lapsed
/// subscription past its end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CachedEntitlement {
    /// A live subscription resolved to its package.
    Resolved {
        /// Subscription snapshot at resolution time.
        subscription: Subscription,
        /// Package snapshot at resolution time.
        package: Package,
    },
    /// No live subscription; use the catalog default.
    UseDefault,
}

/// Cache-store failure. Non-fatal by contract: callers log and fall
/// through to direct computation.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store could not be reached.
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

/// Key/value store with per-entry expiry.
pub trait CacheStore: Send + Sync {
    /// Fetch the entry for a business, `None` on miss or expiry.
    fn get(&self, key: BusinessId) -> Result<Option<CachedEntitlement>, CacheError>;

    /// Store an entry that expires after `ttl`.
    fn set_with_ttl(
        &self,
        key: BusinessId,
        value: CachedEntitlement,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Evict the entry for a business. A no-op on miss.
    fn delete(&self, key: BusinessId) -> Result<(), CacheError>;
}

#[derive(Clone)]
struct TtlEntry {
    value: CachedEntitlement,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<BusinessId, TtlEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &BusinessId,
        value: &TtlEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process LRU cache store with per-entry TTL.
pub struct MokaStore {
    cache: Cache<BusinessId, TtlEntry>,
}

impl MokaStore {
    /// Create a store bounded to `capacity` entries.
    pub fn new(capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    /// Current entry count (approximate, for observability).
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.cache.entry_count() == 0
    }
}

impl Default for MokaStore {
    fn default() -> Self {
        Self::new(16_384)
    }
}

impl CacheStore for MokaStore {
    fn get(&self, key: BusinessId) -> Result<Option<CachedEntitlement>, CacheError> {
        Ok(self.cache.get(&key).map(|entry| entry.value))
    }

    fn set_with_ttl(
        &self,
        key: BusinessId,
        value: CachedEntitlement,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.cache.insert(key, TtlEntry { value, ttl });
        Ok(())
    }

    fn delete(&self, key: BusinessId) -> Result<(), CacheError> {
        self.cache.invalidate(&key);
        Ok(())
    }
}
