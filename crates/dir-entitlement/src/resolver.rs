//! Entitlement resolution
//!
//! The hot read path: business id in, "the package whose features and
//! limits currently apply" out. Resolution order is cache, admin
//! override, live subscription, default package. Expiry fields are
//! always re-checked against the injected clock, even on a cache hit;
//! the cache stores the resolved object, never a decision to skip
//! expiry checks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dir_common::{BusinessId, Clock, UserId};
use tracing::{debug, info, warn};

use crate::{
    CacheStore, CachedEntitlement, EntitlementError, FeatureFlag, LimitKey, Package,
    PackageCatalog, Subscription, SubscriptionStore,
};

/// Resolver tuning. TTL is configuration, not a constant.
#[derive(Debug, Clone, Copy)]
pub struct EntitlementConfig {
    /// Lifetime of cache entries.
    pub cache_ttl: Duration,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Where a resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitlementSource {
    /// A live, in-term subscription.
    ActiveSubscription,
    /// An admin override kept the subscription's package in force.
    AdminOverride,
    /// No live subscription; the catalog default applies.
    DefaultPackage,
}

/// The answer to "what can this business do right now".
#[derive(Debug, Clone)]
pub struct ResolvedEntitlement {
    /// Business the resolution is for.
    pub business_id: BusinessId,
    /// Package whose features and limits apply.
    pub package: Package,
    /// Subscription backing the resolution, absent on default fallback.
    pub subscription: Option<Subscription>,
    /// How the package was selected.
    pub source: EntitlementSource,
    /// When the resolution was computed.
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedEntitlement {
    /// Whether the resolved package grants `feature`.
    pub fn has_feature(&self, feature: FeatureFlag) -> bool {
        self.package.has_feature(feature)
    }

    /// The resolved numeric limit for `key`, zero if absent.
    pub fn limit(&self, key: LimitKey) -> u32 {
        self.package.limit(key)
    }
}

/// Entitlement resolver
///
/// Owns the cache interaction and the expiry side effects. Writers that
/// change subscription or override state must go through this type (or
/// call [`invalidate`] themselves) before acknowledging their write.
///
/// [`invalidate`]: Self::invalidate
pub struct EntitlementResolver {
    catalog: Arc<PackageCatalog>,
    subscriptions: Arc<SubscriptionStore>,
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    config: EntitlementConfig,
}

impl EntitlementResolver {
    /// Wire a resolver from its collaborators.
    pub fn new(
        catalog: Arc<PackageCatalog>,
        subscriptions: Arc<SubscriptionStore>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        config: EntitlementConfig,
    ) -> Self {
        Self {
            catalog,
            subscriptions,
            cache,
            clock,
            config,
        }
    }

    /// Resolve the entitlement for a business.
    pub fn resolve(
        &self,
        business_id: BusinessId,
    ) -> Result<ResolvedEntitlement, EntitlementError> {
        let now = self.clock.now();

        if let Some(hit) = self.cached(business_id, now) {
            return hit;
        }

        self.resolve_from_store(business_id, now)
    }

    /// Evict the cached resolution for a business. Called synchronously
    /// by every subscription/override writer.
    pub fn invalidate(&self, business_id: BusinessId) {
        if let Err(err) = self.cache.delete(business_id) {
            warn!(%business_id, %err, "cache invalidation failed; readers will recompute");
        }
    }

    /// Thin projection: is `feature` enabled for the business.
    pub fn can_use_feature(
        &self,
        business_id: BusinessId,
        feature: FeatureFlag,
    ) -> Result<bool, EntitlementError> {
        Ok(self.resolve(business_id)?.has_feature(feature))
    }

    /// Thin projection: the numeric limit for the business, zero if the
    /// resolved package does not define it.
    pub fn get_limit(
        &self,
        business_id: BusinessId,
        key: LimitKey,
    ) -> Result<u32, EntitlementError> {
        Ok(self.resolve(business_id)?.limit(key))
    }

    /// Enable an admin override for the business, invalidating the
    /// cache before returning.
    pub fn set_override(
        &self,
        business_id: BusinessId,
        reason: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        by_user: Option<UserId>,
    ) -> Result<Subscription, EntitlementError> {
        let now = self.clock.now();
        let updated = self
            .subscriptions
            .set_override(business_id, reason, expires_at, by_user, now)?;
        self.invalidate(business_id);
        info!(%business_id, expires_at = ?expires_at, "admin override set");
        Ok(updated)
    }

    /// Clear the admin override for the business, invalidating the
    /// cache before returning.
    pub fn clear_override(
        &self,
        business_id: BusinessId,
    ) -> Result<Subscription, EntitlementError> {
        let now = self.clock.now();
        let updated = self.subscriptions.clear_override(business_id, now)?;
        self.invalidate(business_id);
        info!(%business_id, "admin override cleared");
        Ok(updated)
    }

    /// Cache lookup. Returns `None` when the entry is missing, the
    /// store failed, or an embedded expiry forces recomputation.
    fn cached(
        &self,
        business_id: BusinessId,
        now: DateTime<Utc>,
    ) -> Option<Result<ResolvedEntitlement, EntitlementError>> {
        let entry = match self.cache.get(business_id) {
            Ok(entry) => entry?,
            Err(err) => {
                warn!(%business_id, %err, "cache read failed; treating as miss");
                return None;
            }
        };

        match entry {
            CachedEntitlement::UseDefault => {
                debug!(%business_id, "cache hit: default sentinel");
                Some(self.catalog.get_default().map(|package| ResolvedEntitlement {
                    business_id,
                    package,
                    subscription: None,
                    source: EntitlementSource::DefaultPackage,
                    resolved_at: now,
                }))
            }
            CachedEntitlement::Resolved {
                subscription,
                package,
            } => {
                // Embedded expiries are re-checked on every hit.
                if subscription.override_in_force(now) {
                    debug!(%business_id, "cache hit: override in force");
                    return Some(Ok(ResolvedEntitlement {
                        business_id,
                        package,
                        subscription: Some(subscription),
                        source: EntitlementSource::AdminOverride,
                        resolved_at: now,
                    }));
                }
                if subscription.admin_override.enabled {
                    // Override lapsed; the full path clears the flag.
                    debug!(%business_id, "cached override expired; recomputing");
                    return None;
                }
                if subscription.in_term(now) {
                    debug!(%business_id, "cache hit: active subscription");
                    return Some(Ok(ResolvedEntitlement {
                        business_id,
                        package,
                        subscription: Some(subscription),
                        source: EntitlementSource::ActiveSubscription,
                        resolved_at: now,
                    }));
                }
                debug!(%business_id, "cached subscription lapsed; recomputing");
                None
            }
        }
    }

    /// Full resolution from durable state, with expiry side effects.
    fn resolve_from_store(
        &self,
        business_id: BusinessId,
        now: DateTime<Utc>,
    ) -> Result<ResolvedEntitlement, EntitlementError> {
        let mut current = self.subscriptions.current(business_id);

        if let Some(sub) = current.as_ref() {
            if sub.override_in_force(now) {
                let package = self
                    .catalog
                    .get(sub.package_id)
                    .ok_or(EntitlementError::PackageNotFound(sub.package_id))?;
                self.store_in_cache(
                    business_id,
                    CachedEntitlement::Resolved {
                        subscription: sub.clone(),
                        package: package.clone(),
                    },
                );
                return Ok(ResolvedEntitlement {
                    business_id,
                    package,
                    subscription: current,
                    source: EntitlementSource::AdminOverride,
                    resolved_at: now,
                });
            }

            if sub.admin_override.enabled {
                // Lapsed override: clear the flag as a side effect and
                // fall through to normal expiry handling.
                info!(%business_id, "admin override lapsed; clearing");
                current = Some(self.subscriptions.clear_override(business_id, now)?);
                self.invalidate(business_id);
            }
        }

        match current {
            Some(ref sub) if sub.in_term(now) => {
                let package = self
                    .catalog
                    .get(sub.package_id)
                    .ok_or(EntitlementError::PackageNotFound(sub.package_id))?;
                self.store_in_cache(
                    business_id,
                    CachedEntitlement::Resolved {
                        subscription: sub.clone(),
                        package: package.clone(),
                    },
                );
                Ok(ResolvedEntitlement {
                    business_id,
                    package,
                    subscription: current,
                    source: EntitlementSource::ActiveSubscription,
                    resolved_at: now,
                })
            }
            other => {
                // Missing, inactive, or past end date: mark lapsed rows
                // inactive so durable state matches what we report.
                if other.as_ref().map(|s| s.is_active).unwrap_or(false) {
                    info!(%business_id, "subscription lapsed; marking inactive");
                    self.subscriptions.expire_current(business_id, now);
                    self.invalidate(business_id);
                }
                let package = self.catalog.get_default()?;
                self.store_in_cache(business_id, CachedEntitlement::UseDefault);
                Ok(ResolvedEntitlement {
                    business_id,
                    package,
                    subscription: None,
                    source: EntitlementSource::DefaultPackage,
                    resolved_at: now,
                })
            }
        }
    }

    fn store_in_cache(&self, business_id: BusinessId, entry: CachedEntitlement) {
        if let Err(err) = self
            .cache
            .set_with_ttl(business_id, entry, self.config.cache_ttl)
        {
            warn!(%business_id, %err, "cache write failed; continuing without cache");
        }
    }
}
