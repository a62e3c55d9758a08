//! Package Catalog
//!
//! Catalog entries define what a subscription buys: a price, a term,
//! boolean capabilities, and numeric limits. Exactly one package is the
//! system-wide default that businesses without a live subscription fall
//! back to.

use dashmap::DashMap;
use dir_common::PackageId;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::EntitlementError;

/// Boolean capabilities a package can grant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum FeatureFlag {
    /// Listing is promoted in search and category pages.
    FeaturedListing,
    /// Visit and conversion analytics dashboard.
    AdvancedAnalytics,
    /// Custom branding on the public profile.
    CustomBranding,
    /// Owner may respond to reviews.
    ReviewResponses,
    /// Programmatic access to the listing API.
    ApiAccess,
    /// Tickets answered ahead of the free queue.
    PrioritySupport,
}

/// Numeric limits a package can impose.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LimitKey {
    /// Branch locations per business.
    Branches,
    /// Products/services on the listing.
    Products,
    /// Gallery images.
    GalleryItems,
    /// Staff/agent accounts.
    StaffAccounts,
    /// Pinned announcements.
    Announcements,
}

/// A catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    /// Catalog identifier.
    pub id: PackageId,
    /// Display name.
    pub name: String,
    /// Full-term price.
    pub price: Decimal,
    /// Term length in days. Zero means a non-expiring flat-price entry.
    pub duration_days: i64,
    /// Whether this is the system-wide fallback package.
    pub is_default: bool,
    /// Granted capabilities.
    pub features: BTreeSet<FeatureFlag>,
    /// Numeric limits; an absent key reads as zero.
    pub limits: BTreeMap<LimitKey, u32>,
}

impl Package {
    /// Start a package definition with no features or limits.
    pub fn new(name: impl Into<String>, price: Decimal, duration_days: i64) -> Self {
        Self {
            id: PackageId::new(),
            name: name.into(),
            price,
            duration_days,
            is_default: false,
            features: BTreeSet::new(),
            limits: BTreeMap::new(),
        }
    }

    /// Grant a feature.
    pub fn with_feature(mut self, feature: FeatureFlag) -> Self {
        self.features.insert(feature);
        self
    }

    /// Set a numeric limit.
    pub fn with_limit(mut self, key: LimitKey, value: u32) -> Self {
        self.limits.insert(key, value);
        self
    }

    /// Whether the package grants `feature`.
    pub fn has_feature(&self, feature: FeatureFlag) -> bool {
        self.features.contains(&feature)
    }

    /// The numeric limit for `key`, zero if absent.
    pub fn limit(&self, key: LimitKey) -> u32 {
        self.limits.get(&key).copied().unwrap_or(0)
    }

    /// Price per day of the term. A zero-duration package charges its
    /// flat price per day so proration math never divides by zero.
    pub fn daily_rate(&self) -> Decimal {
        if self.duration_days == 0 {
            self.price
        } else {
            self.price / Decimal::from(self.duration_days)
        }
    }
}

/// Package catalog
///
/// The default-package pointer is kept behind its own lock so that
/// promoting a new default clears the previous flag atomically.
pub struct PackageCatalog {
    packages: DashMap<PackageId, Package>,
    default_id: RwLock<Option<PackageId>>,
}

impl PackageCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self {
            packages: DashMap::new(),
            default_id: RwLock::new(None),
        }
    }

    /// Insert a package. The first package flagged `is_default` becomes
    /// the default; later inserts go through [`set_default`].
    ///
    /// [`set_default`]: Self::set_default
    pub fn create(&self, mut package: Package) -> Package {
        let wants_default = package.is_default;
        package.is_default = false;
        let id = package.id;
        self.packages.insert(id, package.clone());
        if wants_default {
            // set_default re-reads the stored row, ignore the stale copy
            let _ = self.set_default(id);
            return self.get(id).unwrap_or(package);
        }
        package
    }

    /// Look up a package.
    pub fn get(&self, id: PackageId) -> Option<Package> {
        self.packages.get(&id).map(|p| p.clone())
    }

    /// Replace an existing package definition, preserving its default
    /// flag. Catalog edits are an explicit admin operation.
    pub fn update(&self, package: Package) -> Result<Package, EntitlementError> {
        let id = package.id;
        let mut entry = self
            .packages
            .get_mut(&id)
            .ok_or(EntitlementError::PackageNotFound(id))?;
        let is_default = entry.is_default;
        *entry = Package {
            is_default,
            ..package
        };
        Ok(entry.clone())
    }

    /// The system-wide default package.
    pub fn get_default(&self) -> Result<Package, EntitlementError> {
        let id = (*self.default_id.read()).ok_or(EntitlementError::NoDefaultPackage)?;
        self.get(id).ok_or(EntitlementError::NoDefaultPackage)
    }

    /// Promote `id` to be the default, clearing the previous default
    /// flag in the same critical section.
    pub fn set_default(&self, id: PackageId) -> Result<(), EntitlementError> {
        if !self.packages.contains_key(&id) {
            return Err(EntitlementError::PackageNotFound(id));
        }
        let mut pointer = self.default_id.write();
        if let Some(previous) = *pointer {
            if let Some(mut entry) = self.packages.get_mut(&previous) {
                entry.is_default = false;
            }
        }
        if let Some(mut entry) = self.packages.get_mut(&id) {
            entry.is_default = true;
        }
        *pointer = Some(id);
        Ok(())
    }

    /// All packages, unordered.
    pub fn list(&self) -> Vec<Package> {
        self.packages.iter().map(|p| p.clone()).collect()
    }

    /// Catalog seeded with the stock Free/Standard/Premium tiers.
    pub fn with_standard_tiers() -> Self {
        let catalog = Self::new();

        let mut free = Package::new("Free", Decimal::ZERO, 0)
            .with_limit(LimitKey::Branches, 1)
            .with_limit(LimitKey::Products, 5)
            .with_limit(LimitKey::GalleryItems, 3);
        free.is_default = true;
        catalog.create(free);

        catalog.create(
            Package::new("Standard", Decimal::from(150_000), 30)
                .with_feature(FeatureFlag::ReviewResponses)
                .with_feature(FeatureFlag::AdvancedAnalytics)
                .with_limit(LimitKey::Branches, 3)
                .with_limit(LimitKey::Products, 50)
                .with_limit(LimitKey::GalleryItems, 20)
                .with_limit(LimitKey::StaffAccounts, 5),
        );

        catalog.create(
            Package::new("Premium", Decimal::from(300_000), 30)
                .with_feature(FeatureFlag::ReviewResponses)
                .with_feature(FeatureFlag::AdvancedAnalytics)
                .with_feature(FeatureFlag::FeaturedListing)
                .with_feature(FeatureFlag::CustomBranding)
                .with_feature(FeatureFlag::ApiAccess)
                .with_feature(FeatureFlag::PrioritySupport)
                .with_limit(LimitKey::Branches, 10)
                .with_limit(LimitKey::Products, 500)
                .with_limit(LimitKey::GalleryItems, 100)
                .with_limit(LimitKey::StaffAccounts, 25)
                .with_limit(LimitKey::Announcements, 10),
        );

        catalog
    }
}

impl Default for PackageCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_exactly_one_default() {
        let catalog = PackageCatalog::with_standard_tiers();
        let defaults: Vec<_> = catalog.list().into_iter().filter(|p| p.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].name, "Free");

        let premium = catalog
            .list()
            .into_iter()
            .find(|p| p.name == "Premium")
            .unwrap();
        catalog.set_default(premium.id).unwrap();

        let defaults: Vec<_> = catalog.list().into_iter().filter(|p| p.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].name, "Premium");
        assert_eq!(catalog.get_default().unwrap().id, premium.id);
    }

    #[test]
    fn test_daily_rate_zero_duration_guard() {
        let flat = Package::new("Flat", dec!(1000), 0);
        assert_eq!(flat.daily_rate(), dec!(1000));

        let monthly = Package::new("Monthly", dec!(150000), 30);
        assert_eq!(monthly.daily_rate(), dec!(5000));
    }

    #[test]
    fn test_limit_defaults_to_zero() {
        let p = Package::new("Bare", dec!(10), 30).with_limit(LimitKey::Products, 7);
        assert_eq!(p.limit(LimitKey::Products), 7);
        assert_eq!(p.limit(LimitKey::Announcements), 0);
        assert!(!p.has_feature(FeatureFlag::ApiAccess));
    }

    #[test]
    fn test_update_preserves_default_flag() {
        let catalog = PackageCatalog::with_standard_tiers();
        let free = catalog.get_default().unwrap();

        let mut edited = free.clone();
        edited.price = dec!(1);
        edited.is_default = false; // callers cannot demote via update
        catalog.update(edited).unwrap();

        let reloaded = catalog.get_default().unwrap();
        assert_eq!(reloaded.id, free.id);
        assert_eq!(reloaded.price, dec!(1));
        assert!(reloaded.is_default);
    }

    #[test]
    fn test_update_unknown_package() {
        let catalog = PackageCatalog::new();
        let err = catalog.update(Package::new("Ghost", dec!(1), 1)).unwrap_err();
        assert!(matches!(err, EntitlementError::PackageNotFound(_)));
    }
}
