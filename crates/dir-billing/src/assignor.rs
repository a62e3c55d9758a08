//! Subscription assignment and proration
//!
//! Pricing and assignment are split so the saga can validate a charge
//! against the wallet before anything is written: `quote` computes the
//! figures without touching state, `assign` commits the new row,
//! appends history, and invalidates the entitlement cache as its last
//! step.
//!
//! Proration credits the unused value of a still-active subscription
//! when switching to a *different* package. Renewals of the same
//! package always pay full price.

use std::sync::Arc;

use chrono::Duration;
use dir_common::{BusinessId, Clock, PackageId, SubscriptionId};
use dir_entitlement::{
    AdminOverride, EntitlementResolver, HistoryAction, PackageCatalog, Subscription,
    SubscriptionHistory, SubscriptionStore,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::BillingError;

const SECONDS_PER_DAY: i64 = 86_400;

/// The priced outcome of a prospective assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingQuote {
    /// Target package.
    pub package_id: PackageId,
    /// Target package display name, carried into ledger metadata.
    pub package_name: String,
    /// Term length being purchased.
    pub duration_days: i64,
    /// Target package price per day.
    pub daily_rate: Decimal,
    /// Charge before proration credit.
    pub base_charge: Decimal,
    /// Whole days left on the current subscription, zero unless a
    /// proration credit applies.
    pub remaining_days: i64,
    /// Unused value credited from the current subscription.
    pub remaining_value: Decimal,
    /// Final amount due: `max(0, base_charge - remaining_value)`.
    pub charge: Decimal,
    /// Whether this renews the business's current package.
    pub is_renewal: bool,
}

/// A committed assignment plus the quote it reconciles against.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// The new active subscription.
    pub subscription: Subscription,
    /// The figures the caller should reconcile against what was
    /// actually collected.
    pub quote: PricingQuote,
}

/// Pricing and assignment seam. The orchestrator depends on this trait
/// so partial-failure behavior can be exercised with fault injection.
pub trait Assignor: Send + Sync {
    /// Compute the charge for assigning `package_id`, without writes.
    fn quote(
        &self,
        business_id: BusinessId,
        package_id: PackageId,
        duration_days: Option<i64>,
    ) -> Result<PricingQuote, BillingError>;

    /// Commit the assignment: supersede the current row, append
    /// history, invalidate the entitlement cache.
    fn assign(
        &self,
        business_id: BusinessId,
        package_id: PackageId,
        duration_days: Option<i64>,
    ) -> Result<Assignment, BillingError>;
}

/// Subscription assignor
pub struct SubscriptionAssignor {
    catalog: Arc<PackageCatalog>,
    subscriptions: Arc<SubscriptionStore>,
    resolver: Arc<EntitlementResolver>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionAssignor {
    /// Wire the assignor from its collaborators.
    pub fn new(
        catalog: Arc<PackageCatalog>,
        subscriptions: Arc<SubscriptionStore>,
        resolver: Arc<EntitlementResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            subscriptions,
            resolver,
            clock,
        }
    }
}

impl Assignor for SubscriptionAssignor {
    fn quote(
        &self,
        business_id: BusinessId,
        package_id: PackageId,
        duration_days: Option<i64>,
    ) -> Result<PricingQuote, BillingError> {
        let now = self.clock.now();
        let package = self
            .catalog
            .get(package_id)
            .ok_or(BillingError::PackageNotFound(package_id))?;

        let duration = duration_days.unwrap_or(package.duration_days);
        if duration <= 0 {
            return Err(BillingError::InvalidDuration(duration));
        }

        let current = self.subscriptions.current(business_id);
        let is_renewal = current
            .as_ref()
            .map(|s| s.is_active && s.package_id == package_id)
            .unwrap_or(false);
        let has_unexpired = current.as_ref().map(|s| s.in_term(now)).unwrap_or(false);

        let daily_rate = package.daily_rate();
        let base_charge = daily_rate * Decimal::from(duration);

        let mut remaining_days = 0;
        let mut remaining_value = Decimal::ZERO;
        if !is_renewal && has_unexpired {
            if let Some(sub) = current.as_ref() {
                let secs = (sub.end_date - now).num_seconds();
                if secs > 0 {
                    remaining_days = (secs + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY;
                }
                match self.catalog.get(sub.package_id) {
                    Some(current_package) => {
                        remaining_value =
                            current_package.daily_rate() * Decimal::from(remaining_days);
                    }
                    None => {
                        warn!(
                            business_id = %business_id,
                            package_id = %sub.package_id,
                            "current package missing from catalog; no proration credit"
                        );
                    }
                }
            }
        }

        let charge = (base_charge - remaining_value).max(Decimal::ZERO);

        Ok(PricingQuote {
            package_id,
            package_name: package.name,
            duration_days: duration,
            daily_rate,
            base_charge,
            remaining_days,
            remaining_value,
            charge,
            is_renewal,
        })
    }

    fn assign(
        &self,
        business_id: BusinessId,
        package_id: PackageId,
        duration_days: Option<i64>,
    ) -> Result<Assignment, BillingError> {
        let quote = self.quote(business_id, package_id, duration_days)?;
        let now = self.clock.now();

        let current = self.subscriptions.current(business_id);
        let action = match current.as_ref() {
            Some(_) if quote.is_renewal => HistoryAction::Renewed,
            Some(_) => HistoryAction::Upgraded,
            None => HistoryAction::Assigned,
        };
        let auto_renew = current
            .as_ref()
            .filter(|_| quote.is_renewal)
            .map(|s| s.auto_renew)
            .unwrap_or(false);

        let subscription = Subscription {
            id: SubscriptionId::new(),
            business_id,
            package_id,
            start_date: now,
            end_date: now + Duration::days(quote.duration_days),
            is_active: true,
            auto_renew,
            admin_override: AdminOverride::default(),
            created_at: now,
            updated_at: now,
        };
        let history = SubscriptionHistory {
            id: Uuid::new_v4(),
            business_id,
            subscription_id: subscription.id,
            package_id,
            action,
            price: quote.charge,
            period_start: subscription.start_date,
            period_end: subscription.end_date,
            recorded_at: now,
        };

        // supersede + history append happen inside the business's
        // entry; the expected-id check rejects this write if another
        // assignment committed since `current` was read above
        let expected = current.as_ref().map(|s| s.id);
        let subscription = self
            .subscriptions
            .replace_active(business_id, subscription, history, expected)
            .ok_or(BillingError::DuplicateActiveSubscription(business_id))?;

        // invalidate only after the new row is durably committed
        self.resolver.invalidate(business_id);

        info!(
            business_id = %business_id,
            package = %quote.package_name,
            action = ?action,
            charge = %quote.charge,
            "subscription assigned"
        );

        Ok(Assignment {
            subscription,
            quote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dir_common::ManualClock;
    use dir_entitlement::{
        CacheStore, EntitlementConfig, EntitlementSource, MokaStore, Package,
    };
    use rust_decimal_macros::dec;

    struct Fixture {
        catalog: Arc<PackageCatalog>,
        store: Arc<SubscriptionStore>,
        resolver: Arc<EntitlementResolver>,
        clock: Arc<ManualClock>,
        assignor: SubscriptionAssignor,
        package_a: PackageId,
        package_b: PackageId,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(PackageCatalog::new());
        let mut default = Package::new("Free", dec!(0), 0);
        default.is_default = true;
        catalog.create(default);
        let package_a = catalog.create(Package::new("A", dec!(150000), 30)).id;
        let package_b = catalog.create(Package::new("B", dec!(300000), 30)).id;

        let store = Arc::new(SubscriptionStore::new());
        let clock = Arc::new(ManualClock::default());
        let cache: Arc<dyn CacheStore> = Arc::new(MokaStore::new(64));
        let resolver = Arc::new(EntitlementResolver::new(
            catalog.clone(),
            store.clone(),
            cache,
            clock.clone(),
            EntitlementConfig::default(),
        ));
        let assignor = SubscriptionAssignor::new(
            catalog.clone(),
            store.clone(),
            resolver.clone(),
            clock.clone(),
        );
        Fixture {
            catalog,
            store,
            resolver,
            clock,
            assignor,
            package_a,
            package_b,
        }
    }

    #[test]
    fn test_first_assignment_charges_full_price() {
        let f = fixture();
        let business = BusinessId::new();

        let quote = f.assignor.quote(business, f.package_a, None).unwrap();
        assert_eq!(quote.daily_rate, dec!(5000));
        assert_eq!(quote.base_charge, dec!(150000));
        assert_eq!(quote.charge, dec!(150000));
        assert_eq!(quote.remaining_value, dec!(0));
        assert!(!quote.is_renewal);

        let assignment = f.assignor.assign(business, f.package_a, None).unwrap();
        assert!(assignment.subscription.is_active);
        assert_eq!(
            f.store.history(business).last().unwrap().action,
            HistoryAction::Assigned
        );
    }

    #[test]
    fn test_switch_with_remaining_days_is_prorated() {
        let f = fixture();
        let business = BusinessId::new();
        f.assignor.assign(business, f.package_a, None).unwrap();

        // 20 days elapse, 10 remain on package A (daily rate 5,000)
        f.clock.advance(Duration::days(20));
        let quote = f.assignor.quote(business, f.package_b, None).unwrap();
        assert_eq!(quote.base_charge, dec!(300000));
        assert_eq!(quote.remaining_days, 10);
        assert_eq!(quote.remaining_value, dec!(50000));
        assert_eq!(quote.charge, dec!(250000));
        assert!(!quote.is_renewal);
    }

    #[test]
    fn test_renewal_receives_no_credit() {
        let f = fixture();
        let business = BusinessId::new();
        f.assignor.assign(business, f.package_a, None).unwrap();

        f.clock.advance(Duration::days(20));
        let quote = f.assignor.quote(business, f.package_a, None).unwrap();
        assert!(quote.is_renewal);
        assert_eq!(quote.charge, dec!(150000));
        assert_eq!(quote.remaining_value, dec!(0));
        assert_eq!(quote.remaining_days, 0);

        let assignment = f.assignor.assign(business, f.package_a, None).unwrap();
        assert_eq!(
            f.store.history(business).last().unwrap().action,
            HistoryAction::Renewed
        );
        assert_eq!(assignment.quote.charge, dec!(150000));
    }

    #[test]
    fn test_downgrade_charge_floors_at_zero() {
        let f = fixture();
        let business = BusinessId::new();
        f.assignor.assign(business, f.package_b, None).unwrap();

        // 25 days remain on B (10,000/day = 250,000 credit); a 30-day
        // term of A costs 150,000
        f.clock.advance(Duration::days(5));
        let quote = f.assignor.quote(business, f.package_a, None).unwrap();
        assert_eq!(quote.remaining_days, 25);
        assert_eq!(quote.remaining_value, dec!(250000));
        assert_eq!(quote.charge, dec!(0));
    }

    #[test]
    fn test_expired_subscription_gets_no_credit() {
        let f = fixture();
        let business = BusinessId::new();
        f.assignor.assign(business, f.package_a, None).unwrap();

        f.clock.advance(Duration::days(35));
        let quote = f.assignor.quote(business, f.package_b, None).unwrap();
        assert_eq!(quote.remaining_days, 0);
        assert_eq!(quote.remaining_value, dec!(0));
        assert_eq!(quote.charge, dec!(300000));
    }

    #[test]
    fn test_partial_day_remainder_rounds_up() {
        let f = fixture();
        let business = BusinessId::new();
        f.assignor.assign(business, f.package_a, None).unwrap();

        // 20 days and 12 hours elapse; 9.5 days remain, billed as 10
        f.clock.advance(Duration::days(20) + Duration::hours(12));
        let quote = f.assignor.quote(business, f.package_b, None).unwrap();
        assert_eq!(quote.remaining_days, 10);
    }

    #[test]
    fn test_requested_duration_overrides_package_term() {
        let f = fixture();
        let business = BusinessId::new();
        let quote = f.assignor.quote(business, f.package_a, Some(60)).unwrap();
        assert_eq!(quote.base_charge, dec!(300000)); // 5,000/day * 60

        let err = f.assignor.quote(business, f.package_a, Some(0)).unwrap_err();
        assert!(matches!(err, BillingError::InvalidDuration(0)));
        let err = f.assignor.quote(business, f.package_a, Some(-3)).unwrap_err();
        assert!(matches!(err, BillingError::InvalidDuration(-3)));
    }

    #[test]
    fn test_unknown_package_rejected() {
        let f = fixture();
        let err = f
            .assignor
            .quote(BusinessId::new(), PackageId::new(), None)
            .unwrap_err();
        assert!(matches!(err, BillingError::PackageNotFound(_)));
    }

    #[test]
    fn test_at_most_one_active_after_repeated_assigns() {
        let f = fixture();
        let business = BusinessId::new();
        for _ in 0..3 {
            f.assignor.assign(business, f.package_a, None).unwrap();
            f.assignor.assign(business, f.package_b, None).unwrap();
        }
        assert_eq!(f.store.active_row_count(business), 1);
    }

    #[test]
    fn test_concurrent_assigns_commit_exactly_one_lineage() {
        let f = fixture();
        let business = BusinessId::new();
        let assignor = Arc::new(f.assignor);

        let mut handles = Vec::new();
        for i in 0..8 {
            let assignor = assignor.clone();
            let package = if i % 2 == 0 { f.package_a } else { f.package_b };
            handles.push(std::thread::spawn(move || {
                assignor.assign(business, package, None)
            }));
        }

        let mut committed = 0u32;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(_) => committed += 1,
                // a loser priced against a superseded row must surface
                // the conflict, never silently double-credit
                Err(err) => {
                    assert!(matches!(err, BillingError::DuplicateActiveSubscription(_)))
                }
            }
        }
        assert!(committed >= 1);
        assert_eq!(f.store.active_row_count(business), 1);
    }

    #[test]
    fn test_assign_invalidates_entitlement_cache() {
        let f = fixture();
        let business = BusinessId::new();
        f.assignor.assign(business, f.package_a, None).unwrap();

        // warm the cache with package A
        let resolved = f.resolver.resolve(business).unwrap();
        assert_eq!(resolved.package.id, f.package_a);
        assert_eq!(resolved.source, EntitlementSource::ActiveSubscription);

        // switching must be visible immediately, within the TTL window
        f.assignor.assign(business, f.package_b, None).unwrap();
        let resolved = f.resolver.resolve(business).unwrap();
        assert_eq!(resolved.package.id, f.package_b);
    }

    #[test]
    fn test_zero_duration_package_uses_flat_daily_rate() {
        let f = fixture();
        let flat = f.catalog.create(Package::new("Flat", dec!(1000), 0));
        let quote = f
            .assignor
            .quote(BusinessId::new(), flat.id, Some(3))
            .unwrap();
        assert_eq!(quote.daily_rate, dec!(1000));
        assert_eq!(quote.base_charge, dec!(3000));
    }
}
