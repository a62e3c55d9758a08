//! Subscriptions and their audit trail
//!
//! Each business holds at most one current package assignment. Renewals
//! and upgrades supersede the current row instead of deleting it, and
//! every transition is appended to an immutable history log.
//!
//! All writes for one business go through that business's map entry, so
//! "deactivate old, create new, append history" is atomic with respect
//! to concurrent assignment attempts for the same business.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dir_common::{BusinessId, PackageId, SubscriptionId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EntitlementError;

/// Time-bounded administrative exception: while enabled and unexpired,
/// the business keeps its package's entitlements regardless of the
/// subscription's own end date.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminOverride {
    /// Whether the override is in force.
    pub enabled: bool,
    /// Operator-supplied justification.
    pub reason: Option<String>,
    /// When the override lapses; `None` means until cleared.
    pub expires_at: Option<DateTime<Utc>>,
    /// Who set it.
    pub by_user: Option<UserId>,
}

/// A business's package assignment for a date range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Row identifier.
    pub id: SubscriptionId,
    /// Owning business.
    pub business_id: BusinessId,
    /// Assigned package.
    pub package_id: PackageId,
    /// Term start.
    pub start_date: DateTime<Utc>,
    /// Term end.
    pub end_date: DateTime<Utc>,
    /// Whether this is the live assignment. At most one per business.
    pub is_active: bool,
    /// Renew automatically at term end.
    pub auto_renew: bool,
    /// Administrative exception, if any.
    pub admin_override: AdminOverride,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether the subscription's own term covers `now`.
    pub fn in_term(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.end_date > now
    }

    /// Whether the admin override is enabled and unexpired at `now`.
    pub fn override_in_force(&self, now: DateTime<Utc>) -> bool {
        self.admin_override.enabled
            && self
                .admin_override
                .expires_at
                .map(|exp| exp > now)
                .unwrap_or(true)
    }
}

/// What a history row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryAction {
    /// First assignment for the business.
    Assigned,
    /// Same package, new term.
    Renewed,
    /// Different package superseded the previous one.
    Upgraded,
    /// Term lapsed and the row was marked inactive.
    Expired,
    /// Admin override enabled.
    OverrideSet,
    /// Admin override cleared (manually or by expiry).
    OverrideCleared,
}

/// Append-only audit record for subscription transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionHistory {
    /// Record identifier.
    pub id: Uuid,
    /// Business the transition belongs to.
    pub business_id: BusinessId,
    /// Subscription row the transition applied to.
    pub subscription_id: SubscriptionId,
    /// Package in effect after the transition.
    pub package_id: PackageId,
    /// What happened.
    pub action: HistoryAction,
    /// Amount collected for the transition, zero for administrative
    /// actions.
    pub price: Decimal,
    /// Term start after the transition.
    pub period_start: DateTime<Utc>,
    /// Term end after the transition.
    pub period_end: DateTime<Utc>,
    /// When the transition was recorded.
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
struct BusinessRecord {
    current: Option<Subscription>,
    superseded: Vec<Subscription>,
    history: Vec<SubscriptionHistory>,
}

/// Durable store of subscriptions, keyed by business.
pub struct SubscriptionStore {
    records: DashMap<BusinessId, BusinessRecord>,
}

impl SubscriptionStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// The business's current subscription row, active or not.
    pub fn current(&self, business_id: BusinessId) -> Option<Subscription> {
        self.records
            .get(&business_id)
            .and_then(|r| r.current.clone())
    }

    /// Supersede the current row (if any) with `new`, appending
    /// `history` in the same critical section. The old row is marked
    /// inactive and archived, never deleted.
    ///
    /// `expected_current` is the row id the caller priced against.
    /// Returns `None` without writing anything when the current row no
    /// longer matches it, so a writer that lost the race cannot commit
    /// figures computed from a superseded row.
    pub fn replace_active(
        &self,
        business_id: BusinessId,
        new: Subscription,
        history: SubscriptionHistory,
        expected_current: Option<SubscriptionId>,
    ) -> Option<Subscription> {
        let mut record = self.records.entry(business_id).or_default();
        if record.current.as_ref().map(|s| s.id) != expected_current {
            return None;
        }
        if let Some(mut old) = record.current.take() {
            old.is_active = false;
            old.updated_at = new.created_at;
            record.superseded.push(old);
        }
        record.current = Some(new.clone());
        record.history.push(history);
        Some(new)
    }

    /// Mark the current row inactive because its term lapsed. Returns
    /// the updated row, or `None` when there was nothing active to
    /// expire. Idempotent.
    pub fn expire_current(
        &self,
        business_id: BusinessId,
        now: DateTime<Utc>,
    ) -> Option<Subscription> {
        let mut record = self.records.get_mut(&business_id)?;
        let current = record.current.as_mut()?;
        if !current.is_active {
            return None;
        }
        current.is_active = false;
        current.updated_at = now;
        let snapshot = current.clone();
        record.history.push(SubscriptionHistory {
            id: Uuid::new_v4(),
            business_id,
            subscription_id: snapshot.id,
            package_id: snapshot.package_id,
            action: HistoryAction::Expired,
            price: Decimal::ZERO,
            period_start: snapshot.start_date,
            period_end: snapshot.end_date,
            recorded_at: now,
        });
        Some(snapshot)
    }

    /// Enable an admin override on the current row.
    pub fn set_override(
        &self,
        business_id: BusinessId,
        reason: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        by_user: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EntitlementError> {
        self.mutate_override(
            business_id,
            AdminOverride {
                enabled: true,
                reason,
                expires_at,
                by_user,
            },
            HistoryAction::OverrideSet,
            now,
        )
    }

    /// Clear the admin override on the current row. Idempotent.
    pub fn clear_override(
        &self,
        business_id: BusinessId,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EntitlementError> {
        self.mutate_override(
            business_id,
            AdminOverride::default(),
            HistoryAction::OverrideCleared,
            now,
        )
    }

    fn mutate_override(
        &self,
        business_id: BusinessId,
        new_state: AdminOverride,
        action: HistoryAction,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EntitlementError> {
        let mut record = self
            .records
            .get_mut(&business_id)
            .ok_or(EntitlementError::SubscriptionNotFound(business_id))?;
        let current = record
            .current
            .as_mut()
            .ok_or(EntitlementError::SubscriptionNotFound(business_id))?;
        current.admin_override = new_state;
        current.updated_at = now;
        let snapshot = current.clone();
        record.history.push(SubscriptionHistory {
            id: Uuid::new_v4(),
            business_id,
            subscription_id: snapshot.id,
            package_id: snapshot.package_id,
            action,
            price: Decimal::ZERO,
            period_start: snapshot.start_date,
            period_end: snapshot.end_date,
            recorded_at: now,
        });
        Ok(snapshot)
    }

    /// The business's transition log, oldest first.
    pub fn history(&self, business_id: BusinessId) -> Vec<SubscriptionHistory> {
        self.records
            .get(&business_id)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    /// Count of rows currently flagged active for the business. Used by
    /// invariant checks; must only ever be zero or one.
    pub fn active_row_count(&self, business_id: BusinessId) -> usize {
        self.records
            .get(&business_id)
            .map(|r| {
                let current = r.current.as_ref().map(|s| s.is_active as usize).unwrap_or(0);
                let archived = r.superseded.iter().filter(|s| s.is_active).count();
                current + archived
            })
            .unwrap_or(0)
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
