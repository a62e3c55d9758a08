//! Dirwise Entitlement Core
//!
//! Answers the platform's hottest question: "what can this business do
//! right now?"
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ENTITLEMENT RESOLUTION                    │
//! │                                                             │
//! │  resolve(business) ─► Cache ─► Override ─► Subscription     │
//! │                         │         │            │            │
//! │                        TTL     expiry      expiry check     │
//! │                         │         │            │            │
//! │                         └────► Package Catalog ◄── default  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cache is an optimization, never a dependency for correctness: a
//! cache-store outage degrades to direct computation, and the embedded
//! expiry fields are re-checked against the wall clock on every read.

#![warn(missing_docs)]

pub mod cache;
pub mod package;
pub mod resolver;
pub mod subscription;

pub use cache::{CacheError, CacheStore, CachedEntitlement, MokaStore};
pub use package::{FeatureFlag, LimitKey, Package, PackageCatalog};
pub use resolver::{EntitlementConfig, EntitlementResolver, EntitlementSource, ResolvedEntitlement};
pub use subscription::{
    AdminOverride, HistoryAction, Subscription, SubscriptionHistory, SubscriptionStore,
};

use dir_common::{BusinessId, PackageId};
use thiserror::Error;

/// Entitlement error types
#[derive(Debug, Error)]
pub enum EntitlementError {
    /// Referenced package does not exist in the catalog.
    #[error("package not found: {0}")]
    PackageNotFound(PackageId),

    /// The catalog has no default package configured; entitlement
    /// fallback cannot work without one.
    #[error("no default package configured")]
    NoDefaultPackage,

    /// Override operations require an existing subscription row.
    #[error("no subscription on record for business {0}")]
    SubscriptionNotFound(BusinessId),
}
