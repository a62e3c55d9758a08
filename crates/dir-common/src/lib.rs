//! Dirwise Core shared kernel
//!
//! Identifiers, the injectable clock, and pagination types used by the
//! entitlement and billing crates. Keeps the dependency graph strictly
//! unidirectional: everything depends on `dir-common`, it depends on
//! nothing else in the workspace.

#![warn(missing_docs)]

pub mod clock;
pub mod id;
pub mod page;

pub use clock::{Clock, ManualClock, SystemClock};
pub use id::{
    BusinessId, InvoiceId, OwnerId, PackageId, PaymentId, SubscriptionId, TransactionId, UserId,
    WalletId, WithdrawalId,
};
pub use page::{Page, PageRequest};

use serde::{Deserialize, Serialize};

/// Coarse classification of core errors, used by the request layer to
/// map failures onto stable response codes and alerting severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Caller-correctable; no state was changed.
    Validation,
    /// Retryable after reload; another writer won the race.
    Conflict,
    /// Money moved but a downstream step failed; requires manual
    /// reconciliation, never an automatic retry.
    Fatal,
}
