//! Strongly-typed identifiers
//!
//! Every aggregate gets its own newtype over `Uuid` so a wallet id can
//! never be passed where a business id is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

define_id!(
    /// A business listed in the directory.
    BusinessId
);
define_id!(
    /// A wallet owner (business owner or agent account).
    OwnerId
);
define_id!(
    /// A money wallet.
    WalletId
);
define_id!(
    /// An immutable ledger entry.
    TransactionId
);
define_id!(
    /// A catalog package.
    PackageId
);
define_id!(
    /// A package assignment for a business.
    SubscriptionId
);
define_id!(
    /// An invoice produced by the invoicing collaborator.
    InvoiceId
);
define_id!(
    /// A payment saga run.
    PaymentId
);
define_id!(
    /// A withdrawal request against a wallet.
    WithdrawalId
);
define_id!(
    /// A platform user (admins, operators).
    UserId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_distinct() {
        let a = BusinessId::new();
        let b = BusinessId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_round_trips_uuid() {
        let raw = Uuid::new_v4();
        let id = WalletId::from(raw);
        assert_eq!(id.as_uuid(), raw);
        assert_eq!(id.to_string(), raw.to_string());
    }
}
