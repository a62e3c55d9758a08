//! Wallet ledger, withdrawals, and the payment saga
//!
//! The money side of the directory platform. The wallet ledger is the
//! source of truth for balances; the payment orchestrator sequences
//! debit, subscription assignment, and invoicing into one saga with an
//! asymmetric failure policy.
//!
//! ```text
//!                    +---------------------+
//!                    | PaymentOrchestrator |
//!                    +----------+----------+
//!                               |
//!        +----------+-----------+-----------+----------+
//!        v          v           v           v          v
//!  +----------+ +--------+ +---------+ +---------+ +---------+
//!  |  Wallet  | |Assignor| |Directory| |Invoicer | |  Saga   |
//!  |  Ledger  | | (trait)| | (trait) | | (trait) | | Journal |
//!  +----+-----+ +----+---+ +---------+ +---------+ +---------+
//!       ^             |
//!  +----+-----+       v
//!  |Withdrawal|  dir-entitlement
//!  |   Desk   |  (catalog, store, resolver)
//!  +----------+
//! ```
//!
//! Failure policy: anything before the ledger debit fails as a plain
//! validation error with no state change. Anything after it is fatal,
//! journaled, and left for operator reconciliation.

#![warn(missing_docs)]

pub mod assignor;
pub mod directory;
pub mod invoicing;
pub mod saga;
pub mod wallet;
pub mod withdrawals;

pub use assignor::{Assignment, Assignor, PricingQuote, SubscriptionAssignor};
pub use directory::{BusinessDirectory, MemoryDirectory};
pub use invoicing::{InvoiceError, InvoiceKind, InvoiceRequest, InvoiceService, MemoryInvoicer};
pub use saga::{
    OrchestratorConfig, PaymentOrchestrator, PaymentReceipt, PaymentSagaRecord, SagaJournal,
    SagaOutcome, SagaStep, StepRecord, StepStatus,
};
pub use wallet::{
    TransactionKind, TransactionMetadata, TransactionReference, TransactionStatus, Wallet,
    WalletLedger, WalletStatus, WalletTransaction,
};
pub use withdrawals::{WithdrawalDesk, WithdrawalRequest, WithdrawalStatus};

use std::sync::Arc;
use std::time::Duration;

use dir_common::{
    BusinessId, Clock, ErrorKind, PackageId, SystemClock, TransactionId, WalletId, WithdrawalId,
};
use dir_entitlement::{
    CacheStore, EntitlementConfig, EntitlementError, EntitlementResolver, MokaStore,
    PackageCatalog, SubscriptionStore,
};
use rust_decimal::Decimal;
use thiserror::Error;

/// Billing error types
#[derive(Debug, Error)]
pub enum BillingError {
    /// No wallet with that id.
    #[error("wallet not found: {0}")]
    WalletNotFound(WalletId),

    /// Wallet exists but is frozen or closed.
    #[error("wallet {0} is not active")]
    WalletNotActive(WalletId),

    /// Available balance cannot cover the requested amount.
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Amount the operation asked for.
        requested: Decimal,
        /// Balance minus frozen funds at the time of the check.
        available: Decimal,
    },

    /// Frozen balance cannot cover the requested settlement.
    #[error("insufficient frozen funds: requested {requested}, frozen {frozen}")]
    InsufficientFrozen {
        /// Amount the operation asked for.
        requested: Decimal,
        /// Frozen balance at the time of the check.
        frozen: Decimal,
    },

    /// Amount outside the operation's allowed range.
    #[error("invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Subscription term must be a positive number of days.
    #[error("invalid duration: {0} days")]
    InvalidDuration(i64),

    /// Referenced package does not exist in the catalog.
    #[error("package not found: {0}")]
    PackageNotFound(PackageId),

    /// Payment target is not on record in the directory.
    #[error("business not found: {0}")]
    BusinessNotFound(BusinessId),

    /// No withdrawal request with that id.
    #[error("withdrawal request not found: {0}")]
    WithdrawalNotFound(WithdrawalId),

    /// The withdrawal request was already approved or rejected.
    #[error("withdrawal request {0} already decided")]
    WithdrawalAlreadyDecided(WithdrawalId),

    /// A concurrent assignment superseded the subscription this write
    /// was priced against; committing would have duplicated the active
    /// row. Retryable after re-quoting.
    #[error("duplicate active subscription for business {0}")]
    DuplicateActiveSubscription(BusinessId),

    /// A saga step failed after the ledger debit committed. The debit
    /// stands; an operator reconciles from the journal.
    #[error("payment incomplete after {step:?} (transaction {transaction_id}): {detail}")]
    PaymentIncomplete {
        /// The committed ledger entry.
        transaction_id: TransactionId,
        /// The step that failed.
        step: SagaStep,
        /// Failure detail for the journal and logs.
        detail: String,
    },

    /// Entitlement-layer failure surfaced through a billing operation.
    #[error(transparent)]
    Entitlement(#[from] EntitlementError),
}

impl BillingError {
    /// Coarse classification driving logging and response mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PaymentIncomplete { .. } => ErrorKind::Fatal,
            Self::WithdrawalAlreadyDecided(_) | Self::DuplicateActiveSubscription(_) => {
                ErrorKind::Conflict
            }
            _ => ErrorKind::Validation,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::WalletNotFound(_) => "WALLET_NOT_FOUND",
            Self::WalletNotActive(_) => "WALLET_NOT_ACTIVE",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::InsufficientFrozen { .. } => "INSUFFICIENT_FROZEN",
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::InvalidDuration(_) => "INVALID_DURATION",
            Self::PackageNotFound(_) => "PACKAGE_NOT_FOUND",
            Self::BusinessNotFound(_) => "BUSINESS_NOT_FOUND",
            Self::WithdrawalNotFound(_) => "WITHDRAWAL_NOT_FOUND",
            Self::WithdrawalAlreadyDecided(_) => "WITHDRAWAL_ALREADY_DECIDED",
            Self::DuplicateActiveSubscription(_) => "DUPLICATE_ACTIVE_SUBSCRIPTION",
            Self::PaymentIncomplete { .. } => "PAYMENT_INCOMPLETE",
            Self::Entitlement(inner) => match inner {
                EntitlementError::PackageNotFound(_) => "PACKAGE_NOT_FOUND",
                EntitlementError::NoDefaultPackage => "NO_DEFAULT_PACKAGE",
                EntitlementError::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            },
        }
    }

    /// Message safe to show end users. Fatal internals never leak the
    /// step or transaction detail.
    pub fn user_message(&self) -> String {
        match self {
            Self::PaymentIncomplete { .. } => {
                "Payment could not be completed. Please contact support.".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Facade tuning for [`PaymentPlatform`].
#[derive(Debug, Clone, Copy)]
pub struct PlatformConfig {
    /// Entitlement cache entry lifetime.
    pub cache_ttl: Duration,
    /// Entitlement cache capacity in entries.
    pub cache_capacity: u64,
    /// Upper bound on the invoicing call.
    pub invoice_timeout: Duration,
    /// Flat pass-through tax rate.
    pub tax_rate: Decimal,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 10_000,
            invoice_timeout: Duration::from_secs(10),
            tax_rate: Decimal::ZERO,
        }
    }
}

/// Fully wired entitlement and payment core.
///
/// Owns the package catalog, subscription store, resolver, wallet
/// ledger, withdrawal desk, and the payment orchestrator, wired with
/// the in-memory directory and invoicer implementations. Embedders
/// that bring their own directory or invoicing service assemble the
/// pieces directly instead.
pub struct PaymentPlatform {
    /// Package catalog, seeded with the standard tiers.
    pub catalog: Arc<PackageCatalog>,
    /// Per-business subscription rows and history.
    pub subscriptions: Arc<SubscriptionStore>,
    /// Cached entitlement read path.
    pub resolver: Arc<EntitlementResolver>,
    /// Wallet balances and transaction log.
    pub ledger: Arc<WalletLedger>,
    /// Withdrawal request intake and decisions.
    pub withdrawals: WithdrawalDesk,
    /// Business registry used for payment-target validation.
    pub directory: Arc<MemoryDirectory>,
    /// Invoice collaborator.
    pub invoicer: Arc<MemoryInvoicer>,
    /// Saga step log.
    pub journal: Arc<SagaJournal>,
    /// Payment saga entry point.
    pub orchestrator: PaymentOrchestrator,
}

impl PaymentPlatform {
    /// Wire the platform on the system clock.
    pub fn new(config: PlatformConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Wire the platform on an injected clock.
    pub fn with_clock(config: PlatformConfig, clock: Arc<dyn Clock>) -> Self {
        let catalog = Arc::new(PackageCatalog::with_standard_tiers());
        let subscriptions = Arc::new(SubscriptionStore::new());
        let cache: Arc<dyn CacheStore> = Arc::new(MokaStore::new(config.cache_capacity));
        let resolver = Arc::new(EntitlementResolver::new(
            catalog.clone(),
            subscriptions.clone(),
            cache,
            clock.clone(),
            EntitlementConfig {
                cache_ttl: config.cache_ttl,
            },
        ));

        let ledger = Arc::new(WalletLedger::new(clock.clone()));
        let withdrawals = WithdrawalDesk::new(ledger.clone(), clock.clone());
        let assignor = Arc::new(SubscriptionAssignor::new(
            catalog.clone(),
            subscriptions.clone(),
            resolver.clone(),
            clock.clone(),
        ));
        let directory = Arc::new(MemoryDirectory::new());
        let invoicer = Arc::new(MemoryInvoicer::new());
        let journal = Arc::new(SagaJournal::new());
        let orchestrator = PaymentOrchestrator::new(
            ledger.clone(),
            assignor,
            directory.clone(),
            invoicer.clone(),
            journal.clone(),
            clock,
            OrchestratorConfig {
                invoice_timeout: config.invoice_timeout,
                tax_rate: config.tax_rate,
            },
        );

        Self {
            catalog,
            subscriptions,
            resolver,
            ledger,
            withdrawals,
            directory,
            invoicer,
            journal,
            orchestrator,
        }
    }
}

impl Default for PaymentPlatform {
    fn default() -> Self {
        Self::new(PlatformConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dir_common::{OwnerId, UserId};
    use dir_entitlement::FeatureFlag;
    use rust_decimal_macros::dec;

    fn package_named(platform: &PaymentPlatform, name: &str) -> PackageId {
        platform
            .catalog
            .list()
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_purchase_and_entitlement() {
        let platform = PaymentPlatform::default();
        let owner = OwnerId::new();
        let business = BusinessId::new();
        platform.directory.register(business, "Harbor Books");

        let wallet = platform.ledger.get_or_create(owner).unwrap();
        platform
            .ledger
            .credit(
                wallet.id,
                dec!(400000),
                TransactionKind::Deposit,
                TransactionReference::manual(),
                TransactionMetadata::None,
            )
            .unwrap();

        // before any purchase the business resolves to the default tier
        let before = platform.resolver.resolve(business).unwrap();
        assert!(before.package.is_default);

        let premium = package_named(&platform, "Premium");
        let receipt = platform
            .orchestrator
            .pay_for_subscription(owner, business, premium, None)
            .await
            .unwrap();
        assert_eq!(receipt.new_balance, dec!(100000));

        let after = platform.resolver.resolve(business).unwrap();
        assert_eq!(after.package.id, premium);
        assert!(platform
            .resolver
            .can_use_feature(business, FeatureFlag::FeaturedListing)
            .unwrap());

        assert_eq!(
            platform.invoicer.settled_for(receipt.transaction_id),
            Some(receipt.invoice_id)
        );
        assert_eq!(
            platform.journal.get(receipt.payment_id).unwrap().outcome,
            SagaOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_withdrawal_flow_against_the_shared_ledger() {
        let platform = PaymentPlatform::default();
        let owner = OwnerId::new();
        let wallet = platform.ledger.get_or_create(owner).unwrap();
        platform
            .ledger
            .credit(
                wallet.id,
                dec!(50000),
                TransactionKind::Deposit,
                TransactionReference::manual(),
                TransactionMetadata::None,
            )
            .unwrap();

        let request = platform
            .withdrawals
            .request(wallet.id, dec!(20000), None)
            .unwrap();
        assert_eq!(platform.ledger.get(wallet.id).unwrap().available(), dec!(30000));

        platform.withdrawals.approve(request.id, UserId::new()).unwrap();
        let settled = platform.ledger.get(wallet.id).unwrap();
        assert_eq!(settled.balance, dec!(30000));
        assert_eq!(settled.frozen_balance, dec!(0));
    }

    #[test]
    fn test_error_codes_and_kinds() {
        let insufficient = BillingError::InsufficientFunds {
            requested: dec!(10),
            available: dec!(5),
        };
        assert_eq!(insufficient.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(insufficient.kind(), ErrorKind::Validation);
        // validation errors pass their detail through to the user
        assert!(insufficient.user_message().contains("requested 10"));

        let decided = BillingError::WithdrawalAlreadyDecided(WithdrawalId::new());
        assert_eq!(decided.kind(), ErrorKind::Conflict);

        let incomplete = BillingError::PaymentIncomplete {
            transaction_id: TransactionId::new(),
            step: SagaStep::Invoice,
            detail: "invoicing timed out".into(),
        };
        assert_eq!(incomplete.kind(), ErrorKind::Fatal);
        assert_eq!(incomplete.code(), "PAYMENT_INCOMPLETE");
        assert!(!incomplete.user_message().contains("timed out"));

        let wrapped = BillingError::from(EntitlementError::NoDefaultPackage);
        assert_eq!(wrapped.code(), "NO_DEFAULT_PACKAGE");
        assert_eq!(wrapped.kind(), ErrorKind::Validation);
    }
}
