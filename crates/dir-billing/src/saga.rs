//! Payment saga orchestration
//!
//! Debit the wallet, commit the new subscription, settle the invoice:
//! three locally-committed steps with no distributed transaction.
//! Failures before the ledger debit are ordinary validation errors and
//! leave all state untouched. The debit is the point of no return:
//! once it commits, a failure in the assignment or invoicing step is
//! fatal, with no automatic compensating reversal or silent retry. The
//! saga journals every step so the fatal path can be diagnosed from
//! persisted state and reconciled by an operator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dir_common::{
    BusinessId, Clock, InvoiceId, OwnerId, PackageId, PaymentId, SubscriptionId, TransactionId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::assignor::{Assignor, PricingQuote};
use crate::directory::BusinessDirectory;
use crate::invoicing::{InvoiceKind, InvoiceRequest, InvoiceService};
use crate::wallet::{
    TransactionKind, TransactionMetadata, TransactionReference, WalletLedger, WalletStatus,
};
use crate::BillingError;

/// The saga's three steps, in commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStep {
    /// Ledger debit. Its commit is the point of no return.
    Debit,
    /// Subscription assignment plus history and cache invalidation.
    Assign,
    /// Invoice settlement by the external collaborator.
    Invoice,
}

/// Progress state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Step began executing.
    Started,
    /// Step committed.
    Committed,
    /// Step failed.
    Failed,
}

/// One journaled step transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Which step.
    pub step: SagaStep,
    /// What happened.
    pub status: StepStatus,
    /// When it was recorded.
    pub at: DateTime<Utc>,
    /// Failure detail, if any.
    pub detail: Option<String>,
}

/// Terminal state of a saga run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaOutcome {
    /// Still executing.
    InFlight,
    /// All steps committed.
    Completed,
    /// Rejected before any money moved.
    Rejected,
    /// Money moved but a later step failed; needs manual
    /// reconciliation.
    Incomplete,
}

/// Persisted record of one payment saga run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSagaRecord {
    /// Run identifier.
    pub payment_id: PaymentId,
    /// Paying wallet owner.
    pub owner_id: OwnerId,
    /// Business being entitled.
    pub business_id: BusinessId,
    /// Target package.
    pub package_id: PackageId,
    /// Amount the run set out to collect.
    pub charge: Decimal,
    /// Ledger entry, once the debit committed.
    pub transaction_id: Option<TransactionId>,
    /// Invoice, once settled.
    pub invoice_id: Option<InvoiceId>,
    /// Step transitions, in order.
    pub steps: Vec<StepRecord>,
    /// Terminal state.
    pub outcome: SagaOutcome,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// When it reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Step log for saga runs, queryable for operator reconciliation.
pub struct SagaJournal {
    records: DashMap<PaymentId, PaymentSagaRecord>,
}

impl SagaJournal {
    /// Empty journal.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    fn begin(
        &self,
        owner_id: OwnerId,
        business_id: BusinessId,
        package_id: PackageId,
        charge: Decimal,
        now: DateTime<Utc>,
    ) -> PaymentId {
        let payment_id = PaymentId::new();
        self.records.insert(
            payment_id,
            PaymentSagaRecord {
                payment_id,
                owner_id,
                business_id,
                package_id,
                charge,
                transaction_id: None,
                invoice_id: None,
                steps: Vec::new(),
                outcome: SagaOutcome::InFlight,
                started_at: now,
                finished_at: None,
            },
        );
        payment_id
    }

    fn record_step(
        &self,
        payment_id: PaymentId,
        step: SagaStep,
        status: StepStatus,
        now: DateTime<Utc>,
        detail: Option<String>,
    ) {
        if let Some(mut record) = self.records.get_mut(&payment_id) {
            record.steps.push(StepRecord {
                step,
                status,
                at: now,
                detail,
            });
        }
    }

    fn set_transaction(&self, payment_id: PaymentId, transaction_id: TransactionId) {
        if let Some(mut record) = self.records.get_mut(&payment_id) {
            record.transaction_id = Some(transaction_id);
        }
    }

    fn set_invoice(&self, payment_id: PaymentId, invoice_id: InvoiceId) {
        if let Some(mut record) = self.records.get_mut(&payment_id) {
            record.invoice_id = Some(invoice_id);
        }
    }

    fn finish(&self, payment_id: PaymentId, outcome: SagaOutcome, now: DateTime<Utc>) {
        if let Some(mut record) = self.records.get_mut(&payment_id) {
            record.outcome = outcome;
            record.finished_at = Some(now);
        }
    }

    /// Look up a run.
    pub fn get(&self, payment_id: PaymentId) -> Option<PaymentSagaRecord> {
        self.records.get(&payment_id).map(|r| r.clone())
    }

    /// Runs where money moved but a later step failed. The operator
    /// reconciliation worklist.
    pub fn incomplete(&self) -> Vec<PaymentSagaRecord> {
        self.records
            .iter()
            .filter(|r| r.outcome == SagaOutcome::Incomplete)
            .map(|r| r.clone())
            .collect()
    }
}

impl Default for SagaJournal {
    fn default() -> Self {
        Self::new()
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Upper bound on the invoicing call. A timeout after the debit is
    /// fatal, never a reversal.
    pub invoice_timeout: Duration,
    /// Flat pass-through tax rate applied to the charge.
    pub tax_rate: Decimal,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            invoice_timeout: Duration::from_secs(10),
            tax_rate: Decimal::ZERO,
        }
    }
}

/// Composite result of a completed payment saga.
#[derive(Debug, Clone)]
pub struct PaymentReceipt {
    /// Saga run identifier.
    pub payment_id: PaymentId,
    /// Committed ledger entry.
    pub transaction_id: TransactionId,
    /// Settled invoice.
    pub invoice_id: InvoiceId,
    /// Wallet balance after the debit.
    pub new_balance: Decimal,
    /// The new active subscription.
    pub subscription_id: SubscriptionId,
    /// New term start.
    pub period_start: DateTime<Utc>,
    /// New term end.
    pub period_end: DateTime<Utc>,
    /// The proration breakdown that was collected.
    pub quote: PricingQuote,
}

/// Payment saga orchestrator
///
/// Owns the failure/rollback policy: validation failures leave state
/// untouched, post-debit failures are journaled, logged loudly, and
/// surfaced as [`BillingError::PaymentIncomplete`].
pub struct PaymentOrchestrator {
    ledger: Arc<WalletLedger>,
    assignor: Arc<dyn Assignor>,
    directory: Arc<dyn BusinessDirectory>,
    invoicer: Arc<dyn InvoiceService>,
    journal: Arc<SagaJournal>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    /// Wire the orchestrator from its collaborators.
    pub fn new(
        ledger: Arc<WalletLedger>,
        assignor: Arc<dyn Assignor>,
        directory: Arc<dyn BusinessDirectory>,
        invoicer: Arc<dyn InvoiceService>,
        journal: Arc<SagaJournal>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger,
            assignor,
            directory,
            invoicer,
            journal,
            clock,
            config,
        }
    }

    /// Pay for a subscription out of the owner's wallet.
    ///
    /// Steps run strictly in sequence: each step's inputs depend on the
    /// previous step's committed state. There is no cancellation path
    /// once the ledger debit has committed.
    pub async fn pay_for_subscription(
        &self,
        owner_id: OwnerId,
        business_id: BusinessId,
        package_id: PackageId,
        duration_days: Option<i64>,
    ) -> Result<PaymentReceipt, BillingError> {
        // validation phase: nothing is written, failures are ordinary
        let wallet = self.ledger.get_or_create(owner_id)?;
        if wallet.status != WalletStatus::Active {
            return Err(BillingError::WalletNotActive(wallet.id));
        }
        if !self.directory.exists(business_id) {
            return Err(BillingError::BusinessNotFound(business_id));
        }

        let quote = self.assignor.quote(business_id, package_id, duration_days)?;
        if quote.charge > wallet.available() {
            return Err(BillingError::InsufficientFunds {
                requested: quote.charge,
                available: wallet.available(),
            });
        }

        let payment_id = self.journal.begin(
            owner_id,
            business_id,
            package_id,
            quote.charge,
            self.clock.now(),
        );

        // step A: ledger debit. The atomic in-entry check closes the
        // race against the validation read above.
        self.step_started(payment_id, SagaStep::Debit);
        let txn = match self.ledger.debit(
            wallet.id,
            quote.charge,
            TransactionKind::Payment,
            TransactionReference::business(business_id),
            TransactionMetadata::SubscriptionPayment {
                package_name: quote.package_name.clone(),
                duration_days: quote.duration_days,
                base_charge: quote.base_charge,
                proration_credit: quote.remaining_value,
            },
        ) {
            Ok(txn) => txn,
            Err(err) => {
                self.step_failed(payment_id, SagaStep::Debit, &err);
                self.journal
                    .finish(payment_id, SagaOutcome::Rejected, self.clock.now());
                return Err(err);
            }
        };
        self.journal.set_transaction(payment_id, txn.id);
        self.step_committed(payment_id, SagaStep::Debit);

        // point of no return: money has left the wallet

        // step B: entitlement assignment. Invoicing stays with the
        // orchestrator; the assignor only writes subscription state.
        self.step_started(payment_id, SagaStep::Assign);
        let assignment = match self.assignor.assign(business_id, package_id, duration_days) {
            Ok(assignment) => assignment,
            Err(err) => {
                return Err(self.fatal(payment_id, txn.id, SagaStep::Assign, err.to_string()));
            }
        };
        self.step_committed(payment_id, SagaStep::Assign);

        // step C: invoice settlement, bounded by the configured timeout
        self.step_started(payment_id, SagaStep::Invoice);
        let gross = quote.charge;
        let tax = gross * self.config.tax_rate;
        let request = InvoiceRequest {
            payer_id: owner_id,
            gross_amount: gross,
            tax_amount: tax,
            net_amount: gross - tax,
            kind: InvoiceKind::Subscription,
            reference_id: txn.id,
            description: format!(
                "{} subscription, {} days",
                quote.package_name, quote.duration_days
            ),
        };
        let invoice_id =
            match tokio::time::timeout(self.config.invoice_timeout, self.invoicer.create_and_settle(request))
                .await
            {
                Err(_) => {
                    return Err(self.fatal(
                        payment_id,
                        txn.id,
                        SagaStep::Invoice,
                        "invoicing timed out".into(),
                    ));
                }
                Ok(Err(err)) => {
                    return Err(self.fatal(payment_id, txn.id, SagaStep::Invoice, err.to_string()));
                }
                Ok(Ok(invoice_id)) => invoice_id,
            };
        self.journal.set_invoice(payment_id, invoice_id);
        self.step_committed(payment_id, SagaStep::Invoice);
        self.journal
            .finish(payment_id, SagaOutcome::Completed, self.clock.now());

        info!(
            payment_id = %payment_id,
            transaction_id = %txn.id,
            invoice_id = %invoice_id,
            charge = %quote.charge,
            "payment saga completed"
        );

        Ok(PaymentReceipt {
            payment_id,
            transaction_id: txn.id,
            invoice_id,
            new_balance: txn.balance_after,
            subscription_id: assignment.subscription.id,
            period_start: assignment.subscription.start_date,
            period_end: assignment.subscription.end_date,
            quote,
        })
    }

    fn step_started(&self, payment_id: PaymentId, step: SagaStep) {
        self.journal
            .record_step(payment_id, step, StepStatus::Started, self.clock.now(), None);
    }

    fn step_committed(&self, payment_id: PaymentId, step: SagaStep) {
        self.journal
            .record_step(payment_id, step, StepStatus::Committed, self.clock.now(), None);
    }

    fn step_failed(&self, payment_id: PaymentId, step: SagaStep, err: &BillingError) {
        self.journal.record_step(
            payment_id,
            step,
            StepStatus::Failed,
            self.clock.now(),
            Some(err.to_string()),
        );
    }

    /// Journal and surface a post-debit failure. Deliberately no
    /// compensating reversal: the ledger entry stands and an operator
    /// reconciles from the journal.
    fn fatal(
        &self,
        payment_id: PaymentId,
        transaction_id: TransactionId,
        step: SagaStep,
        detail: String,
    ) -> BillingError {
        let now = self.clock.now();
        self.journal
            .record_step(payment_id, step, StepStatus::Failed, now, Some(detail.clone()));
        self.journal.finish(payment_id, SagaOutcome::Incomplete, now);
        error!(
            payment_id = %payment_id,
            transaction_id = %transaction_id,
            step = ?step,
            detail = %detail,
            "payment saga failed after ledger debit; manual reconciliation required"
        );
        BillingError::PaymentIncomplete {
            transaction_id,
            step,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignor::{Assignment, SubscriptionAssignor};
    use crate::directory::MemoryDirectory;
    use crate::invoicing::{InvoiceError, MemoryInvoicer};
    use dir_common::{ErrorKind, ManualClock};
    use dir_entitlement::{
        CacheStore, EntitlementConfig, EntitlementResolver, MokaStore, Package, PackageCatalog,
        SubscriptionStore,
    };
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        ledger: Arc<WalletLedger>,
        store: Arc<SubscriptionStore>,
        resolver: Arc<EntitlementResolver>,
        directory: Arc<MemoryDirectory>,
        invoicer: Arc<MemoryInvoicer>,
        journal: Arc<SagaJournal>,
        clock: Arc<ManualClock>,
        orchestrator: PaymentOrchestrator,
        owner: OwnerId,
        business: BusinessId,
        standard: PackageId,
        premium: PackageId,
    }

    /// Wraps the real assignor and fails `assign` on demand while
    /// leaving `quote` untouched.
    struct FaultyAssignor {
        inner: SubscriptionAssignor,
        fail_assign: AtomicBool,
    }

    impl Assignor for FaultyAssignor {
        fn quote(
            &self,
            business_id: BusinessId,
            package_id: PackageId,
            duration_days: Option<i64>,
        ) -> Result<PricingQuote, BillingError> {
            self.inner.quote(business_id, package_id, duration_days)
        }

        fn assign(
            &self,
            business_id: BusinessId,
            package_id: PackageId,
            duration_days: Option<i64>,
        ) -> Result<Assignment, BillingError> {
            if self.fail_assign.swap(false, Ordering::SeqCst) {
                return Err(BillingError::BusinessNotFound(business_id));
            }
            self.inner.assign(business_id, package_id, duration_days)
        }
    }

    fn fixture() -> (Fixture, Arc<FaultyAssignor>) {
        let catalog = Arc::new(PackageCatalog::new());
        let mut free = Package::new("Free", dec!(0), 0);
        free.is_default = true;
        catalog.create(free);
        let standard = catalog.create(Package::new("Standard", dec!(150000), 30)).id;
        let premium = catalog.create(Package::new("Premium", dec!(300000), 30)).id;

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
        let assignor = Arc::new(FaultyAssignor {
            inner: SubscriptionAssignor::new(
                catalog.clone(),
                store.clone(),
                resolver.clone(),
                clock.clone(),
            ),
            fail_assign: AtomicBool::new(false),
        });

        let ledger = Arc::new(WalletLedger::new(clock.clone()));
        let directory = Arc::new(MemoryDirectory::new());
        let invoicer = Arc::new(MemoryInvoicer::new());
        let journal = Arc::new(SagaJournal::new());

        let owner = OwnerId::new();
        let business = BusinessId::new();
        directory.register(business, "Blue Harbor Cafe");
        let wallet = ledger.get_or_create(owner).unwrap();
        ledger
            .credit(
                wallet.id,
                dec!(500000),
                TransactionKind::Deposit,
                TransactionReference::manual(),
                TransactionMetadata::None,
            )
            .unwrap();

        let orchestrator = PaymentOrchestrator::new(
            ledger.clone(),
            assignor.clone(),
            directory.clone(),
            invoicer.clone(),
            journal.clone(),
            clock.clone(),
            OrchestratorConfig::default(),
        );

        (
            Fixture {
                ledger,
                store,
                resolver,
                directory,
                invoicer,
                journal,
                clock,
                orchestrator,
                owner,
                business,
                standard,
                premium,
            },
            assignor,
        )
    }

    #[tokio::test]
    async fn test_happy_path_debits_assigns_and_invoices() {
        let (f, _) = fixture();
        let receipt = f
            .orchestrator
            .pay_for_subscription(f.owner, f.business, f.standard, None)
            .await
            .unwrap();

        assert_eq!(receipt.quote.charge, dec!(150000));
        assert_eq!(receipt.new_balance, dec!(350000));

        let wallet = f.ledger.get_or_create(f.owner).unwrap();
        assert_eq!(wallet.balance, dec!(350000));

        let sub = f.store.current(f.business).unwrap();
        assert!(sub.is_active);
        assert_eq!(sub.id, receipt.subscription_id);

        assert_eq!(f.invoicer.settled_for(receipt.transaction_id), Some(receipt.invoice_id));

        let record = f.journal.get(receipt.payment_id).unwrap();
        assert_eq!(record.outcome, SagaOutcome::Completed);
        assert_eq!(record.transaction_id, Some(receipt.transaction_id));

        // entitlement read path reflects the purchase immediately
        let resolved = f.resolver.resolve(f.business).unwrap();
        assert_eq!(resolved.package.id, f.standard);
    }

    #[tokio::test]
    async fn test_upgrade_is_prorated_through_the_saga() {
        let (f, _) = fixture();
        f.orchestrator
            .pay_for_subscription(f.owner, f.business, f.standard, None)
            .await
            .unwrap();

        // immediately upgrade: 30 full days remain, credit 150,000
        let receipt = f
            .orchestrator
            .pay_for_subscription(f.owner, f.business, f.premium, None)
            .await
            .unwrap();
        assert_eq!(receipt.quote.remaining_value, dec!(150000));
        assert_eq!(receipt.quote.charge, dec!(150000));

        let wallet = f.ledger.get_or_create(f.owner).unwrap();
        assert_eq!(wallet.balance, dec!(200000));
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_all_state_untouched() {
        let (f, _) = fixture();
        // drain most of the wallet first
        let wallet = f.ledger.get_or_create(f.owner).unwrap();
        f.ledger
            .debit(
                wallet.id,
                dec!(450000),
                TransactionKind::Payment,
                TransactionReference::manual(),
                TransactionMetadata::None,
            )
            .unwrap();

        let err = f
            .orchestrator
            .pay_for_subscription(f.owner, f.business, f.standard, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InsufficientFunds { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);

        assert!(f.store.current(f.business).is_none());
        assert_eq!(f.invoicer.count(), 0);
        assert!(f.journal.incomplete().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_wallet_is_rejected_up_front() {
        let (f, _) = fixture();
        let wallet = f.ledger.get_or_create(f.owner).unwrap();
        f.ledger.set_status(wallet.id, WalletStatus::Frozen).unwrap();

        let err = f
            .orchestrator
            .pay_for_subscription(f.owner, f.business, f.standard, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WalletNotActive(_)));
    }

    #[tokio::test]
    async fn test_unknown_business_is_rejected_up_front() {
        let (f, _) = fixture();
        let err = f
            .orchestrator
            .pay_for_subscription(f.owner, BusinessId::new(), f.standard, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::BusinessNotFound(_)));
    }

    #[tokio::test]
    async fn test_assignment_failure_after_debit_is_fatal() {
        let (f, assignor) = fixture();
        assignor.fail_assign.store(true, Ordering::SeqCst);

        let err = f
            .orchestrator
            .pay_for_subscription(f.owner, f.business, f.standard, None)
            .await
            .unwrap_err();

        // the money moved and stays moved
        let wallet = f.ledger.get_or_create(f.owner).unwrap();
        assert_eq!(wallet.balance, dec!(350000));
        // no active subscription was created
        assert!(f.store.current(f.business).is_none());
        // no invoice either; the orchestrator never reached step C
        assert_eq!(f.invoicer.count(), 0);

        assert_eq!(err.kind(), ErrorKind::Fatal);
        let transaction_id = match err {
            BillingError::PaymentIncomplete {
                transaction_id,
                step: SagaStep::Assign,
                ..
            } => transaction_id,
            other => panic!("expected PaymentIncomplete at Assign, got {other:?}"),
        };

        let incomplete = f.journal.incomplete();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].transaction_id, Some(transaction_id));
        let last = incomplete[0].steps.last().unwrap();
        assert_eq!(last.step, SagaStep::Assign);
        assert_eq!(last.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_invoice_failure_after_debit_is_fatal() {
        let (f, _) = fixture();
        f.invoicer.fail_next();

        let err = f
            .orchestrator
            .pay_for_subscription(f.owner, f.business, f.standard, None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(matches!(
            err,
            BillingError::PaymentIncomplete {
                step: SagaStep::Invoice,
                ..
            }
        ));
        // user-facing message stays generic; internals keep the txn id
        assert!(err.user_message().contains("contact support"));

        // debit and assignment both stand; only the invoice is missing
        let wallet = f.ledger.get_or_create(f.owner).unwrap();
        assert_eq!(wallet.balance, dec!(350000));
        assert!(f.store.current(f.business).unwrap().is_active);
        assert_eq!(f.invoicer.count(), 0);
        assert_eq!(f.journal.incomplete().len(), 1);
    }

    /// Never answers within any realistic deadline.
    struct SlowInvoicer;

    #[async_trait::async_trait]
    impl InvoiceService for SlowInvoicer {
        async fn create_and_settle(
            &self,
            _request: InvoiceRequest,
        ) -> Result<InvoiceId, InvoiceError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(InvoiceId::new())
        }
    }

    #[tokio::test]
    async fn test_invoice_timeout_after_debit_is_fatal() {
        let (f, assignor) = fixture();
        let orchestrator = PaymentOrchestrator::new(
            f.ledger.clone(),
            assignor,
            f.directory.clone(),
            Arc::new(SlowInvoicer),
            f.journal.clone(),
            f.clock.clone(),
            OrchestratorConfig {
                invoice_timeout: Duration::from_millis(50),
                tax_rate: Decimal::ZERO,
            },
        );

        let err = orchestrator
            .pay_for_subscription(f.owner, f.business, f.standard, None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(matches!(
            err,
            BillingError::PaymentIncomplete {
                step: SagaStep::Invoice,
                ..
            }
        ));

        // debit and assignment stand; only the invoice never settled
        let wallet = f.ledger.get_or_create(f.owner).unwrap();
        assert_eq!(wallet.balance, dec!(350000));
        assert!(f.store.current(f.business).unwrap().is_active);

        let incomplete = f.journal.incomplete();
        assert_eq!(incomplete.len(), 1);
        let last = incomplete[0].steps.last().unwrap();
        assert_eq!(last.step, SagaStep::Invoice);
        assert_eq!(last.status, StepStatus::Failed);
        assert_eq!(last.detail.as_deref(), Some("invoicing timed out"));
    }

    #[tokio::test]
    async fn test_journal_record_serializes_for_operator_tooling() {
        let (f, assignor) = fixture();
        assignor.fail_assign.store(true, Ordering::SeqCst);
        let _ = f
            .orchestrator
            .pay_for_subscription(f.owner, f.business, f.standard, None)
            .await;

        let record = f.journal.incomplete().remove(0);
        let json = serde_json::to_value(&record).unwrap();
        // stable names; the reconciliation tooling greps for these
        assert_eq!(json["outcome"], "Incomplete");
        assert_eq!(json["steps"].as_array().unwrap().last().unwrap()["step"], "Assign");
        assert!(json["transaction_id"].is_string());
    }

    #[tokio::test]
    async fn test_renewal_pays_full_price_through_the_saga() {
        let (f, _) = fixture();
        f.orchestrator
            .pay_for_subscription(f.owner, f.business, f.standard, None)
            .await
            .unwrap();
        let receipt = f
            .orchestrator
            .pay_for_subscription(f.owner, f.business, f.standard, None)
            .await
            .unwrap();

        assert!(receipt.quote.is_renewal);
        assert_eq!(receipt.quote.charge, dec!(150000));
        assert_eq!(receipt.quote.remaining_value, dec!(0));
        // exactly one active subscription after both payments
        assert_eq!(f.store.active_row_count(f.business), 1);
    }
}
