//! Invoicing boundary
//!
//! Turning a payment event into a durable invoice/receipt is owned by
//! an external collaborator. The contract here is idempotent on the
//! ledger transaction id: retrying after a transient failure must not
//! double-invoice.

use async_trait::async_trait;
use dashmap::DashMap;
use dir_common::{InvoiceId, OwnerId, TransactionId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::info;

/// What the invoice settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceKind {
    /// A subscription payment.
    Subscription,
    /// A withdrawal payout receipt.
    Withdrawal,
    /// Operator-issued.
    Manual,
}

/// Everything the collaborator needs to materialize an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRequest {
    /// Who is being invoiced.
    pub payer_id: OwnerId,
    /// Amount including tax.
    pub gross_amount: Decimal,
    /// Flat pass-through tax portion.
    pub tax_amount: Decimal,
    /// Amount excluding tax.
    pub net_amount: Decimal,
    /// What the invoice settles.
    pub kind: InvoiceKind,
    /// Ledger transaction the invoice is tied to; the idempotency key.
    pub reference_id: TransactionId,
    /// Human-readable description.
    pub description: String,
}

/// Invoicing failure. The saga treats any of these after the ledger
/// debit as fatal.
#[derive(Debug, Error)]
pub enum InvoiceError {
    /// The collaborator could not be reached or refused the request.
    #[error("invoicing unavailable: {0}")]
    Unavailable(String),
}

/// External invoicing collaborator.
#[async_trait]
pub trait InvoiceService: Send + Sync {
    /// Create and settle an invoice for a committed payment. Must be
    /// idempotent keyed on `request.reference_id`.
    async fn create_and_settle(&self, request: InvoiceRequest) -> Result<InvoiceId, InvoiceError>;
}

/// In-memory reference implementation. Keeps the idempotency map and
/// supports failure injection for saga tests.
pub struct MemoryInvoicer {
    settled: DashMap<TransactionId, (InvoiceId, InvoiceRequest)>,
    fail_next: AtomicBool,
}

impl MemoryInvoicer {
    /// Empty invoicer.
    pub fn new() -> Self {
        Self {
            settled: DashMap::new(),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Make the next `create_and_settle` call fail once.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// The settled invoice for a ledger transaction, if any.
    pub fn settled_for(&self, reference_id: TransactionId) -> Option<InvoiceId> {
        self.settled.get(&reference_id).map(|entry| entry.0)
    }

    /// Number of distinct invoices settled.
    pub fn count(&self) -> usize {
        self.settled.len()
    }
}

impl Default for MemoryInvoicer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvoiceService for MemoryInvoicer {
    async fn create_and_settle(&self, request: InvoiceRequest) -> Result<InvoiceId, InvoiceError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(InvoiceError::Unavailable("injected failure".into()));
        }
        let entry = self
            .settled
            .entry(request.reference_id)
            .or_insert_with(|| (InvoiceId::new(), request.clone()));
        info!(
            invoice_id = %entry.0,
            reference_id = %request.reference_id,
            gross = %request.gross_amount,
            "invoice settled"
        );
        Ok(entry.0)
    }
}
