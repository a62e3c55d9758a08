//! Withdrawal request flow
//!
//! A request freezes funds, approval settles the frozen amount as a
//! withdrawal debit, rejection only releases the freeze. The decision
//! step mutates the request inside its map entry, so two operators
//! racing on the same request cannot both settle it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dir_common::{Clock, TransactionId, UserId, WalletId, WithdrawalId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::wallet::{TransactionMetadata, TransactionReference, WalletLedger};
use crate::BillingError;

/// Lifecycle of a withdrawal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalStatus {
    /// Funds frozen, awaiting an operator decision.
    Pending,
    /// Paid out; funds debited and unfrozen.
    Approved,
    /// Declined; funds released.
    Rejected,
}

/// A request to pay out wallet funds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    /// Request identifier.
    pub id: WithdrawalId,
    /// Wallet the payout draws from.
    pub wallet_id: WalletId,
    /// Requested payout amount.
    pub amount: Decimal,
    /// Current state.
    pub status: WithdrawalStatus,
    /// Free-form note from the requester (payout destination etc).
    pub note: Option<String>,
    /// When the request was made.
    pub requested_at: DateTime<Utc>,
    /// When an operator decided it.
    pub decided_at: Option<DateTime<Utc>>,
    /// Operator who decided it.
    pub decided_by: Option<UserId>,
    /// Ledger entry for the payout, set on approval.
    pub transaction_id: Option<TransactionId>,
}

/// Withdrawal desk: request intake and operator decisions.
pub struct WithdrawalDesk {
    ledger: Arc<WalletLedger>,
    requests: DashMap<WithdrawalId, WithdrawalRequest>,
    clock: Arc<dyn Clock>,
}

impl WithdrawalDesk {
    /// Wire the desk to the ledger.
    pub fn new(ledger: Arc<WalletLedger>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            requests: DashMap::new(),
            clock,
        }
    }

    /// Open a request, freezing the amount. Fails without state change
    /// if the wallet cannot cover it.
    pub fn request(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        note: Option<String>,
    ) -> Result<WithdrawalRequest, BillingError> {
        self.ledger.freeze(wallet_id, amount)?;
        let request = WithdrawalRequest {
            id: WithdrawalId::new(),
            wallet_id,
            amount,
            status: WithdrawalStatus::Pending,
            note,
            requested_at: self.clock.now(),
            decided_at: None,
            decided_by: None,
            transaction_id: None,
        };
        self.requests.insert(request.id, request.clone());
        info!(request_id = %request.id, wallet_id = %wallet_id, amount = %amount, "withdrawal requested");
        Ok(request)
    }

    /// Approve a pending request: settle the frozen amount as a
    /// withdrawal debit.
    pub fn approve(
        &self,
        request_id: WithdrawalId,
        by: UserId,
    ) -> Result<WithdrawalRequest, BillingError> {
        let mut entry = self
            .requests
            .get_mut(&request_id)
            .ok_or(BillingError::WithdrawalNotFound(request_id))?;
        if entry.status != WithdrawalStatus::Pending {
            return Err(BillingError::WithdrawalAlreadyDecided(request_id));
        }

        let txn = self.ledger.debit_frozen(
            entry.wallet_id,
            entry.amount,
            TransactionReference::withdrawal(request_id),
            TransactionMetadata::WithdrawalPayout { request_id },
        )?;

        entry.status = WithdrawalStatus::Approved;
        entry.decided_at = Some(self.clock.now());
        entry.decided_by = Some(by);
        entry.transaction_id = Some(txn.id);
        info!(request_id = %request_id, transaction_id = %txn.id, "withdrawal approved");
        Ok(entry.clone())
    }

    /// Reject a pending request: release the frozen amount.
    pub fn reject(
        &self,
        request_id: WithdrawalId,
        by: UserId,
    ) -> Result<WithdrawalRequest, BillingError> {
        let mut entry = self
            .requests
            .get_mut(&request_id)
            .ok_or(BillingError::WithdrawalNotFound(request_id))?;
        if entry.status != WithdrawalStatus::Pending {
            return Err(BillingError::WithdrawalAlreadyDecided(request_id));
        }

        self.ledger.unfreeze(entry.wallet_id, entry.amount)?;

        entry.status = WithdrawalStatus::Rejected;
        entry.decided_at = Some(self.clock.now());
        entry.decided_by = Some(by);
        info!(request_id = %request_id, "withdrawal rejected");
        Ok(entry.clone())
    }

    /// Look up a request.
    pub fn get(&self, request_id: WithdrawalId) -> Option<WithdrawalRequest> {
        self.requests.get(&request_id).map(|r| r.clone())
    }

    /// All requests for a wallet, oldest first.
    pub fn for_wallet(&self, wallet_id: WalletId) -> Vec<WithdrawalRequest> {
        let mut requests: Vec<WithdrawalRequest> = self
            .requests
            .iter()
            .filter(|r| r.wallet_id == wallet_id)
            .map(|r| r.clone())
            .collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }
}
