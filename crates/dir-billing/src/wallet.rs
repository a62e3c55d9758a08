//! Wallet ledger
//!
//! Durable balances plus an append-only transaction log. Every balance
//! mutation happens inside the wallet's map entry, so the balance
//! check, the balance update, and the log append form one atomic unit
//! per wallet; two concurrent debits can never both pass a check
//! computed from stale data.
//!
//! Lock order: wallet entry, then the transaction log. Never the
//! reverse.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dir_common::{
    BusinessId, Clock, OwnerId, Page, PageRequest, TransactionId, UserId, WalletId, WithdrawalId,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::BillingError;

/// Wallet lifecycle state. Wallets are never deleted, only
/// status-transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletStatus {
    /// Normal operation.
    Active,
    /// Administratively blocked; no money movement.
    Frozen,
    /// Permanently closed.
    Closed,
}

/// A per-owner money balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet identifier.
    pub id: WalletId,
    /// Owner (business owner or agent account).
    pub owner_id: OwnerId,
    /// Current balance. Always equals the sum of committed ledger
    /// deltas for this wallet.
    pub balance: Decimal,
    /// Portion of `balance` reserved for pending withdrawals.
    /// Invariant: `0 <= frozen_balance <= balance`.
    pub frozen_balance: Decimal,
    /// Lifetime sum of deposits.
    pub total_deposits: Decimal,
    /// Lifetime sum of withdrawals paid out.
    pub total_withdrawals: Decimal,
    /// Lifetime sum spent on payments and commissions.
    pub total_spent: Decimal,
    /// Lifecycle state.
    pub status: WalletStatus,
    /// When money last moved.
    pub last_transaction_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    /// Balance not reserved for withdrawals.
    pub fn available(&self) -> Decimal {
        self.balance - self.frozen_balance
    }
}

/// What a ledger entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Money in from a payment channel.
    Deposit,
    /// Money paid out to the owner.
    Withdrawal,
    /// Money spent on the platform (subscriptions).
    Payment,
    /// Referral or agent commission credited.
    Commission,
    /// Administrative correction, either direction.
    Adjustment,
}

/// Settlement state of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Awaiting settlement.
    Pending,
    /// Committed.
    Completed,
    /// Reversed by a compensating entry.
    Reversed,
}

/// What the money relates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    /// A business listing (subscription payments).
    Business,
    /// A withdrawal request.
    WithdrawalRequest,
    /// An order on the platform.
    Order,
    /// Operator-initiated, no linked aggregate.
    Manual,
}

/// Typed reference from a ledger entry to the aggregate it concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReference {
    /// What kind of aggregate the id points at.
    pub kind: ReferenceKind,
    /// The aggregate's identifier.
    pub id: Uuid,
}

impl TransactionReference {
    /// Reference a business.
    pub fn business(id: BusinessId) -> Self {
        Self {
            kind: ReferenceKind::Business,
            id: id.as_uuid(),
        }
    }

    /// Reference a withdrawal request.
    pub fn withdrawal(id: WithdrawalId) -> Self {
        Self {
            kind: ReferenceKind::WithdrawalRequest,
            id: id.as_uuid(),
        }
    }

    /// No linked aggregate.
    pub fn manual() -> Self {
        Self {
            kind: ReferenceKind::Manual,
            id: Uuid::nil(),
        }
    }
}

/// Structured per-kind metadata. A closed set so the compiler flags
/// every consumer when a new payment type is added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransactionMetadata {
    /// Subscription purchase details, including the proration figures
    /// that justified the charged amount.
    SubscriptionPayment {
        /// Package display name at purchase time.
        package_name: String,
        /// Term length purchased.
        duration_days: i64,
        /// Charge before proration credit.
        base_charge: Decimal,
        /// Credit for unused time on the previous package.
        proration_credit: Decimal,
    },
    /// Withdrawal payout settlement.
    WithdrawalPayout {
        /// The approved request.
        request_id: WithdrawalId,
    },
    /// Commission credit.
    Commission {
        /// Free-form origin of the commission.
        source: String,
    },
    /// Administrative adjustment.
    Adjustment {
        /// Operator-supplied justification.
        reason: String,
        /// Who made the adjustment.
        by_user: Option<UserId>,
    },
    /// Deposit via a payment channel.
    Deposit {
        /// Channel name (bank transfer, card, ...).
        channel: String,
    },
    /// No metadata.
    None,
}

/// One immutable, signed movement of funds against a wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    /// Entry identifier.
    pub id: TransactionId,
    /// Wallet the entry belongs to.
    pub wallet_id: WalletId,
    /// Signed delta: negative for debits, positive for credits.
    pub amount: Decimal,
    /// Balance captured immediately before commit.
    pub balance_before: Decimal,
    /// Balance captured immediately after commit. Always equals
    /// `balance_before + amount`.
    pub balance_after: Decimal,
    /// Entry kind.
    pub kind: TransactionKind,
    /// What the money relates to.
    pub reference: TransactionReference,
    /// Settlement state.
    pub status: TransactionStatus,
    /// Structured per-kind details.
    pub metadata: TransactionMetadata,
    /// Commit time.
    pub created_at: DateTime<Utc>,
}

/// Wallet ledger
///
/// Wallets are created lazily on first access per owner and keyed by
/// wallet id afterwards. The transaction log is append-only.
pub struct WalletLedger {
    wallets: DashMap<WalletId, Wallet>,
    owner_index: DashMap<OwnerId, WalletId>,
    log: RwLock<Vec<WalletTransaction>>,
    clock: Arc<dyn Clock>,
}

impl WalletLedger {
    /// Empty ledger.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            wallets: DashMap::new(),
            owner_index: DashMap::new(),
            log: RwLock::new(Vec::new()),
            clock,
        }
    }

    /// Idempotent lookup-or-create. The first call for an owner creates
    /// a zero-balance active wallet.
    pub fn get_or_create(&self, owner_id: OwnerId) -> Result<Wallet, BillingError> {
        let id = *self.owner_index.entry(owner_id).or_insert_with(|| {
            let now = self.clock.now();
            let wallet = Wallet {
                id: WalletId::new(),
                owner_id,
                balance: Decimal::ZERO,
                frozen_balance: Decimal::ZERO,
                total_deposits: Decimal::ZERO,
                total_withdrawals: Decimal::ZERO,
                total_spent: Decimal::ZERO,
                status: WalletStatus::Active,
                last_transaction_at: None,
                created_at: now,
            };
            let id = wallet.id;
            info!(wallet_id = %id, owner_id = %owner_id, "wallet created");
            self.wallets.insert(id, wallet);
            id
        });
        self.get(id)
    }

    /// Snapshot of a wallet.
    pub fn get(&self, wallet_id: WalletId) -> Result<Wallet, BillingError> {
        self.wallets
            .get(&wallet_id)
            .map(|w| w.clone())
            .ok_or(BillingError::WalletNotFound(wallet_id))
    }

    /// Balance not reserved for withdrawals.
    pub fn available(&self, wallet_id: WalletId) -> Result<Decimal, BillingError> {
        Ok(self.get(wallet_id)?.available())
    }

    /// Transition a wallet's lifecycle state.
    pub fn set_status(
        &self,
        wallet_id: WalletId,
        status: WalletStatus,
    ) -> Result<Wallet, BillingError> {
        let mut wallet = self
            .wallets
            .get_mut(&wallet_id)
            .ok_or(BillingError::WalletNotFound(wallet_id))?;
        wallet.status = status;
        Ok(wallet.clone())
    }

    /// Remove `amount` from the available balance. Fails without state
    /// change if the wallet is not active or `amount` exceeds
    /// `balance - frozen_balance`.
    pub fn debit(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        kind: TransactionKind,
        reference: TransactionReference,
        metadata: TransactionMetadata,
    ) -> Result<WalletTransaction, BillingError> {
        if amount < Decimal::ZERO {
            return Err(BillingError::InvalidAmount(amount));
        }
        let now = self.clock.now();
        let mut wallet = self
            .wallets
            .get_mut(&wallet_id)
            .ok_or(BillingError::WalletNotFound(wallet_id))?;
        if wallet.status != WalletStatus::Active {
            return Err(BillingError::WalletNotActive(wallet_id));
        }
        if amount > wallet.available() {
            return Err(BillingError::InsufficientFunds {
                requested: amount,
                available: wallet.available(),
            });
        }

        let balance_before = wallet.balance;
        wallet.balance -= amount;
        match kind {
            TransactionKind::Withdrawal => wallet.total_withdrawals += amount,
            _ => wallet.total_spent += amount,
        }
        wallet.last_transaction_at = Some(now);

        let txn = self.append_entry(&wallet, -amount, balance_before, kind, reference, metadata, now);
        info!(
            wallet_id = %wallet_id,
            amount = %amount,
            kind = ?kind,
            balance = %wallet.balance,
            "debit committed"
        );
        Ok(txn)
    }

    /// Add `amount` to the balance. Used for deposits, commissions, and
    /// administrative adjustments; adjustments may carry a negative
    /// amount but must never push the balance below the frozen portion.
    pub fn credit(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        kind: TransactionKind,
        reference: TransactionReference,
        metadata: TransactionMetadata,
    ) -> Result<WalletTransaction, BillingError> {
        if amount < Decimal::ZERO && kind != TransactionKind::Adjustment {
            return Err(BillingError::InvalidAmount(amount));
        }
        let now = self.clock.now();
        let mut wallet = self
            .wallets
            .get_mut(&wallet_id)
            .ok_or(BillingError::WalletNotFound(wallet_id))?;
        if wallet.status != WalletStatus::Active {
            return Err(BillingError::WalletNotActive(wallet_id));
        }
        let balance_before = wallet.balance;
        let new_balance = balance_before + amount;
        if new_balance < wallet.frozen_balance {
            return Err(BillingError::InsufficientFunds {
                requested: amount.abs(),
                available: wallet.available(),
            });
        }

        wallet.balance = new_balance;
        if kind == TransactionKind::Deposit {
            wallet.total_deposits += amount;
        }
        wallet.last_transaction_at = Some(now);

        let txn = self.append_entry(&wallet, amount, balance_before, kind, reference, metadata, now);
        info!(
            wallet_id = %wallet_id,
            amount = %amount,
            kind = ?kind,
            balance = %wallet.balance,
            "credit committed"
        );
        Ok(txn)
    }

    /// Reserve `amount` of the available balance for a pending
    /// withdrawal. No ledger entry is written; money has not moved yet.
    pub fn freeze(&self, wallet_id: WalletId, amount: Decimal) -> Result<Wallet, BillingError> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(amount));
        }
        let mut wallet = self
            .wallets
            .get_mut(&wallet_id)
            .ok_or(BillingError::WalletNotFound(wallet_id))?;
        if wallet.status != WalletStatus::Active {
            return Err(BillingError::WalletNotActive(wallet_id));
        }
        if amount > wallet.available() {
            return Err(BillingError::InsufficientFunds {
                requested: amount,
                available: wallet.available(),
            });
        }
        wallet.frozen_balance += amount;
        Ok(wallet.clone())
    }

    /// Release `amount` of the frozen balance back to available.
    pub fn unfreeze(&self, wallet_id: WalletId, amount: Decimal) -> Result<Wallet, BillingError> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(amount));
        }
        let mut wallet = self
            .wallets
            .get_mut(&wallet_id)
            .ok_or(BillingError::WalletNotFound(wallet_id))?;
        if amount > wallet.frozen_balance {
            return Err(BillingError::InsufficientFrozen {
                requested: amount,
                frozen: wallet.frozen_balance,
            });
        }
        wallet.frozen_balance -= amount;
        Ok(wallet.clone())
    }

    /// Settle a previously frozen amount: debit and unfreeze in one
    /// critical section. Used by withdrawal approval.
    pub fn debit_frozen(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        reference: TransactionReference,
        metadata: TransactionMetadata,
    ) -> Result<WalletTransaction, BillingError> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(amount));
        }
        let now = self.clock.now();
        let mut wallet = self
            .wallets
            .get_mut(&wallet_id)
            .ok_or(BillingError::WalletNotFound(wallet_id))?;
        if wallet.status != WalletStatus::Active {
            return Err(BillingError::WalletNotActive(wallet_id));
        }
        if amount > wallet.frozen_balance {
            return Err(BillingError::InsufficientFrozen {
                requested: amount,
                frozen: wallet.frozen_balance,
            });
        }

        let balance_before = wallet.balance;
        wallet.balance -= amount;
        wallet.frozen_balance -= amount;
        wallet.total_withdrawals += amount;
        wallet.last_transaction_at = Some(now);

        let txn = self.append_entry(
            &wallet,
            -amount,
            balance_before,
            TransactionKind::Withdrawal,
            reference,
            metadata,
            now,
        );
        info!(
            wallet_id = %wallet_id,
            amount = %amount,
            balance = %wallet.balance,
            "frozen debit settled"
        );
        Ok(txn)
    }

    /// Read-only, paginated ledger entries for a wallet, newest first,
    /// optionally filtered by kind.
    pub fn transactions(
        &self,
        wallet_id: WalletId,
        kind: Option<TransactionKind>,
        page: PageRequest,
    ) -> Result<Page<WalletTransaction>, BillingError> {
        // existence check keeps "unknown wallet" distinct from "no entries"
        self.get(wallet_id)?;
        let log = self.log.read();
        let matching: Vec<WalletTransaction> = log
            .iter()
            .rev()
            .filter(|t| t.wallet_id == wallet_id && kind.map(|k| t.kind == k).unwrap_or(true))
            .cloned()
            .collect();
        Ok(Page::from_items(matching, page))
    }

    // Caller must hold the wallet's map entry so the log order matches
    // the balance history.
    #[allow(clippy::too_many_arguments)]
    fn append_entry(
        &self,
        wallet: &Wallet,
        signed_amount: Decimal,
        balance_before: Decimal,
        kind: TransactionKind,
        reference: TransactionReference,
        metadata: TransactionMetadata,
        now: DateTime<Utc>,
    ) -> WalletTransaction {
        let txn = WalletTransaction {
            id: TransactionId::new(),
            wallet_id: wallet.id,
            amount: signed_amount,
            balance_before,
            balance_after: balance_before + signed_amount,
            kind,
            reference,
            status: TransactionStatus::Completed,
            metadata,
            created_at: now,
        };
        self.log.write().push(txn.clone());
        txn
    }
}
