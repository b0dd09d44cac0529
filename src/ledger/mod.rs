//! Ledger store.
//!
//! Defines the `LedgerStore` trait, the only path through which balances
//! change. Implementations serialize writes per account, append exactly one
//! `LedgerRecord` per successful mutation, and never clamp a balance: a delta
//! that would drive `available` or `locked` below zero is rejected whole.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{
    Account, AccountId, AccountSnapshot, Classified, ErrorClass, LedgerReason, LedgerRecord, Money,
    TxReference,
};

pub use memory::InMemoryLedger;

// ---------------------------------------------------------------------------
// Delta
// ---------------------------------------------------------------------------

/// A single atomic balance mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerDelta {
    pub account_id: AccountId,
    pub available: Money,
    pub locked: Money,
    pub reason: LedgerReason,
    pub reference: TxReference,
}

impl LedgerDelta {
    pub fn new(
        account_id: AccountId,
        available: Money,
        locked: Money,
        reason: LedgerReason,
        reference: TxReference,
    ) -> Self {
        Self {
            account_id,
            available,
            locked,
            reason,
            reference,
        }
    }

    pub fn deposit(account_id: AccountId, amount: Money, reference: TxReference) -> Self {
        Self::new(account_id, amount, Money::ZERO, LedgerReason::Deposit, reference)
    }

    pub fn withdrawal(account_id: AccountId, amount: Money, reference: TxReference) -> Self {
        Self::new(account_id, -amount, Money::ZERO, LedgerReason::Withdrawal, reference)
    }

    /// Move `stake` from available to locked.
    pub fn lock_stake(account_id: AccountId, stake: Money, reference: TxReference) -> Self {
        Self::new(account_id, -stake, stake, LedgerReason::BetPlaced, reference)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("unknown account {0}")]
    UnknownAccount(AccountId),

    #[error(
        "insufficient funds on {account_id}: available={available} locked={locked}, \
         delta available={available_delta} locked={locked_delta}"
    )]
    InsufficientFunds {
        account_id: AccountId,
        available: Money,
        locked: Money,
        available_delta: Money,
        locked_delta: Money,
    },

    #[error("reference {0} already applied")]
    DuplicateReference(TxReference),

    #[error("balance overflow on {0}")]
    Overflow(AccountId),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("ledger store unavailable: {0}")]
    Unavailable(String),
}

impl Classified for LedgerError {
    fn class(&self) -> ErrorClass {
        match self {
            LedgerError::UnknownAccount(_) => ErrorClass::Validation,
            LedgerError::InsufficientFunds { .. }
            | LedgerError::DuplicateReference(_)
            | LedgerError::Overflow(_) => ErrorClass::Integrity,
            LedgerError::Conflict(_) => ErrorClass::Concurrency,
            LedgerError::Unavailable(_) => ErrorClass::External,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            LedgerError::UnknownAccount(_) => "unknown_account",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::DuplicateReference(_) => "duplicate_reference",
            LedgerError::Overflow(_) => "balance_overflow",
            LedgerError::Conflict(_) => "write_conflict",
            LedgerError::Unavailable(_) => "store_unavailable",
        }
    }
}

impl From<tokio::time::error::Elapsed> for LedgerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        LedgerError::Unavailable("ledger call timed out".into())
    }
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Full ledger contents, for persistence and reconciliation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerExport {
    pub accounts: Vec<Account>,
    pub journal: Vec<LedgerRecord>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Durable keyed storage of account balances.
///
/// Concurrent calls against the same account are serialized; calls against
/// distinct accounts may proceed in parallel.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Get or create an account with zero balances.
    async fn open_account(&self, account_id: &AccountId) -> Result<AccountSnapshot, LedgerError>;

    /// Apply both deltas atomically and append one record.
    ///
    /// A `Deposit` delta also increments `total_deposited`; a `Withdrawal`
    /// delta increments `total_withdrawn` and stamps `last_withdrawal_at`, in
    /// the same atomic step as the debit.
    async fn apply_delta(&self, delta: LedgerDelta) -> Result<AccountSnapshot, LedgerError>;

    async fn snapshot(&self, account_id: &AccountId) -> Result<AccountSnapshot, LedgerError>;

    /// Records for one account, oldest first.
    async fn journal(&self, account_id: &AccountId) -> Result<Vec<LedgerRecord>, LedgerError>;

    async fn find_record(&self, reference: &TxReference) -> Result<Option<LedgerRecord>, LedgerError>;

    async fn export(&self) -> Result<LedgerExport, LedgerError>;
}
