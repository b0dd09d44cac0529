//! Deposit processor.
//!
//! Validation → risk gate → payment rail (transfer in) → ledger credit →
//! `Deposited` event. The rail is called first with the ledger reference as
//! idempotency key; if it fails or times out the ledger is never touched.
//! Once funds are in, the credit is retried on transient store errors under
//! the same reference. A caller-supplied idempotency key maps every retry of
//! one request to that reference.

use std::sync::Arc;
use tracing::{error, info, warn};

use super::lanes::AccountLanes;
use super::retry::{retry_transient, RetryPolicy};
use crate::clock::Clock;
use crate::events::{EventBus, LedgerEvent};
use crate::ledger::{LedgerDelta, LedgerError, LedgerStore};
use crate::rails::{call_with_retry, Direction, PaymentRail, RailError, RailPolicy, RailReceipt};
use crate::risk::RiskEvaluator;
use crate::types::{
    AccountId, AccountSnapshot, Classified, ErrorClass, Money, Operation, Receipt, TxReference,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DepositConfig {
    /// Smallest accepted deposit.
    pub min_deposit: Money,
    /// Retries of the ledger credit after the rail has taken funds in.
    pub commit_retry: RetryPolicy,
}

impl Default for DepositConfig {
    fn default() -> Self {
        Self {
            min_deposit: Money::from_minor(Money::SCALE / 10), // 0.1 units
            commit_retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DepositError {
    #[error("deposit amount must be positive, got {0}")]
    InvalidAmount(Money),

    #[error("deposit {amount} is below the minimum of {minimum}")]
    BelowMinimum { amount: Money, minimum: Money },

    #[error("idempotency key already used for a different deposit ({0})")]
    KeyReused(TxReference),

    #[error("blocked by risk review (score {score})")]
    RiskBlocked { score: u8 },

    #[error("payment rail rejected the transfer: {0}")]
    RailRejected(String),

    #[error("payment rail unavailable: {0}")]
    RailUnavailable(String),

    #[error("ledger busy: {0}")]
    Busy(String),

    #[error("ledger unavailable: {0}")]
    StoreUnavailable(String),

    #[error("ledger integrity violation: {0}")]
    Integrity(String),
}

impl Classified for DepositError {
    fn class(&self) -> ErrorClass {
        match self {
            DepositError::InvalidAmount(_) | DepositError::KeyReused(_) => ErrorClass::Validation,
            DepositError::BelowMinimum { .. }
            | DepositError::RiskBlocked { .. }
            | DepositError::RailRejected(_) => ErrorClass::Policy,
            DepositError::Busy(_) => ErrorClass::Concurrency,
            DepositError::RailUnavailable(_) | DepositError::StoreUnavailable(_) => {
                ErrorClass::External
            }
            DepositError::Integrity(_) => ErrorClass::Integrity,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            DepositError::InvalidAmount(_) => "invalid_amount",
            DepositError::KeyReused(_) => "idempotency_key_reused",
            DepositError::BelowMinimum { .. } => "below_minimum",
            DepositError::RiskBlocked { .. } => "risk_blocked",
            DepositError::RailRejected(_) => "rail_rejected",
            DepositError::RailUnavailable(_) => "rail_unavailable",
            DepositError::Busy(_) => "ledger_busy",
            DepositError::StoreUnavailable(_) => "store_unavailable",
            DepositError::Integrity(_) => "integrity_violation",
        }
    }
}

impl From<LedgerError> for DepositError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Conflict(msg) => DepositError::Busy(msg),
            LedgerError::Unavailable(msg) => DepositError::StoreUnavailable(msg),
            other => DepositError::Integrity(other.to_string()),
        }
    }
}

impl From<RailError> for DepositError {
    fn from(e: RailError) -> Self {
        match e {
            RailError::Rejected(msg) => DepositError::RailRejected(msg),
            other => DepositError::RailUnavailable(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct DepositProcessor {
    config: DepositConfig,
    ledger: Arc<dyn LedgerStore>,
    risk: Arc<RiskEvaluator>,
    rail: Arc<dyn PaymentRail>,
    rail_policy: RailPolicy,
    lanes: Arc<AccountLanes>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl DepositProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DepositConfig,
        ledger: Arc<dyn LedgerStore>,
        risk: Arc<RiskEvaluator>,
        rail: Arc<dyn PaymentRail>,
        rail_policy: RailPolicy,
        lanes: Arc<AccountLanes>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            ledger,
            risk,
            rail,
            rail_policy,
            lanes,
            events,
            clock,
        }
    }

    pub fn config(&self) -> &DepositConfig {
        &self.config
    }

    /// Credit `amount` to the account, creating it on first deposit.
    pub async fn deposit(&self, account_id: &AccountId, amount: Money) -> Result<Receipt, DepositError> {
        self.deposit_with_key(account_id, amount, None).await
    }

    /// As `deposit`; with `key`, a repeat of a completed request returns the
    /// original receipt and a repeat of a failed one reuses the same rail
    /// idempotency key.
    pub async fn deposit_with_key(
        &self,
        account_id: &AccountId,
        amount: Money,
        key: Option<&str>,
    ) -> Result<Receipt, DepositError> {
        if !amount.is_positive() {
            return Err(DepositError::InvalidAmount(amount));
        }
        if amount < self.config.min_deposit {
            return Err(DepositError::BelowMinimum {
                amount,
                minimum: self.config.min_deposit,
            });
        }

        let _lane = self.lanes.enter(account_id).await;

        let reference = match key {
            Some(key) => {
                let reference = TxReference::keyed_deposit(account_id, key);
                if let Some(receipt) = self.replay(&reference, account_id, amount).await? {
                    return Ok(receipt);
                }
                reference
            }
            None => TxReference::deposit(),
        };

        self.risk
            .screen(&self.events, account_id, amount, Operation::Deposit)
            .await
            .map_err(|a| DepositError::RiskBlocked { score: a.score })?;

        let rail_receipt = call_with_retry(
            self.rail.as_ref(),
            &self.rail_policy,
            Direction::In,
            &reference,
            account_id,
            amount,
        )
        .await?;

        let after = self
            .commit(
                LedgerDelta::deposit(account_id.clone(), amount, reference.clone()),
                &rail_receipt,
            )
            .await?;

        let at = self.clock.now();
        info!(
            account_id = %account_id,
            amount = %amount,
            available = %after.available,
            reference = %reference,
            "Deposit credited"
        );
        self.events.publish(LedgerEvent::Deposited {
            account_id: account_id.clone(),
            amount,
            balance: after.available,
            at,
        });

        Ok(Receipt {
            reference,
            account_id: account_id.clone(),
            amount,
            available: after.available,
            at,
        })
    }

    async fn replay(
        &self,
        reference: &TxReference,
        account_id: &AccountId,
        amount: Money,
    ) -> Result<Option<Receipt>, DepositError> {
        let record = match self.ledger.find_record(reference).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        if record.account_id != *account_id || record.available_delta != amount {
            return Err(DepositError::KeyReused(reference.clone()));
        }
        info!(
            account_id = %account_id,
            reference = %reference,
            seq = record.seq,
            "Deposit already credited, returning original receipt"
        );
        Ok(Some(Receipt {
            reference: reference.clone(),
            account_id: account_id.clone(),
            amount,
            available: record.available_after,
            at: record.at,
        }))
    }

    /// Open the account and credit it, retrying transient store errors
    /// under the same reference.
    async fn commit(
        &self,
        delta: LedgerDelta,
        rail_receipt: &RailReceipt,
    ) -> Result<AccountSnapshot, DepositError> {
        let result = retry_transient(&self.config.commit_retry, "deposit credit", || {
            let delta = delta.clone();
            async move {
                self.ledger.open_account(&delta.account_id).await?;
                self.ledger.apply_delta(delta).await
            }
        })
        .await;
        match result {
            Ok(after) => Ok(after),
            Err(LedgerError::DuplicateReference(reference)) => {
                warn!(reference = %reference, "Deposit credit already journaled, adopting it");
                Ok(self.ledger.snapshot(&delta.account_id).await?)
            }
            Err(e) => {
                error!(
                    account_id = %delta.account_id,
                    reference = %delta.reference,
                    rail_reference = %rail_receipt.rail_reference,
                    error = %e,
                    "Funds received but ledger credit failed, needs reconciliation"
                );
                Err(e.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
