//! Withdrawal processor.
//!
//! Only `available` funds can leave the platform; `locked` stakes are never
//! eligible. A 24h cooldown runs from the last successful withdrawal, and the
//! cooldown stamp is written by the same ledger call as the debit.
//!
//! Once the rail has sent funds the debit is retried on transient store
//! errors under the same reference. A caller that supplies an idempotency
//! key gets the same reference on every retry of its request, so the rail
//! sends at most once and a completed withdrawal is answered from the
//! journal.

use chrono::Duration;
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
    format_remaining, AccountId, AccountSnapshot, Classified, ErrorClass, Money, Operation,
    Receipt, TxReference,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WithdrawalConfig {
    /// Minimum spacing between two withdrawals on one account.
    pub cooldown: Duration,
    /// Retries of the ledger debit after the rail has sent funds.
    pub commit_retry: RetryPolicy,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::hours(24),
            commit_retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WithdrawalError {
    #[error("withdrawal amount must be positive, got {0}")]
    InvalidAmount(Money),

    #[error("unknown account {0}")]
    UnknownAccount(AccountId),

    #[error("idempotency key already used for a different withdrawal ({0})")]
    KeyReused(TxReference),

    #[error("insufficient available balance: requested {requested}, available {available}")]
    InsufficientAvailable { requested: Money, available: Money },

    #[error("withdrawal cooldown: {} remaining", format_remaining(.remaining))]
    CooldownActive { remaining: Duration },

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

impl Classified for WithdrawalError {
    fn class(&self) -> ErrorClass {
        match self {
            WithdrawalError::InvalidAmount(_)
            | WithdrawalError::UnknownAccount(_)
            | WithdrawalError::KeyReused(_) => ErrorClass::Validation,
            WithdrawalError::InsufficientAvailable { .. }
            | WithdrawalError::CooldownActive { .. }
            | WithdrawalError::RiskBlocked { .. }
            | WithdrawalError::RailRejected(_) => ErrorClass::Policy,
            WithdrawalError::Busy(_) => ErrorClass::Concurrency,
            WithdrawalError::RailUnavailable(_) | WithdrawalError::StoreUnavailable(_) => {
                ErrorClass::External
            }
            WithdrawalError::Integrity(_) => ErrorClass::Integrity,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            WithdrawalError::InvalidAmount(_) => "invalid_amount",
            WithdrawalError::UnknownAccount(_) => "unknown_account",
            WithdrawalError::KeyReused(_) => "idempotency_key_reused",
            WithdrawalError::InsufficientAvailable { .. } => "insufficient_available",
            WithdrawalError::CooldownActive { .. } => "cooldown_active",
            WithdrawalError::RiskBlocked { .. } => "risk_blocked",
            WithdrawalError::RailRejected(_) => "rail_rejected",
            WithdrawalError::RailUnavailable(_) => "rail_unavailable",
            WithdrawalError::Busy(_) => "ledger_busy",
            WithdrawalError::StoreUnavailable(_) => "store_unavailable",
            WithdrawalError::Integrity(_) => "integrity_violation",
        }
    }
}

impl From<LedgerError> for WithdrawalError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::UnknownAccount(id) => WithdrawalError::UnknownAccount(id),
            LedgerError::InsufficientFunds {
                available,
                available_delta,
                ..
            } => WithdrawalError::InsufficientAvailable {
                requested: -available_delta,
                available,
            },
            LedgerError::Conflict(msg) => WithdrawalError::Busy(msg),
            LedgerError::Unavailable(msg) => WithdrawalError::StoreUnavailable(msg),
            other => WithdrawalError::Integrity(other.to_string()),
        }
    }
}

impl From<RailError> for WithdrawalError {
    fn from(e: RailError) -> Self {
        match e {
            RailError::Rejected(msg) => WithdrawalError::RailRejected(msg),
            other => WithdrawalError::RailUnavailable(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct WithdrawalProcessor {
    config: WithdrawalConfig,
    ledger: Arc<dyn LedgerStore>,
    risk: Arc<RiskEvaluator>,
    rail: Arc<dyn PaymentRail>,
    rail_policy: RailPolicy,
    lanes: Arc<AccountLanes>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl WithdrawalProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WithdrawalConfig,
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

    pub async fn withdraw(
        &self,
        account_id: &AccountId,
        amount: Money,
    ) -> Result<Receipt, WithdrawalError> {
        self.withdraw_with_key(account_id, amount, None).await
    }

    /// Send `amount` to the user's wallet and debit it. With `key`, a repeat
    /// of a completed request returns the original receipt and a repeat of a
    /// failed one reuses the same rail idempotency key.
    pub async fn withdraw_with_key(
        &self,
        account_id: &AccountId,
        amount: Money,
        key: Option<&str>,
    ) -> Result<Receipt, WithdrawalError> {
        if !amount.is_positive() {
            return Err(WithdrawalError::InvalidAmount(amount));
        }
        // Unknown accounts are turned away before they get a lane.
        self.ledger.snapshot(account_id).await?;

        let _lane = self.lanes.enter(account_id).await;

        let reference = match key {
            Some(key) => {
                let reference = TxReference::keyed_withdrawal(account_id, key);
                if let Some(receipt) = self.replay(&reference, account_id, amount).await? {
                    return Ok(receipt);
                }
                reference
            }
            None => TxReference::withdrawal(),
        };

        let snapshot = self.ledger.snapshot(account_id).await?;
        if amount > snapshot.available {
            return Err(WithdrawalError::InsufficientAvailable {
                requested: amount,
                available: snapshot.available,
            });
        }
        if let Some(last) = snapshot.last_withdrawal_at {
            let elapsed = self.clock.now() - last;
            if elapsed < self.config.cooldown {
                let remaining = self.config.cooldown - elapsed;
                info!(
                    account_id = %account_id,
                    remaining = %format_remaining(&remaining),
                    "Withdrawal rejected, cooldown active"
                );
                return Err(WithdrawalError::CooldownActive { remaining });
            }
        }

        self.risk
            .screen(&self.events, account_id, amount, Operation::Withdrawal)
            .await
            .map_err(|a| WithdrawalError::RiskBlocked { score: a.score })?;

        let rail_receipt = call_with_retry(
            self.rail.as_ref(),
            &self.rail_policy,
            Direction::Out,
            &reference,
            account_id,
            amount,
        )
        .await?;

        let after = self
            .commit(
                LedgerDelta::withdrawal(account_id.clone(), amount, reference.clone()),
                &rail_receipt,
            )
            .await?;

        let at = after.last_withdrawal_at.unwrap_or_else(|| self.clock.now());
        info!(
            account_id = %account_id,
            amount = %amount,
            available = %after.available,
            reference = %reference,
            "Withdrawal sent"
        );
        self.events.publish(LedgerEvent::Withdrawn {
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

    /// Receipt of an already journaled withdrawal under `reference`.
    async fn replay(
        &self,
        reference: &TxReference,
        account_id: &AccountId,
        amount: Money,
    ) -> Result<Option<Receipt>, WithdrawalError> {
        let record = match self.ledger.find_record(reference).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        if record.account_id != *account_id || record.available_delta != -amount {
            return Err(WithdrawalError::KeyReused(reference.clone()));
        }
        info!(
            account_id = %account_id,
            reference = %reference,
            seq = record.seq,
            "Withdrawal already applied, returning original receipt"
        );
        Ok(Some(Receipt {
            reference: reference.clone(),
            account_id: account_id.clone(),
            amount,
            available: record.available_after,
            at: record.at,
        }))
    }

    /// Debit after the rail has sent funds. Transient store errors are
    /// retried under the same reference; a duplicate means an earlier
    /// attempt landed.
    async fn commit(
        &self,
        delta: LedgerDelta,
        rail_receipt: &RailReceipt,
    ) -> Result<AccountSnapshot, WithdrawalError> {
        let result = retry_transient(&self.config.commit_retry, "withdrawal debit", || {
            self.ledger.apply_delta(delta.clone())
        })
        .await;
        match result {
            Ok(after) => Ok(after),
            Err(LedgerError::DuplicateReference(reference)) => {
                warn!(reference = %reference, "Withdrawal debit already journaled, adopting it");
                Ok(self.ledger.snapshot(&delta.account_id).await?)
            }
            Err(e) => {
                error!(
                    account_id = %delta.account_id,
                    reference = %delta.reference,
                    rail_reference = %rail_receipt.rail_reference,
                    error = %e,
                    "Funds sent but ledger debit failed, needs reconciliation"
                );
                Err(e.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
