//! Settlement engine.
//!
//! Drives a locked match to `Settled` (or `Voided`). Every open bet is
//! resolved concurrently through the escrow; transient failures are retried
//! per bet with capped exponential backoff and a per-attempt timeout, while
//! integrity failures stop and leave the match `Locked` for reconciliation.
//! The match only advances after the join, once every bet is terminal and
//! the rake has been credited to the treasury.
//!
//! Re-running `settle` after a crash is safe: terminal bets are skipped, and
//! ledger writes are keyed by reference so none is applied twice.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tracing::{debug, error, info, warn};

use super::book::{BetBook, PoolSlot};
use super::escrow::{BetError, BetEscrow, Resolution};
use super::lanes::MatchLanes;
use super::retry::{retry_transient, RetryPolicy};
use crate::clock::Clock;
use crate::events::{EventBus, LedgerEvent};
use crate::ledger::{LedgerDelta, LedgerError, LedgerStore};
use crate::odds::{fixed_payout, parimutuel_payout, OddsSnapshot};
use crate::types::{
    AccountId, Bet, BetId, BetStatus, Classified, ErrorClass, LedgerReason, MatchId, MatchStatus,
    Money, Outcome, TxReference,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How a winning bet's payout is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutPolicy {
    /// `stake × post-rake pool / winning outcome total`, from the frozen pool.
    #[default]
    Parimutuel,
    /// `stake × odds_at_placement`. The treasury absorbs any shortfall.
    FixedAtPlacement,
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub policy: PayoutPolicy,
    /// First retry delay; doubles per attempt.
    pub base_backoff: Duration,
    /// Ceiling on the retry delay.
    pub max_backoff: Duration,
    /// Upper bound on a single resolution attempt.
    pub attempt_timeout: Duration,
    /// Account credited with the rake.
    pub treasury: AccountId,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            policy: PayoutPolicy::Parimutuel,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(5),
            treasury: AccountId::new("treasury"),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementSummary {
    pub match_id: MatchId,
    /// `Settled`, or `Voided` for a cancelled match or a winner nobody backed.
    pub status: MatchStatus,
    pub winning_outcome: Option<Outcome>,
    pub total_pool: Money,
    /// Sum credited back to bettors (payouts or refunds).
    pub total_paid: Money,
    pub rake: Money,
    pub bets_won: usize,
    pub bets_lost: usize,
    pub bets_refunded: usize,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettlementError {
    #[error("match {0} not found")]
    MatchNotFound(MatchId),

    #[error("match {match_id} is {status}, betting has not closed")]
    NotLocked { match_id: MatchId, status: MatchStatus },

    #[error("match {0} is already settled")]
    AlreadySettled(MatchId),

    #[error("match {0} was voided")]
    AlreadyVoided(MatchId),

    #[error("match {match_id} has no outcome {outcome}")]
    UnknownOutcome { match_id: MatchId, outcome: Outcome },

    #[error("match {match_id} is being settled for {declared}, not {requested}")]
    OutcomeMismatch {
        match_id: MatchId,
        declared: Outcome,
        requested: Outcome,
    },

    #[error("match {match_id} already has winner {outcome}, cannot void")]
    WinnerDeclared { match_id: MatchId, outcome: Outcome },

    #[error("match {match_id} needs reconciliation: {unresolved} unresolved ({reason})")]
    ReconciliationRequired {
        match_id: MatchId,
        unresolved: usize,
        reason: String,
    },
}

impl Classified for SettlementError {
    fn class(&self) -> ErrorClass {
        match self {
            SettlementError::MatchNotFound(_) | SettlementError::UnknownOutcome { .. } => {
                ErrorClass::Validation
            }
            SettlementError::NotLocked { .. }
            | SettlementError::AlreadySettled(_)
            | SettlementError::AlreadyVoided(_)
            | SettlementError::OutcomeMismatch { .. }
            | SettlementError::WinnerDeclared { .. } => ErrorClass::Policy,
            SettlementError::ReconciliationRequired { .. } => ErrorClass::Integrity,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            SettlementError::MatchNotFound(_) => "match_not_found",
            SettlementError::NotLocked { .. } => "match_not_locked",
            SettlementError::AlreadySettled(_) => "already_settled",
            SettlementError::AlreadyVoided(_) => "already_voided",
            SettlementError::UnknownOutcome { .. } => "unknown_outcome",
            SettlementError::OutcomeMismatch { .. } => "outcome_mismatch",
            SettlementError::WinnerDeclared { .. } => "winner_declared",
            SettlementError::ReconciliationRequired { .. } => "reconciliation_required",
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SettlementEngine {
    config: SettlementConfig,
    escrow: Arc<BetEscrow>,
    book: Arc<BetBook>,
    ledger: Arc<dyn LedgerStore>,
    lanes: MatchLanes,
    retry: RetryPolicy,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl SettlementEngine {
    pub fn new(
        config: SettlementConfig,
        escrow: Arc<BetEscrow>,
        ledger: Arc<dyn LedgerStore>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let book = escrow.book().clone();
        let retry = RetryPolicy {
            max_attempts: None,
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
            attempt_timeout: config.attempt_timeout,
        };
        Self {
            config,
            escrow,
            book,
            ledger,
            lanes: MatchLanes::new(),
            retry,
            events,
            clock,
        }
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// Settle a locked match for `winning_outcome`.
    pub async fn settle(
        &self,
        match_id: &MatchId,
        winning_outcome: &Outcome,
    ) -> Result<SettlementSummary, SettlementError> {
        let _lane = self.lanes.enter(match_id).await;
        let slot = self.pool_slot(match_id).await?;

        let (snapshot, bet_ids) = {
            let mut pool = slot.lock().await;
            check_locked(match_id, pool.status)?;
            if !pool.has_outcome(winning_outcome) {
                return Err(SettlementError::UnknownOutcome {
                    match_id: match_id.clone(),
                    outcome: winning_outcome.clone(),
                });
            }
            if let Some(declared) = &pool.declared_winner {
                if declared != winning_outcome {
                    return Err(SettlementError::OutcomeMismatch {
                        match_id: match_id.clone(),
                        declared: declared.clone(),
                        requested: winning_outcome.clone(),
                    });
                }
            }
            pool.declared_winner = Some(winning_outcome.clone());
            let snapshot = match pool.frozen.clone() {
                Some(s) => s,
                None => pool.freeze(self.clock.now()),
            };
            (snapshot, pool.bet_ids.clone())
        };

        if snapshot.outcome_total(winning_outcome).is_zero() {
            warn!(
                match_id = %match_id,
                outcome = %winning_outcome,
                "No stake on winning outcome, refunding all bets"
            );
            return self
                .refund_all(match_id, &slot, &snapshot, &bet_ids, Some(winning_outcome.clone()))
                .await;
        }

        info!(
            match_id = %match_id,
            outcome = %winning_outcome,
            total_pool = %snapshot.total_pool,
            bets = bet_ids.len(),
            policy = ?self.config.policy,
            "Settling match"
        );

        let bets = self.book.bets_for(&bet_ids).await;
        let mut plan = Vec::new();
        for bet in bets.iter().filter(|b| b.status == BetStatus::Open) {
            let resolution = if &bet.outcome == winning_outcome {
                let payout = self.payout(bet, &snapshot, winning_outcome).ok_or_else(|| {
                    SettlementError::ReconciliationRequired {
                        match_id: match_id.clone(),
                        unresolved: 1,
                        reason: format!("payout overflow on bet {}", bet.bet_id),
                    }
                })?;
                Resolution::Won { payout }
            } else {
                Resolution::Lost
            };
            plan.push((bet.bet_id, resolution));
        }

        self.resolve_all(match_id, plan).await?;

        let bets = self.book.bets_for(&bet_ids).await;
        let total_paid: Money = bets
            .iter()
            .filter(|b| b.status == BetStatus::Won)
            .map(|b| b.payout)
            .sum();
        let rake = snapshot.total_pool - total_paid;
        self.credit_treasury(match_id, rake).await?;

        let completed_at = self.clock.now();
        slot.lock().await.status = MatchStatus::Settled;

        let summary = SettlementSummary {
            match_id: match_id.clone(),
            status: MatchStatus::Settled,
            winning_outcome: Some(winning_outcome.clone()),
            total_pool: snapshot.total_pool,
            total_paid,
            rake,
            bets_won: count(&bets, BetStatus::Won),
            bets_lost: count(&bets, BetStatus::Lost),
            bets_refunded: count(&bets, BetStatus::Voided),
            completed_at,
        };
        info!(
            match_id = %match_id,
            outcome = %winning_outcome,
            total_paid = %total_paid,
            rake = %rake,
            won = summary.bets_won,
            lost = summary.bets_lost,
            "Match settled"
        );
        self.events.publish(LedgerEvent::MatchSettled {
            match_id: match_id.clone(),
            winning_outcome: winning_outcome.clone(),
            total_paid,
            rake,
            at: completed_at,
        });
        Ok(summary)
    }

    /// Refund every open bet on a locked match in full.
    pub async fn void_match(&self, match_id: &MatchId) -> Result<SettlementSummary, SettlementError> {
        let _lane = self.lanes.enter(match_id).await;
        let slot = self.pool_slot(match_id).await?;

        let (snapshot, bet_ids) = {
            let mut pool = slot.lock().await;
            check_locked(match_id, pool.status)?;
            if let Some(outcome) = &pool.declared_winner {
                return Err(SettlementError::WinnerDeclared {
                    match_id: match_id.clone(),
                    outcome: outcome.clone(),
                });
            }
            let snapshot = match pool.frozen.clone() {
                Some(s) => s,
                None => pool.freeze(self.clock.now()),
            };
            (snapshot, pool.bet_ids.clone())
        };

        info!(match_id = %match_id, bets = bet_ids.len(), "Voiding match");
        self.refund_all(match_id, &slot, &snapshot, &bet_ids, None).await
    }

    // -- internals ----------------------------------------------------------

    async fn pool_slot(&self, match_id: &MatchId) -> Result<PoolSlot, SettlementError> {
        self.book
            .pool(match_id)
            .await
            .ok_or_else(|| SettlementError::MatchNotFound(match_id.clone()))
    }

    fn payout(&self, bet: &Bet, snapshot: &OddsSnapshot, winner: &Outcome) -> Option<Money> {
        match self.config.policy {
            PayoutPolicy::Parimutuel => parimutuel_payout(
                bet.stake,
                snapshot.total_pool,
                snapshot.outcome_total(winner),
                snapshot.rake_bps,
            ),
            PayoutPolicy::FixedAtPlacement => fixed_payout(bet.stake, bet.odds_at_placement),
        }
    }

    async fn refund_all(
        &self,
        match_id: &MatchId,
        slot: &PoolSlot,
        snapshot: &OddsSnapshot,
        bet_ids: &[BetId],
        winning_outcome: Option<Outcome>,
    ) -> Result<SettlementSummary, SettlementError> {
        let bets = self.book.bets_for(bet_ids).await;
        let plan = bets
            .iter()
            .filter(|b| b.status == BetStatus::Open)
            .map(|b| (b.bet_id, Resolution::Refund))
            .collect();
        self.resolve_all(match_id, plan).await?;

        let bets = self.book.bets_for(bet_ids).await;
        let refunded: Money = bets
            .iter()
            .filter(|b| b.status == BetStatus::Voided)
            .map(|b| b.payout)
            .sum();

        let completed_at = self.clock.now();
        slot.lock().await.status = MatchStatus::Voided;

        info!(match_id = %match_id, refunded = %refunded, "Match voided");
        self.events.publish(LedgerEvent::MatchVoided {
            match_id: match_id.clone(),
            refunded,
            at: completed_at,
        });
        Ok(SettlementSummary {
            match_id: match_id.clone(),
            status: MatchStatus::Voided,
            winning_outcome,
            total_pool: snapshot.total_pool,
            total_paid: refunded,
            rake: Money::ZERO,
            bets_won: count(&bets, BetStatus::Won),
            bets_lost: count(&bets, BetStatus::Lost),
            bets_refunded: count(&bets, BetStatus::Voided),
            completed_at,
        })
    }

    /// Resolve every planned bet concurrently and wait for all of them.
    async fn resolve_all(
        &self,
        match_id: &MatchId,
        plan: Vec<(BetId, Resolution)>,
    ) -> Result<(), SettlementError> {
        let results = join_all(plan.into_iter().map(|(bet_id, resolution)| async move {
            let result = self
                .with_retry("resolve bet", || self.escrow.resolve_bet(bet_id, resolution))
                .await;
            (bet_id, result)
        }))
        .await;

        let failures: Vec<(BetId, BetError)> = results
            .into_iter()
            .filter_map(|(bet_id, r)| match r {
                Ok(_) | Err(BetError::AlreadyResolved(_)) => None,
                Err(e) => Some((bet_id, e)),
            })
            .collect();

        if failures.is_empty() {
            return Ok(());
        }
        for (bet_id, e) in &failures {
            error!(
                match_id = %match_id,
                bet_id = %bet_id,
                code = e.code(),
                error = %e,
                "Bet resolution needs manual reconciliation"
            );
        }
        Err(SettlementError::ReconciliationRequired {
            match_id: match_id.clone(),
            unresolved: failures.len(),
            reason: failures[0].1.to_string(),
        })
    }

    /// Credit (or, under fixed odds, debit) the treasury with the rake.
    async fn credit_treasury(&self, match_id: &MatchId, rake: Money) -> Result<(), SettlementError> {
        if rake.is_zero() {
            return Ok(());
        }
        let treasury = self.config.treasury.clone();
        let reference = TxReference::rake(match_id);

        let result = self
            .with_retry("credit rake", || {
                let treasury = treasury.clone();
                let delta = LedgerDelta::new(
                    treasury.clone(),
                    rake,
                    Money::ZERO,
                    LedgerReason::Rake,
                    reference.clone(),
                );
                async move {
                    self.ledger.open_account(&treasury).await?;
                    self.ledger.apply_delta(delta).await
                }
            })
            .await;

        match result {
            Ok(after) => {
                debug!(match_id = %match_id, rake = %rake, treasury = %after.available, "Rake credited");
                Ok(())
            }
            Err(LedgerError::DuplicateReference(_)) => {
                debug!(match_id = %match_id, "Rake already credited");
                Ok(())
            }
            Err(e) => {
                error!(match_id = %match_id, rake = %rake, error = %e, "Rake credit failed");
                Err(SettlementError::ReconciliationRequired {
                    match_id: match_id.clone(),
                    unresolved: 0,
                    reason: format!("rake credit: {e}"),
                })
            }
        }
    }

    /// Retry `op` until it succeeds or fails with a non-retryable class.
    /// Attempts are unbounded; each one is bounded by `attempt_timeout`.
    async fn with_retry<T, E, F, Fut>(&self, what: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classified + From<Elapsed>,
    {
        retry_transient(&self.retry, what, op).await
    }
}

fn check_locked(match_id: &MatchId, status: MatchStatus) -> Result<(), SettlementError> {
    match status {
        MatchStatus::Locked => Ok(()),
        MatchStatus::Open => Err(SettlementError::NotLocked {
            match_id: match_id.clone(),
            status,
        }),
        MatchStatus::Settled => Err(SettlementError::AlreadySettled(match_id.clone())),
        MatchStatus::Voided => Err(SettlementError::AlreadyVoided(match_id.clone())),
    }
}

fn count(bets: &[Bet], status: BetStatus) -> usize {
    bets.iter().filter(|b| b.status == status).count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
