//! Bet escrow: moves stakes between available and locked balances.
//!
//! Placement holds the account lane (for per-user ordering) and then the
//! pool lock across the ledger write, so the odds a bettor receives are
//! computed from exactly the totals their stake joined, and
//! `freeze_and_lock` can never slip between the debit and the pool update.
//! Placement and resolution also hold the book's commit gate so a snapshot
//! sees each ledger write together with its bet.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::book::BetBook;
use super::lanes::AccountLanes;
use crate::clock::Clock;
use crate::events::{EventBus, LedgerEvent};
use crate::ledger::{LedgerDelta, LedgerError, LedgerStore};
use crate::odds::{multiplier, MatchPool, BPS_DENOMINATOR};
use crate::risk::RiskEvaluator;
use crate::types::{
    AccountId, Bet, BetId, BetStatus, Classified, ErrorClass, LedgerReason, MatchId, MatchStatus,
    Money, Operation, Outcome, TxReference,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BetError {
    #[error("stake must be positive, got {0}")]
    InvalidStake(Money),

    #[error("invalid match: {0}")]
    InvalidMatch(String),

    #[error("match {0} already exists")]
    MatchExists(MatchId),

    #[error("match {0} not found")]
    MatchNotFound(MatchId),

    #[error("match {match_id} is {status}, not open for bets")]
    MatchNotOpen { match_id: MatchId, status: MatchStatus },

    #[error("match {match_id} has no outcome {outcome}")]
    UnknownOutcome { match_id: MatchId, outcome: Outcome },

    #[error("unknown account {0}")]
    UnknownAccount(AccountId),

    #[error("insufficient available balance: requested {requested}, available {available}")]
    InsufficientAvailable { requested: Money, available: Money },

    #[error("blocked by risk review (score {score})")]
    RiskBlocked { score: u8 },

    #[error("bet {0} not found")]
    BetNotFound(BetId),

    #[error("bet {0} is already resolved")]
    AlreadyResolved(BetId),

    #[error("ledger busy: {0}")]
    Busy(String),

    #[error("ledger unavailable: {0}")]
    StoreUnavailable(String),

    #[error("ledger integrity violation: {0}")]
    Integrity(String),
}

impl Classified for BetError {
    fn class(&self) -> ErrorClass {
        match self {
            BetError::InvalidStake(_)
            | BetError::InvalidMatch(_)
            | BetError::MatchNotFound(_)
            | BetError::UnknownOutcome { .. }
            | BetError::UnknownAccount(_)
            | BetError::BetNotFound(_) => ErrorClass::Validation,
            BetError::MatchExists(_)
            | BetError::MatchNotOpen { .. }
            | BetError::InsufficientAvailable { .. }
            | BetError::RiskBlocked { .. }
            | BetError::AlreadyResolved(_) => ErrorClass::Policy,
            BetError::Busy(_) => ErrorClass::Concurrency,
            BetError::StoreUnavailable(_) => ErrorClass::External,
            BetError::Integrity(_) => ErrorClass::Integrity,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            BetError::InvalidStake(_) => "invalid_stake",
            BetError::InvalidMatch(_) => "invalid_match",
            BetError::MatchExists(_) => "match_exists",
            BetError::MatchNotFound(_) => "match_not_found",
            BetError::MatchNotOpen { .. } => "match_not_open",
            BetError::UnknownOutcome { .. } => "unknown_outcome",
            BetError::UnknownAccount(_) => "unknown_account",
            BetError::InsufficientAvailable { .. } => "insufficient_available",
            BetError::RiskBlocked { .. } => "risk_blocked",
            BetError::BetNotFound(_) => "bet_not_found",
            BetError::AlreadyResolved(_) => "already_resolved",
            BetError::Busy(_) => "ledger_busy",
            BetError::StoreUnavailable(_) => "store_unavailable",
            BetError::Integrity(_) => "integrity_violation",
        }
    }
}

impl From<LedgerError> for BetError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::UnknownAccount(id) => BetError::UnknownAccount(id),
            LedgerError::InsufficientFunds {
                available,
                available_delta,
                ..
            } => BetError::InsufficientAvailable {
                requested: -available_delta,
                available,
            },
            LedgerError::Conflict(msg) => BetError::Busy(msg),
            LedgerError::Unavailable(msg) => BetError::StoreUnavailable(msg),
            e @ (LedgerError::DuplicateReference(_) | LedgerError::Overflow(_)) => {
                BetError::Integrity(e.to_string())
            }
        }
    }
}

impl From<tokio::time::error::Elapsed> for BetError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BetError::StoreUnavailable("ledger call timed out".into())
    }
}

/// How a bet leaves the `Open` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Release the stake from locked and credit `payout` to available.
    Won { payout: Money },
    /// Release the stake from locked; it is forfeited to the pool.
    Lost,
    /// Return the stake to available (voided match).
    Refund,
}

// ---------------------------------------------------------------------------
// Escrow
// ---------------------------------------------------------------------------

pub struct BetEscrow {
    ledger: Arc<dyn LedgerStore>,
    book: Arc<BetBook>,
    risk: Arc<RiskEvaluator>,
    lanes: Arc<AccountLanes>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    default_rake_bps: u32,
}

impl BetEscrow {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        book: Arc<BetBook>,
        risk: Arc<RiskEvaluator>,
        lanes: Arc<AccountLanes>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        default_rake_bps: u32,
    ) -> Self {
        Self {
            ledger,
            book,
            risk,
            lanes,
            events,
            clock,
            default_rake_bps,
        }
    }

    /// Create the pool for a match. Outcomes must be non-empty, distinct and
    /// at least two.
    pub async fn open_match(
        &self,
        match_id: MatchId,
        outcomes: Vec<Outcome>,
        rake_bps: Option<u32>,
    ) -> Result<MatchPool, BetError> {
        if match_id.as_str().trim().is_empty() {
            return Err(BetError::InvalidMatch("empty match id".into()));
        }
        let distinct: HashSet<&Outcome> = outcomes.iter().collect();
        if outcomes.len() < 2 || distinct.len() != outcomes.len() {
            return Err(BetError::InvalidMatch(format!(
                "need at least two distinct outcomes, got {}",
                outcomes.len()
            )));
        }
        if outcomes.iter().any(|o| o.as_str().trim().is_empty()) {
            return Err(BetError::InvalidMatch("empty outcome name".into()));
        }
        let rake_bps = rake_bps.unwrap_or(self.default_rake_bps);
        if rake_bps >= BPS_DENOMINATOR {
            return Err(BetError::InvalidMatch(format!("rake {rake_bps} bps out of range")));
        }

        let pool = MatchPool::new(match_id, outcomes, rake_bps, self.clock.now());
        let created = pool.clone();
        self.book.insert_pool(pool).await.map_err(BetError::MatchExists)?;

        info!(
            match_id = %created.match_id,
            outcomes = created.outcomes.len(),
            rake_bps,
            "Match opened"
        );
        Ok(created)
    }

    /// Lock `stake` from the account's available balance on `outcome`.
    pub async fn place_bet(
        &self,
        account_id: &AccountId,
        match_id: &MatchId,
        outcome: &Outcome,
        stake: Money,
    ) -> Result<Bet, BetError> {
        if !stake.is_positive() {
            return Err(BetError::InvalidStake(stake));
        }
        let slot = self
            .book
            .pool(match_id)
            .await
            .ok_or_else(|| BetError::MatchNotFound(match_id.clone()))?;

        // Unknown accounts are turned away before they claim a lane.
        self.ledger.snapshot(account_id).await?;

        let _lane = self.lanes.enter(account_id).await;

        self.risk
            .screen(&self.events, account_id, stake, Operation::Bet)
            .await
            .map_err(|a| BetError::RiskBlocked { score: a.score })?;

        let _commit = self.book.commit_guard().await;
        let mut pool = slot.lock().await;
        if pool.status != MatchStatus::Open {
            return Err(BetError::MatchNotOpen {
                match_id: match_id.clone(),
                status: pool.status,
            });
        }
        if !pool.has_outcome(outcome) {
            return Err(BetError::UnknownOutcome {
                match_id: match_id.clone(),
                outcome: outcome.clone(),
            });
        }

        let snapshot = self.ledger.snapshot(account_id).await?;
        if snapshot.available < stake {
            return Err(BetError::InsufficientAvailable {
                requested: stake,
                available: snapshot.available,
            });
        }

        let totals = pool
            .totals_with(outcome, stake)
            .ok_or_else(|| BetError::Integrity(format!("pool total overflow on {match_id}")))?;
        let total_pool: Money = totals.values().copied().sum();
        let odds = multiplier(total_pool, totals[outcome], pool.rake_bps)
            .ok_or_else(|| BetError::Integrity(format!("odds undefined on {match_id}/{outcome}")))?;

        let bet_id = BetId::new();
        let after = self
            .ledger
            .apply_delta(LedgerDelta::lock_stake(
                account_id.clone(),
                stake,
                TxReference::bet_placed(&bet_id),
            ))
            .await?;

        let now = self.clock.now();
        pool.totals = totals;
        pool.bet_ids.push(bet_id);
        let bet = Bet {
            bet_id,
            account_id: account_id.clone(),
            match_id: match_id.clone(),
            outcome: outcome.clone(),
            stake,
            odds_at_placement: odds,
            status: BetStatus::Open,
            payout: Money::ZERO,
            placed_at: now,
            resolved_at: None,
        };
        self.book.insert_bet(bet.clone()).await;
        drop(pool);

        info!(
            bet_id = %bet_id,
            account_id = %account_id,
            match_id = %match_id,
            outcome = %outcome,
            stake = %stake,
            odds = %odds.round_dp(4),
            available = %after.available,
            "Bet placed"
        );
        self.events.publish(LedgerEvent::BetPlaced {
            bet_id,
            account_id: account_id.clone(),
            match_id: match_id.clone(),
            outcome: outcome.clone(),
            stake,
            at: now,
        });
        Ok(bet)
    }

    /// Move a bet to its terminal state with one ledger call.
    ///
    /// A second call on a terminal bet returns `AlreadyResolved` and writes
    /// nothing. If the ledger already holds this bet's resolution record (a
    /// crash after the write but before the status update), the record is
    /// adopted instead of applied again.
    pub async fn resolve_bet(&self, bet_id: BetId, resolution: Resolution) -> Result<Bet, BetError> {
        let slot = self
            .book
            .bet(&bet_id)
            .await
            .ok_or(BetError::BetNotFound(bet_id))?;
        let _commit = self.book.commit_guard().await;
        let mut bet = slot.lock().await;
        if bet.status.is_terminal() {
            return Err(BetError::AlreadyResolved(bet_id));
        }

        let (credit, status, reason) = match resolution {
            Resolution::Won { payout } => (payout, BetStatus::Won, LedgerReason::BetSettled),
            Resolution::Lost => (Money::ZERO, BetStatus::Lost, LedgerReason::BetSettled),
            Resolution::Refund => (bet.stake, BetStatus::Voided, LedgerReason::BetRefunded),
        };
        if credit.is_negative() {
            return Err(BetError::Integrity(format!("negative payout {credit} for bet {bet_id}")));
        }

        let reference = TxReference::bet_resolved(&bet_id);
        let delta = LedgerDelta::new(bet.account_id.clone(), credit, -bet.stake, reason, reference);
        let payout = match self.ledger.apply_delta(delta).await {
            Ok(_) => credit,
            Err(LedgerError::DuplicateReference(reference)) => {
                let record = self.ledger.find_record(&reference).await?.ok_or_else(|| {
                    BetError::Integrity(format!("reference {reference} reported but not found"))
                })?;
                warn!(
                    bet_id = %bet_id,
                    reference = %reference,
                    seq = record.seq,
                    "Resolution already in journal, adopting it"
                );
                record.available_delta
            }
            Err(e @ LedgerError::InsufficientFunds { .. }) => {
                return Err(BetError::Integrity(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let now = self.clock.now();
        bet.status = status;
        bet.payout = payout;
        bet.resolved_at = Some(now);
        let resolved = bet.clone();
        drop(bet);

        info!(
            bet_id = %bet_id,
            account_id = %resolved.account_id,
            status = %status,
            payout = %payout,
            "Bet resolved"
        );
        self.events.publish(LedgerEvent::BetResolved {
            bet_id,
            account_id: resolved.account_id.clone(),
            status,
            payout,
            at: now,
        });
        Ok(resolved)
    }

    pub async fn bet(&self, bet_id: &BetId) -> Option<Bet> {
        let slot = self.book.bet(bet_id).await?;
        let bet = slot.lock().await.clone();
        Some(bet)
    }

    pub fn book(&self) -> &Arc<BetBook> {
        &self.book
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
