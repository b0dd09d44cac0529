//! Odds engine: pari-mutuel multipliers over live match pools.
//!
//! `multiplier = total_pool × (1 − rake) / outcome_total`. Odds are always
//! computed from the pool under its lock, so a bettor's `odds_at_placement`
//! matches the totals their stake was added to. `freeze_and_lock` closes
//! betting and hands settlement an immutable copy of the totals.

pub mod pool;

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::engine::book::BetBook;
use crate::events::{EventBus, LedgerEvent};
use crate::types::{Classified, ErrorClass, MatchId, MatchStatus, Money, Outcome};
pub use pool::{MatchPool, OddsSnapshot};

/// Payout per unit staked, including the stake itself.
pub type Multiplier = Decimal;

/// Rake is expressed in basis points of the pool.
pub const BPS_DENOMINATOR: u32 = 10_000;

// ---------------------------------------------------------------------------
// Pure odds math
// ---------------------------------------------------------------------------

/// Post-rake pool divided by the outcome's stake. `None` when the outcome
/// has no stake (undefined odds) or the rake is out of range.
pub fn multiplier(total_pool: Money, outcome_total: Money, rake_bps: u32) -> Option<Multiplier> {
    if !outcome_total.is_positive() || rake_bps >= BPS_DENOMINATOR {
        return None;
    }
    let pool = Decimal::from(total_pool.as_minor());
    let keep = Decimal::from(BPS_DENOMINATOR - rake_bps) / Decimal::from(BPS_DENOMINATOR);
    pool.checked_mul(keep)?
        .checked_div(Decimal::from(outcome_total.as_minor()))
}

/// Pool after rake, rounded down to the minor unit.
pub fn distributable(total_pool: Money, rake_bps: u32) -> Option<Money> {
    let keep = i128::from(BPS_DENOMINATOR.checked_sub(rake_bps)?);
    let value = i128::from(total_pool.as_minor()) * keep / i128::from(BPS_DENOMINATOR);
    i64::try_from(value).ok().map(Money)
}

/// Pari-mutuel payout computed in exact integer arithmetic:
/// `stake × total_pool × (1 − rake) / outcome_total`, rounded down.
pub fn parimutuel_payout(
    stake: Money,
    total_pool: Money,
    outcome_total: Money,
    rake_bps: u32,
) -> Option<Money> {
    if !outcome_total.is_positive() || rake_bps >= BPS_DENOMINATOR {
        return None;
    }
    let numerator = i128::from(stake.as_minor())
        .checked_mul(i128::from(total_pool.as_minor()))?
        .checked_mul(i128::from(BPS_DENOMINATOR - rake_bps))?;
    let denominator = i128::from(outcome_total.as_minor()) * i128::from(BPS_DENOMINATOR);
    i64::try_from(numerator / denominator).ok().map(Money)
}

/// `stake × odds`, rounded down.
pub fn fixed_payout(stake: Money, odds: Multiplier) -> Option<Money> {
    Decimal::from(stake.as_minor())
        .checked_mul(odds)?
        .floor()
        .to_i64()
        .map(Money)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OddsError {
    #[error("match {0} not found")]
    MatchNotFound(MatchId),

    #[error("match {match_id} has no outcome {outcome}")]
    UnknownOutcome { match_id: MatchId, outcome: Outcome },

    #[error("match {match_id} is already {status}")]
    AlreadyLocked { match_id: MatchId, status: MatchStatus },
}

impl Classified for OddsError {
    fn class(&self) -> ErrorClass {
        match self {
            OddsError::MatchNotFound(_) | OddsError::UnknownOutcome { .. } => ErrorClass::Validation,
            OddsError::AlreadyLocked { .. } => ErrorClass::Policy,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            OddsError::MatchNotFound(_) => "match_not_found",
            OddsError::UnknownOutcome { .. } => "unknown_outcome",
            OddsError::AlreadyLocked { .. } => "match_already_locked",
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// All outcomes' live odds for one match.
#[derive(Debug, Clone, Serialize)]
pub struct OddsBoard {
    pub match_id: MatchId,
    pub status: MatchStatus,
    pub total_pool: Money,
    pub rake_bps: u32,
    pub totals: BTreeMap<Outcome, Money>,
    /// `None` for outcomes without stake.
    pub odds: BTreeMap<Outcome, Option<Multiplier>>,
}

pub struct OddsEngine {
    book: Arc<BetBook>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl OddsEngine {
    pub fn new(book: Arc<BetBook>, events: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self { book, events, clock }
    }

    /// Live multiplier for one outcome; `Ok(None)` while it has no stake.
    pub async fn current_odds(
        &self,
        match_id: &MatchId,
        outcome: &Outcome,
    ) -> Result<Option<Multiplier>, OddsError> {
        let slot = self
            .book
            .pool(match_id)
            .await
            .ok_or_else(|| OddsError::MatchNotFound(match_id.clone()))?;
        let pool = slot.lock().await;
        if !pool.has_outcome(outcome) {
            return Err(OddsError::UnknownOutcome {
                match_id: match_id.clone(),
                outcome: outcome.clone(),
            });
        }
        Ok(pool.odds(outcome))
    }

    pub async fn odds_board(&self, match_id: &MatchId) -> Result<OddsBoard, OddsError> {
        let slot = self
            .book
            .pool(match_id)
            .await
            .ok_or_else(|| OddsError::MatchNotFound(match_id.clone()))?;
        let pool = slot.lock().await;
        Ok(OddsBoard {
            match_id: pool.match_id.clone(),
            status: pool.status,
            total_pool: pool.total_pool(),
            rake_bps: pool.rake_bps,
            totals: pool.totals.clone(),
            odds: pool.outcomes.iter().map(|o| (o.clone(), pool.odds(o))).collect(),
        })
    }

    pub async fn match_status(&self, match_id: &MatchId) -> Result<MatchStatus, OddsError> {
        let slot = self
            .book
            .pool(match_id)
            .await
            .ok_or_else(|| OddsError::MatchNotFound(match_id.clone()))?;
        let status = slot.lock().await.status;
        Ok(status)
    }

    /// Close betting on a match and return its final totals.
    ///
    /// Waits for any in-flight placement on the pool, so no bet lands after
    /// the snapshot is taken.
    pub async fn freeze_and_lock(&self, match_id: &MatchId) -> Result<OddsSnapshot, OddsError> {
        let slot = self
            .book
            .pool(match_id)
            .await
            .ok_or_else(|| OddsError::MatchNotFound(match_id.clone()))?;
        let mut pool = slot.lock().await;
        if pool.status != MatchStatus::Open {
            return Err(OddsError::AlreadyLocked {
                match_id: match_id.clone(),
                status: pool.status,
            });
        }

        let snapshot = pool.freeze(self.clock.now());
        drop(pool);

        info!(
            match_id = %match_id,
            total_pool = %snapshot.total_pool,
            outcomes = snapshot.totals.len(),
            "Match locked, odds frozen"
        );
        self.events.publish(LedgerEvent::MatchLocked {
            match_id: match_id.clone(),
            total_pool: snapshot.total_pool,
            at: snapshot.frozen_at,
        });
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
