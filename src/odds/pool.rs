//! Match pools and frozen odds snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{multiplier, Multiplier};
use crate::types::{BetId, MatchId, MatchStatus, Money, Outcome};

/// Per-match aggregate of locked stakes. Owned by the bet book; written only
/// by the escrow and the odds engine while holding the pool's lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchPool {
    pub match_id: MatchId,
    pub outcomes: Vec<Outcome>,
    /// Locked stake per outcome; every declared outcome has an entry.
    pub totals: BTreeMap<Outcome, Money>,
    pub rake_bps: u32,
    pub status: MatchStatus,
    /// Totals captured by `freeze`, read by settlement.
    pub frozen: Option<OddsSnapshot>,
    /// Winner named by the first settlement attempt.
    pub declared_winner: Option<Outcome>,
    pub bet_ids: Vec<BetId>,
    pub opened_at: DateTime<Utc>,
}

impl MatchPool {
    pub fn new(match_id: MatchId, outcomes: Vec<Outcome>, rake_bps: u32, opened_at: DateTime<Utc>) -> Self {
        let totals = outcomes.iter().map(|o| (o.clone(), Money::ZERO)).collect();
        Self {
            match_id,
            outcomes,
            totals,
            rake_bps,
            status: MatchStatus::Open,
            frozen: None,
            declared_winner: None,
            bet_ids: Vec::new(),
            opened_at,
        }
    }

    pub fn has_outcome(&self, outcome: &Outcome) -> bool {
        self.totals.contains_key(outcome)
    }

    pub fn outcome_total(&self, outcome: &Outcome) -> Money {
        self.totals.get(outcome).copied().unwrap_or(Money::ZERO)
    }

    pub fn total_pool(&self) -> Money {
        self.totals.values().copied().sum()
    }

    /// Live multiplier for `outcome`, `None` while the outcome has no stake.
    pub fn odds(&self, outcome: &Outcome) -> Option<Multiplier> {
        multiplier(self.total_pool(), self.outcome_total(outcome), self.rake_bps)
    }

    /// Totals after adding `stake` to `outcome`, without applying them.
    /// `None` on an unknown outcome or overflow.
    pub fn totals_with(&self, outcome: &Outcome, stake: Money) -> Option<BTreeMap<Outcome, Money>> {
        let current = *self.totals.get(outcome)?;
        self.total_pool().checked_add(stake)?;
        let mut totals = self.totals.clone();
        totals.insert(outcome.clone(), current.checked_add(stake)?);
        Some(totals)
    }

    /// Stop accepting bets and capture the final totals.
    pub fn freeze(&mut self, at: DateTime<Utc>) -> OddsSnapshot {
        let snapshot = OddsSnapshot {
            match_id: self.match_id.clone(),
            totals: self.totals.clone(),
            total_pool: self.total_pool(),
            rake_bps: self.rake_bps,
            frozen_at: at,
        };
        self.status = MatchStatus::Locked;
        self.frozen = Some(snapshot.clone());
        snapshot
    }
}

/// Per-outcome totals of a pool at the moment betting closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub match_id: MatchId,
    pub totals: BTreeMap<Outcome, Money>,
    pub total_pool: Money,
    pub rake_bps: u32,
    pub frozen_at: DateTime<Utc>,
}

impl OddsSnapshot {
    pub fn outcome_total(&self, outcome: &Outcome) -> Money {
        self.totals.get(outcome).copied().unwrap_or(Money::ZERO)
    }

    pub fn odds(&self, outcome: &Outcome) -> Option<Multiplier> {
        multiplier(self.total_pool, self.outcome_total(outcome), self.rake_bps)
    }
}
