//! Risk evaluator.
//!
//! Scores every money-moving request before the ledger is touched. The
//! score (0-100) combines amount-versus-history, account age, transaction
//! velocity and, for large amounts, an external compliance verdict.
//! `Block` stops the caller; `Review` lets it through and flags it.
//!
//! The evaluator keeps its own velocity window but never writes the ledger.

pub mod compliance;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::events::{EventBus, LedgerEvent};
use crate::ledger::LedgerStore;
use crate::types::{AccountId, Money, Operation};
use compliance::{ComplianceOracle, ComplianceVerdict};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Scores at or above this are flagged for review.
    pub review_score: u8,
    /// Scores at or above this are blocked.
    pub block_score: u8,
    /// Sliding window for velocity counting.
    pub velocity_window: Duration,
    /// Requests per window before velocity starts to score.
    pub velocity_limit: usize,
    /// Amount considered large regardless of history.
    pub large_amount: Money,
    /// Amounts at or above this consult the compliance oracle.
    pub compliance_threshold: Money,
    /// Accounts younger than this are treated as new.
    pub new_account_age: Duration,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            review_score: 50,
            block_score: 80,
            velocity_window: Duration::minutes(10),
            velocity_limit: 10,
            large_amount: Money::from_units(1_000),
            compliance_threshold: Money::from_units(500),
            new_account_age: Duration::hours(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    Allow,
    Review,
    Block,
}

impl fmt::Display for RiskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskAction::Allow => write!(f, "allow"),
            RiskAction::Review => write!(f, "review"),
            RiskAction::Block => write!(f, "block"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskAssessment {
    pub score: u8,
    pub action: RiskAction,
    /// Which heuristics contributed to the score.
    pub reasons: Vec<String>,
}

impl RiskAssessment {
    pub fn is_blocked(&self) -> bool {
        self.action == RiskAction::Block
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

pub struct RiskEvaluator {
    config: RiskConfig,
    ledger: Arc<dyn LedgerStore>,
    compliance: Option<Arc<dyn ComplianceOracle>>,
    clock: Arc<dyn Clock>,
    history: Mutex<VelocityHistory>,
}

/// Number of tracked accounts that triggers the first sweep of idle ones.
const VELOCITY_SWEEP_FLOOR: usize = 1024;

/// Recent request times per account. Accounts whose window has emptied are
/// dropped by a sweep that runs whenever the map doubles past its last size.
struct VelocityHistory {
    by_account: HashMap<AccountId, VecDeque<DateTime<Utc>>>,
    sweep_at: usize,
}

impl VelocityHistory {
    fn new() -> Self {
        Self {
            by_account: HashMap::new(),
            sweep_at: VELOCITY_SWEEP_FLOOR,
        }
    }

    fn sweep(&mut self, cutoff: DateTime<Utc>) {
        let before = self.by_account.len();
        self.by_account.retain(|_, window| {
            while window.front().is_some_and(|t| *t < cutoff) {
                window.pop_front();
            }
            !window.is_empty()
        });
        self.sweep_at = (self.by_account.len() * 2).max(VELOCITY_SWEEP_FLOOR);
        debug!(
            before,
            after = self.by_account.len(),
            "Swept idle velocity windows"
        );
    }
}

impl RiskEvaluator {
    pub fn new(
        config: RiskConfig,
        ledger: Arc<dyn LedgerStore>,
        compliance: Option<Arc<dyn ComplianceOracle>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            ledger,
            compliance,
            clock,
            history: Mutex::new(VelocityHistory::new()),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Score one request. Never fails: an unreachable collaborator raises
    /// the score to review level instead of erroring.
    pub async fn evaluate(
        &self,
        account_id: &AccountId,
        amount: Money,
        operation: Operation,
    ) -> RiskAssessment {
        let now = self.clock.now();
        let mut score: u32 = 0;
        let mut reasons = Vec::new();

        let snapshot = self.ledger.snapshot(account_id).await.ok();
        let age = snapshot.as_ref().map(|s| now - s.opened_at);
        let deposited = snapshot
            .as_ref()
            .map(|s| s.total_deposited)
            .unwrap_or(Money::ZERO);

        if age.map_or(true, |a| a < self.config.new_account_age) {
            score += 15;
            reasons.push("new account".to_string());
        }

        match operation {
            Operation::Deposit => {
                if deposited.is_zero() {
                    if amount >= self.config.large_amount {
                        score += 30;
                        reasons.push("large first deposit".to_string());
                    }
                } else {
                    let ratio = amount.as_minor() / deposited.as_minor().max(1);
                    if ratio >= 10 {
                        score += 30;
                        reasons.push(format!("deposit {ratio}x history"));
                    } else if ratio >= 3 {
                        score += 10;
                        reasons.push(format!("deposit {ratio}x history"));
                    }
                }
            }
            Operation::Withdrawal => {
                if amount >= self.config.large_amount {
                    score += 20;
                    reasons.push("large withdrawal".to_string());
                }
                let young = age.map_or(true, |a| a < Duration::hours(24));
                let drains_deposits =
                    i128::from(amount.as_minor()) * 10 >= i128::from(deposited.as_minor()) * 9;
                if young && deposited.is_positive() && drains_deposits {
                    score += 25;
                    reasons.push("rapid cash-out".to_string());
                }
            }
            Operation::Bet => {
                if amount >= self.config.large_amount {
                    score += 15;
                    reasons.push("large stake".to_string());
                }
            }
        }

        let velocity = self.record_and_count(account_id, now);
        if velocity > self.config.velocity_limit * 2 {
            score += 70;
            reasons.push(format!("velocity {velocity} in window"));
        } else if velocity > self.config.velocity_limit {
            score += 35;
            reasons.push(format!("velocity {velocity} in window"));
        }

        let review_floor = u32::from(self.config.review_score);
        if amount >= self.config.compliance_threshold {
            if let Some(oracle) = &self.compliance {
                match oracle.verdict(account_id, amount, operation).await {
                    Ok(ComplianceVerdict::Compliant) => {}
                    Ok(ComplianceVerdict::Pending) => {
                        score = score.max(review_floor);
                        reasons.push("compliance pending".to_string());
                    }
                    Ok(ComplianceVerdict::Rejected) => {
                        score = 100;
                        reasons.push("compliance rejected".to_string());
                    }
                    Err(e) => {
                        warn!(account_id = %account_id, error = %e, "Compliance check failed");
                        score = score.max(review_floor);
                        reasons.push("compliance unavailable".to_string());
                    }
                }
            }
        }

        let score = score.min(100) as u8;
        let action = if score >= self.config.block_score {
            RiskAction::Block
        } else if score >= self.config.review_score {
            RiskAction::Review
        } else {
            RiskAction::Allow
        };

        debug!(
            account_id = %account_id,
            operation = %operation,
            amount = %amount,
            score,
            action = %action,
            "Risk evaluated"
        );

        RiskAssessment {
            score,
            action,
            reasons,
        }
    }

    /// Evaluate and act on the verdict. `Review` publishes a `RiskReview`
    /// event and lets the request through; `Block` comes back as `Err`.
    pub async fn screen(
        &self,
        events: &EventBus,
        account_id: &AccountId,
        amount: Money,
        operation: Operation,
    ) -> Result<RiskAssessment, RiskAssessment> {
        let assessment = self.evaluate(account_id, amount, operation).await;
        match assessment.action {
            RiskAction::Allow => Ok(assessment),
            RiskAction::Review => {
                info!(
                    account_id = %account_id,
                    operation = %operation,
                    score = assessment.score,
                    reasons = ?assessment.reasons,
                    "Flagged for compliance review"
                );
                events.publish(LedgerEvent::RiskReview {
                    account_id: account_id.clone(),
                    operation,
                    amount,
                    score: assessment.score,
                    at: self.clock.now(),
                });
                Ok(assessment)
            }
            RiskAction::Block => {
                warn!(
                    account_id = %account_id,
                    operation = %operation,
                    amount = %amount,
                    score = assessment.score,
                    reasons = ?assessment.reasons,
                    "Blocked by risk gate"
                );
                Err(assessment)
            }
        }
    }

    /// Record a request at `now` and return how many fall in the window.
    fn record_and_count(&self, account_id: &AccountId, now: DateTime<Utc>) -> usize {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now - self.config.velocity_window;
        if history.by_account.len() >= history.sweep_at {
            history.sweep(cutoff);
        }
        let window = history.by_account.entry(account_id.clone()).or_default();
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        window.push_back(now);
        window.len()
    }

    /// Accounts with a live velocity window.
    pub fn tracked_accounts(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).by_account.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
