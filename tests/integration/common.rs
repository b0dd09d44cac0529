//! Shared harness for integration tests.
//!
//! Provides a deterministic `PaymentRail` whose failures are scripted from
//! test code and a `LedgerStore` wrapper that injects store faults, both
//! in-memory with no external dependencies.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wager_ledger::clock::{Clock, ManualClock};
use wager_ledger::engine::{Collaborators, Platform, PlatformConfig};
use wager_ledger::ledger::{InMemoryLedger, LedgerDelta, LedgerError, LedgerExport, LedgerStore};
use wager_ledger::odds::MatchPool;
use wager_ledger::rails::{PaymentRail, RailError, RailReceipt};
use wager_ledger::types::*;

// ---------------------------------------------------------------------------
// Scripted payment rail
// ---------------------------------------------------------------------------

/// A payment rail whose behaviour is fully controllable from test code.
///
/// Transfers are deduplicated by idempotency key, like a real custody
/// service. Every call (including failed ones) is recorded.
#[derive(Default)]
pub struct ScriptedRail {
    executed: Mutex<HashMap<TxReference, RailReceipt>>,
    calls: Mutex<Vec<(TxReference, Money)>>,
    /// Fail this many upcoming calls with `fail_with`.
    fail_times: Mutex<u32>,
    fail_with: Mutex<Option<RailError>>,
    /// If set, every call returns this error.
    force_error: Mutex<Option<RailError>>,
}

impl ScriptedRail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls, then behave normally.
    pub fn fail_next(&self, times: u32, error: RailError) {
        *self.fail_times.lock().unwrap() = times;
        *self.fail_with.lock().unwrap() = Some(error);
    }

    /// Force all subsequent calls to return an error.
    pub fn set_error(&self, error: RailError) {
        *self.force_error.lock().unwrap() = Some(error);
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    /// Every attempt seen so far, in order.
    pub fn calls(&self) -> Vec<(TxReference, Money)> {
        self.calls.lock().unwrap().clone()
    }

    /// Distinct transfers that actually moved funds.
    pub fn executed(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    fn execute(&self, key: &TxReference, amount: Money) -> Result<RailReceipt, RailError> {
        self.calls.lock().unwrap().push((key.clone(), amount));

        if let Some(e) = self.force_error.lock().unwrap().clone() {
            return Err(e);
        }
        {
            let mut remaining = self.fail_times.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                if let Some(e) = self.fail_with.lock().unwrap().clone() {
                    return Err(e);
                }
            }
        }

        let mut executed = self.executed.lock().unwrap();
        let receipt = executed.entry(key.clone()).or_insert_with(|| RailReceipt {
            rail_reference: format!("scripted-{}", uuid::Uuid::new_v4()),
            key: key.clone(),
            amount,
            at: Utc::now(),
        });
        Ok(receipt.clone())
    }
}

#[async_trait]
impl PaymentRail for ScriptedRail {
    async fn transfer_in(
        &self,
        key: &TxReference,
        _account_id: &AccountId,
        amount: Money,
    ) -> Result<RailReceipt, RailError> {
        self.execute(key, amount)
    }

    async fn transfer_out(
        &self,
        key: &TxReference,
        _account_id: &AccountId,
        amount: Money,
    ) -> Result<RailReceipt, RailError> {
        self.execute(key, amount)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Fault-injecting ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Reject before touching state.
    Unavailable,
    /// Reject as a lost write race.
    Conflict,
    /// Apply the write, then report failure to the caller.
    LostAck,
}

struct Injection {
    reason: LedgerReason,
    fault: Fault,
    remaining: u32,
}

/// Wraps `InMemoryLedger` and fails `apply_delta` calls on demand.
pub struct FlakyLedger {
    inner: InMemoryLedger,
    injection: Mutex<Option<Injection>>,
    faults_fired: Mutex<u32>,
}

impl FlakyLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: InMemoryLedger::new(clock),
            injection: Mutex::new(None),
            faults_fired: Mutex::new(0),
        }
    }

    /// Fail the next `times` deltas carrying `reason`.
    pub fn inject(&self, reason: LedgerReason, fault: Fault, times: u32) {
        *self.injection.lock().unwrap() = Some(Injection {
            reason,
            fault,
            remaining: times,
        });
    }

    pub fn faults_fired(&self) -> u32 {
        *self.faults_fired.lock().unwrap()
    }

    fn take_fault(&self, reason: LedgerReason) -> Option<Fault> {
        let mut slot = self.injection.lock().unwrap();
        let injection = slot.as_mut()?;
        if injection.reason != reason || injection.remaining == 0 {
            return None;
        }
        injection.remaining -= 1;
        *self.faults_fired.lock().unwrap() += 1;
        Some(injection.fault)
    }
}

#[async_trait]
impl LedgerStore for FlakyLedger {
    async fn open_account(&self, account_id: &AccountId) -> Result<AccountSnapshot, LedgerError> {
        self.inner.open_account(account_id).await
    }

    async fn apply_delta(&self, delta: LedgerDelta) -> Result<AccountSnapshot, LedgerError> {
        match self.take_fault(delta.reason) {
            None => self.inner.apply_delta(delta).await,
            Some(Fault::Unavailable) => Err(LedgerError::Unavailable("injected outage".into())),
            Some(Fault::Conflict) => Err(LedgerError::Conflict("injected race".into())),
            Some(Fault::LostAck) => {
                self.inner.apply_delta(delta).await?;
                Err(LedgerError::Unavailable("acknowledgement lost".into()))
            }
        }
    }

    async fn snapshot(&self, account_id: &AccountId) -> Result<AccountSnapshot, LedgerError> {
        self.inner.snapshot(account_id).await
    }

    async fn journal(&self, account_id: &AccountId) -> Result<Vec<LedgerRecord>, LedgerError> {
        self.inner.journal(account_id).await
    }

    async fn find_record(&self, reference: &TxReference) -> Result<Option<LedgerRecord>, LedgerError> {
        self.inner.find_record(reference).await
    }

    async fn export(&self) -> Result<LedgerExport, LedgerError> {
        self.inner.export().await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub platform: Arc<Platform>,
    pub ledger: Arc<FlakyLedger>,
    pub rail: Arc<ScriptedRail>,
    pub clock: Arc<ManualClock>,
}

/// Ledger write attempts after a rail transfer in `fast_config`.
pub const COMMIT_ATTEMPTS: u32 = 4;

/// Short backoffs so retry paths finish quickly, and a velocity limit high
/// enough that bursts of test traffic are not blocked.
pub fn fast_config() -> PlatformConfig {
    let mut cfg = PlatformConfig::default();
    cfg.settlement.base_backoff = Duration::from_millis(1);
    cfg.settlement.max_backoff = Duration::from_millis(10);
    cfg.settlement.attempt_timeout = Duration::from_secs(2);
    cfg.rail_policy.base_backoff = Duration::from_millis(1);
    cfg.rail_policy.max_backoff = Duration::from_millis(10);
    for retry in [&mut cfg.deposit.commit_retry, &mut cfg.withdrawal.commit_retry] {
        retry.max_attempts = Some(COMMIT_ATTEMPTS);
        retry.base_backoff = Duration::from_millis(1);
        retry.max_backoff = Duration::from_millis(10);
    }
    cfg.risk.velocity_limit = 10_000;
    cfg
}

pub async fn harness() -> Harness {
    harness_with(fast_config()).await
}

pub async fn harness_with(config: PlatformConfig) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let ledger = Arc::new(FlakyLedger::new(dyn_clock.clone()));
    let rail = Arc::new(ScriptedRail::new());

    let mut parts = Collaborators::in_memory(dyn_clock).with_rail(rail.clone());
    parts.ledger = ledger.clone();

    let platform = Platform::build(config, parts).await.unwrap();
    Harness {
        platform: Arc::new(platform),
        ledger,
        rail,
        clock,
    }
}

pub fn units(n: i64) -> Money {
    Money::from_units(n)
}

impl Harness {
    pub async fn fund(&self, name: &str, amount: i64) -> AccountId {
        let id = AccountId::new(name);
        self.platform.deposit(&id, units(amount)).await.unwrap();
        id
    }

    pub async fn open(&self, match_id: &str, outcomes: &[&str]) -> MatchPool {
        self.platform
            .open_match(OpenMatchRequest {
                match_id: MatchId::new(match_id),
                outcomes: outcomes.iter().map(|o| Outcome::new(*o)).collect(),
                rake_bps: None,
            })
            .await
            .unwrap()
    }

    pub async fn bet(&self, match_id: &str, who: &AccountId, outcome: &str, stake: i64) -> Bet {
        self.platform
            .place_bet(
                &MatchId::new(match_id),
                &BetRequest {
                    account_id: who.clone(),
                    outcome: Outcome::new(outcome),
                    stake: units(stake),
                },
            )
            .await
            .unwrap()
    }

    pub async fn available(&self, who: &AccountId) -> Money {
        self.platform.account_snapshot(who).await.unwrap().available
    }

    pub async fn locked(&self, who: &AccountId) -> Money {
        self.platform.account_snapshot(who).await.unwrap().locked
    }

    /// Sum of `available + locked` over every account, treasury included.
    pub async fn total_held(&self) -> Money {
        let export = self.platform.export_snapshot().await.unwrap();
        export
            .ledger
            .accounts
            .iter()
            .map(|a| a.available + a.locked)
            .sum()
    }
}
