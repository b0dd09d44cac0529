//! Platform facade.
//!
//! Wires the ledger, escrow, odds, settlement, risk and rail components
//! together and exposes the operations collaborators call: `deposit`,
//! `withdraw`, `place_bet`, `current_odds`, `settle` and `account_snapshot`,
//! plus match administration and the feed entry point.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::book::BetBook;
use super::deposit::{DepositConfig, DepositError, DepositProcessor};
use super::escrow::{BetError, BetEscrow};
use super::feed::{FeedError, FeedOutcome, MatchFeed};
use super::lanes::AccountLanes;
use super::settlement::{SettlementConfig, SettlementEngine, SettlementError, SettlementSummary};
use super::withdrawal::{WithdrawalConfig, WithdrawalError, WithdrawalProcessor};
use crate::clock::Clock;
use crate::events::{EventBus, LedgerEvent};
use crate::ledger::{InMemoryLedger, LedgerError, LedgerStore};
use crate::odds::{MatchPool, Multiplier, OddsBoard, OddsEngine, OddsError, OddsSnapshot};
use crate::rails::{InstantRail, PaymentRail, RailPolicy};
use crate::risk::compliance::ComplianceOracle;
use crate::risk::{RiskConfig, RiskEvaluator};
use crate::storage::PlatformSnapshot;
use crate::types::{
    AccountId, AccountSnapshot, Bet, BetId, BetRequest, LedgerRecord, MatchFeedEvent, MatchId,
    Money, OpenMatchRequest, Outcome, Receipt,
};

/// Tunables for every component, usually built from `AppConfig`.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub deposit: DepositConfig,
    pub withdrawal: WithdrawalConfig,
    pub settlement: SettlementConfig,
    pub risk: RiskConfig,
    pub rail_policy: RailPolicy,
    /// Rake for matches opened without an explicit one.
    pub default_rake_bps: u32,
    pub event_capacity: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            deposit: DepositConfig::default(),
            withdrawal: WithdrawalConfig::default(),
            settlement: SettlementConfig::default(),
            risk: RiskConfig::default(),
            rail_policy: RailPolicy::default(),
            default_rake_bps: 500, // 5%
            event_capacity: 1024,
        }
    }
}

/// External dependencies of the platform.
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerStore>,
    pub book: Arc<BetBook>,
    pub rail: Arc<dyn PaymentRail>,
    pub compliance: Option<Arc<dyn ComplianceOracle>>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Fresh in-memory stores with an instant rail and no compliance oracle.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: Arc::new(InMemoryLedger::new(clock.clone())),
            book: Arc::new(BetBook::new()),
            rail: Arc::new(InstantRail::new()),
            compliance: None,
            clock,
        }
    }

    /// In-memory stores rebuilt from a saved snapshot.
    pub fn restore(snapshot: PlatformSnapshot, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: Arc::new(InMemoryLedger::restore(snapshot.ledger, clock.clone())),
            book: Arc::new(BetBook::restore(snapshot.book)),
            rail: Arc::new(InstantRail::new()),
            compliance: None,
            clock,
        }
    }

    pub fn with_rail(mut self, rail: Arc<dyn PaymentRail>) -> Self {
        self.rail = rail;
        self
    }

    pub fn with_compliance(mut self, oracle: Arc<dyn ComplianceOracle>) -> Self {
        self.compliance = Some(oracle);
        self
    }
}

pub struct Platform {
    ledger: Arc<dyn LedgerStore>,
    book: Arc<BetBook>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    treasury: AccountId,
    deposits: DepositProcessor,
    withdrawals: WithdrawalProcessor,
    escrow: Arc<BetEscrow>,
    odds: Arc<OddsEngine>,
    settlement: Arc<SettlementEngine>,
    feed: MatchFeed,
}

impl Platform {
    /// Build every component and open the treasury account.
    pub async fn build(config: PlatformConfig, parts: Collaborators) -> Result<Self, LedgerError> {
        let Collaborators {
            ledger,
            book,
            rail,
            compliance,
            clock,
        } = parts;

        let events = EventBus::with_capacity(config.event_capacity);
        let lanes = Arc::new(AccountLanes::new());
        let risk = Arc::new(RiskEvaluator::new(
            config.risk.clone(),
            ledger.clone(),
            compliance,
            clock.clone(),
        ));

        let deposits = DepositProcessor::new(
            config.deposit.clone(),
            ledger.clone(),
            risk.clone(),
            rail.clone(),
            config.rail_policy.clone(),
            lanes.clone(),
            events.clone(),
            clock.clone(),
        );
        let withdrawals = WithdrawalProcessor::new(
            config.withdrawal.clone(),
            ledger.clone(),
            risk.clone(),
            rail,
            config.rail_policy.clone(),
            lanes.clone(),
            events.clone(),
            clock.clone(),
        );
        let escrow = Arc::new(BetEscrow::new(
            ledger.clone(),
            book.clone(),
            risk,
            lanes,
            events.clone(),
            clock.clone(),
            config.default_rake_bps,
        ));
        let odds = Arc::new(OddsEngine::new(book.clone(), events.clone(), clock.clone()));
        let treasury = config.settlement.treasury.clone();
        let settlement = Arc::new(SettlementEngine::new(
            config.settlement,
            escrow.clone(),
            ledger.clone(),
            events.clone(),
            clock.clone(),
        ));
        let feed = MatchFeed::new(odds.clone(), settlement.clone());

        let treasury_snapshot = ledger.open_account(&treasury).await?;
        info!(
            treasury = %treasury,
            balance = %treasury_snapshot.available,
            min_deposit = %config.deposit.min_deposit,
            default_rake_bps = config.default_rake_bps,
            "Platform ready"
        );

        Ok(Self {
            ledger,
            book,
            events,
            clock,
            treasury,
            deposits,
            withdrawals,
            escrow,
            odds,
            settlement,
            feed,
        })
    }

    // -- money movement -----------------------------------------------------

    pub async fn deposit(
        &self,
        account_id: &AccountId,
        amount: Money,
    ) -> Result<Receipt, DepositError> {
        self.deposits.deposit(account_id, amount).await
    }

    /// Deposit under a caller-chosen idempotency key. Repeating the call with
    /// the same key and amount returns the original receipt without moving
    /// funds again.
    pub async fn deposit_with_key(
        &self,
        account_id: &AccountId,
        amount: Money,
        key: Option<&str>,
    ) -> Result<Receipt, DepositError> {
        self.deposits.deposit_with_key(account_id, amount, key).await
    }

    pub async fn withdraw(
        &self,
        account_id: &AccountId,
        amount: Money,
    ) -> Result<Receipt, WithdrawalError> {
        self.withdrawals.withdraw(account_id, amount).await
    }

    /// Withdraw under a caller-chosen idempotency key; see `deposit_with_key`.
    pub async fn withdraw_with_key(
        &self,
        account_id: &AccountId,
        amount: Money,
        key: Option<&str>,
    ) -> Result<Receipt, WithdrawalError> {
        self.withdrawals.withdraw_with_key(account_id, amount, key).await
    }

    pub async fn place_bet(&self, match_id: &MatchId, request: &BetRequest) -> Result<Bet, BetError> {
        self.escrow
            .place_bet(&request.account_id, match_id, &request.outcome, request.stake)
            .await
    }

    // -- matches ------------------------------------------------------------

    pub async fn open_match(&self, request: OpenMatchRequest) -> Result<MatchPool, BetError> {
        self.escrow
            .open_match(request.match_id, request.outcomes, request.rake_bps)
            .await
    }

    pub async fn current_odds(
        &self,
        match_id: &MatchId,
        outcome: &Outcome,
    ) -> Result<Option<Multiplier>, OddsError> {
        self.odds.current_odds(match_id, outcome).await
    }

    pub async fn odds_board(&self, match_id: &MatchId) -> Result<OddsBoard, OddsError> {
        self.odds.odds_board(match_id).await
    }

    pub async fn freeze_and_lock(&self, match_id: &MatchId) -> Result<OddsSnapshot, OddsError> {
        self.odds.freeze_and_lock(match_id).await
    }

    pub async fn settle(
        &self,
        match_id: &MatchId,
        winning_outcome: &Outcome,
    ) -> Result<SettlementSummary, SettlementError> {
        self.settlement.settle(match_id, winning_outcome).await
    }

    pub async fn void_match(&self, match_id: &MatchId) -> Result<SettlementSummary, SettlementError> {
        self.settlement.void_match(match_id).await
    }

    pub async fn handle_feed_event(&self, event: MatchFeedEvent) -> Result<FeedOutcome, FeedError> {
        self.feed.handle(event).await
    }

    // -- queries ------------------------------------------------------------

    pub async fn account_snapshot(&self, account_id: &AccountId) -> Result<AccountSnapshot, LedgerError> {
        self.ledger.snapshot(account_id).await
    }

    pub async fn journal(&self, account_id: &AccountId) -> Result<Vec<LedgerRecord>, LedgerError> {
        self.ledger.journal(account_id).await
    }

    pub async fn bet(&self, bet_id: &BetId) -> Option<Bet> {
        self.escrow.bet(bet_id).await
    }

    pub fn treasury(&self) -> &AccountId {
        &self.treasury
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Copy of all persistent state. Bet placement and resolution pause
    /// while the copy is taken, so every locked balance in the ledger half
    /// matches the open bets in the book half.
    pub async fn export_snapshot(&self) -> Result<PlatformSnapshot, LedgerError> {
        let _exclusive = self.book.exclusive().await;
        let ledger = self.ledger.export().await?;
        let book = self.book.export().await;
        Ok(PlatformSnapshot::new(ledger, book, self.clock.now()))
    }
}
