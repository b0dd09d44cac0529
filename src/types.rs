//! Shared types for the wagering ledger.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that the ledger, escrow, odds and
//! settlement modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

/// An amount of the native token, held as a signed count of minor units.
///
/// Balances are never negative; the sign exists so ledger deltas can use the
/// same type as the balances they move.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    /// Minor units per native-token unit (9 decimals).
    pub const SCALE: i64 = 1_000_000_000;
    pub const DECIMALS: u32 = 9;
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Whole native-token units. Intended for constants and tests.
    pub const fn from_units(units: i64) -> Self {
        Self(units * Self::SCALE)
    }

    /// Convert a decimal amount of native units into minor units.
    /// Returns `None` if the value has sub-minor-unit precision or overflows.
    pub fn from_decimal(value: Decimal) -> Option<Self> {
        let scaled = value.checked_mul(Decimal::from(Self::SCALE))?;
        if !scaled.fract().is_zero() {
            return None;
        }
        scaled.to_i64().map(Self)
    }

    /// Parse a decimal string such as `"0.05"` into minor units.
    pub fn parse_units(s: &str) -> Option<Self> {
        Decimal::from_str(s.trim()).ok().and_then(Self::from_decimal)
    }

    pub fn as_minor(&self) -> i64 {
        self.0
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, Self::DECIMALS)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal().normalize())
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }
    };
}

string_id!(
    /// Ledger account key. Derived from the user identity, never reused.
    AccountId
);
string_id!(
    /// Opaque match key supplied by the match-result feed.
    MatchId
);
string_id!(
    /// A bettable outcome of a match (e.g. the agent identifier of a side).
    Outcome
);
string_id!(
    /// Causal reference of a ledger record. Unique across the journal and
    /// reused as the payment-rail idempotency key.
    TxReference
);

/// Namespace for deterministic account ids.
const ACCOUNT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a7e_94d3_4b0a_8e55_c0a1_d2b3_e4f5);

impl AccountId {
    /// Derive the account id for a user identity (wallet address, user key).
    /// The same identity always yields the same id.
    pub fn derive(identity: &str) -> Self {
        Self(Uuid::new_v5(&ACCOUNT_NAMESPACE, identity.as_bytes()).to_string())
    }
}

/// Namespace for references derived from caller idempotency keys.
const CLIENT_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x2b8e_51c4_7a09_4f36_b1d2_93e8_0c6a_57f1);

impl TxReference {
    pub fn deposit() -> Self {
        Self(format!("dep-{}", Uuid::new_v4()))
    }

    pub fn withdrawal() -> Self {
        Self(format!("wd-{}", Uuid::new_v4()))
    }

    /// Deposit reference for a caller-supplied idempotency key. The same
    /// account and key always map to the same reference.
    pub fn keyed_deposit(account_id: &AccountId, key: &str) -> Self {
        Self(format!("dep-{}", client_key(account_id, key)))
    }

    pub fn keyed_withdrawal(account_id: &AccountId, key: &str) -> Self {
        Self(format!("wd-{}", client_key(account_id, key)))
    }

    pub fn bet_placed(bet_id: &BetId) -> Self {
        Self(format!("bet:{bet_id}:place"))
    }

    pub fn bet_resolved(bet_id: &BetId) -> Self {
        Self(format!("bet:{bet_id}:resolve"))
    }

    pub fn rake(match_id: &MatchId) -> Self {
        Self(format!("match:{match_id}:rake"))
    }
}

fn client_key(account_id: &AccountId, key: &str) -> Uuid {
    Uuid::new_v5(&CLIENT_KEY_NAMESPACE, format!("{account_id}:{key}").as_bytes())
}

/// Bet identifier (random UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BetId(pub Uuid);

impl BetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Balance record of one user. Owned by the ledger store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,
    /// Spendable for withdrawal or new bets.
    pub available: Money,
    /// Sum of stakes on unresolved bets.
    pub locked: Money,
    pub total_deposited: Money,
    pub total_withdrawn: Money,
    pub last_withdrawal_at: Option<DateTime<Utc>>,
    pub opened_at: DateTime<Utc>,
}

impl Account {
    pub fn new(account_id: AccountId, opened_at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            available: Money::ZERO,
            locked: Money::ZERO,
            total_deposited: Money::ZERO,
            total_withdrawn: Money::ZERO,
            last_withdrawal_at: None,
            opened_at,
        }
    }

    /// Total account value (available + locked).
    pub fn total(&self) -> Money {
        self.available + self.locked
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            account_id: self.account_id.clone(),
            available: self.available,
            locked: self.locked,
            total: self.total(),
            total_deposited: self.total_deposited,
            total_withdrawn: self.total_withdrawn,
            last_withdrawal_at: self.last_withdrawal_at,
            opened_at: self.opened_at,
        }
    }
}

/// Read-only copy of an account at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: AccountId,
    pub available: Money,
    pub locked: Money,
    pub total: Money,
    pub total_deposited: Money,
    pub total_withdrawn: Money,
    pub last_withdrawal_at: Option<DateTime<Utc>>,
    pub opened_at: DateTime<Utc>,
}

impl fmt::Display for AccountSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | available={} locked={} | deposited={} withdrawn={}",
            self.account_id, self.available, self.locked, self.total_deposited, self.total_withdrawn,
        )
    }
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

/// Why a balance changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    Deposit,
    Withdrawal,
    BetPlaced,
    BetSettled,
    BetRefunded,
    Rake,
}

impl fmt::Display for LedgerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LedgerReason::Deposit => "deposit",
            LedgerReason::Withdrawal => "withdrawal",
            LedgerReason::BetPlaced => "bet-placed",
            LedgerReason::BetSettled => "bet-settled",
            LedgerReason::BetRefunded => "bet-refunded",
            LedgerReason::Rake => "rake",
        };
        f.write_str(s)
    }
}

/// Append-only audit entry written for every successful balance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Journal sequence number, strictly increasing.
    pub seq: u64,
    pub account_id: AccountId,
    pub reason: LedgerReason,
    pub reference: TxReference,
    pub available_delta: Money,
    pub locked_delta: Money,
    pub available_before: Money,
    pub available_after: Money,
    pub locked_before: Money,
    pub locked_after: Money,
    pub at: DateTime<Utc>,
}

impl fmt::Display for LedgerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} avail {}→{} locked {}→{} [{}]",
            self.seq,
            self.account_id,
            self.reason,
            self.available_before,
            self.available_after,
            self.locked_before,
            self.locked_after,
            self.reference,
        )
    }
}

/// Returned to the caller of a successful deposit or withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub reference: TxReference,
    pub account_id: AccountId,
    pub amount: Money,
    /// Available balance after the operation.
    pub available: Money,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Bets and matches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetStatus {
    Open,
    Won,
    Lost,
    Voided,
}

impl BetStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BetStatus::Open)
    }
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetStatus::Open => write!(f, "open"),
            BetStatus::Won => write!(f, "won"),
            BetStatus::Lost => write!(f, "lost"),
            BetStatus::Voided => write!(f, "voided"),
        }
    }
}

/// A stake on one outcome of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    pub bet_id: BetId,
    pub account_id: AccountId,
    pub match_id: MatchId,
    pub outcome: Outcome,
    pub stake: Money,
    /// Payout multiplier frozen at placement.
    pub odds_at_placement: Decimal,
    pub status: BetStatus,
    /// Amount credited to `available` on resolution (zero for a loss).
    pub payout: Money,
    pub placed_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bet {} on {}/{} stake={} @ {}x [{}]",
            self.bet_id,
            self.match_id,
            self.outcome,
            self.stake,
            self.odds_at_placement.round_dp(4),
            self.status,
        )
    }
}

/// Match pool lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    Open,
    Locked,
    Settled,
    Voided,
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchStatus::Open => write!(f, "open"),
            MatchStatus::Locked => write!(f, "locked"),
            MatchStatus::Settled => write!(f, "settled"),
            MatchStatus::Voided => write!(f, "voided"),
        }
    }
}

/// Kind of money-moving request, as seen by the risk gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deposit,
    Withdrawal,
    Bet,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Deposit => write!(f, "deposit"),
            Operation::Withdrawal => write!(f, "withdrawal"),
            Operation::Bet => write!(f, "bet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DepositRequest {
    pub amount: Money,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawalRequest {
    pub amount: Money,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BetRequest {
    pub account_id: AccountId,
    pub outcome: Outcome,
    pub stake: Money,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenMatchRequest {
    pub match_id: MatchId,
    pub outcomes: Vec<Outcome>,
    #[serde(default)]
    pub rake_bps: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettleRequest {
    pub match_id: MatchId,
    pub winning_outcome: Outcome,
}

/// Event delivered by the external match-result feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MatchFeedEvent {
    Started { match_id: MatchId },
    Finished { match_id: MatchId, winning_outcome: Outcome },
    Cancelled { match_id: MatchId },
}

impl MatchFeedEvent {
    pub fn match_id(&self) -> &MatchId {
        match self {
            MatchFeedEvent::Started { match_id }
            | MatchFeedEvent::Finished { match_id, .. }
            | MatchFeedEvent::Cancelled { match_id } => match_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Coarse classification shared by every component error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input (amount, missing account).
    Validation,
    /// Rejected by a business rule (cooldown, minimum, match state).
    Policy,
    /// Lost a serialization race; safe to retry.
    Concurrency,
    /// Would violate a balance invariant; needs investigation.
    Integrity,
    /// Payment rail, feed or store unavailable.
    External,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Concurrency | ErrorClass::External)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Validation => write!(f, "validation"),
            ErrorClass::Policy => write!(f, "policy"),
            ErrorClass::Concurrency => write!(f, "concurrency"),
            ErrorClass::Integrity => write!(f, "integrity"),
            ErrorClass::External => write!(f, "external"),
        }
    }
}

/// Implemented by every error surfaced to collaborators: a stable code and a
/// class, with `Display` as the human-readable reason.
pub trait Classified: std::error::Error {
    fn class(&self) -> ErrorClass;
    fn code(&self) -> &'static str;
}

/// Render a remaining duration as `13h42m`, rounding up to the minute.
pub fn format_remaining(remaining: &chrono::Duration) -> String {
    let secs = remaining.num_seconds().max(0);
    let minutes = (secs + 59) / 60;
    format!("{}h{:02}m", minutes / 60, minutes % 60)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
