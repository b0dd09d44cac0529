//! Core engine: processors, escrow and settlement behind the `Platform` facade.
//!
//! Money moves along one path: request → risk gate → (payment rail) →
//! `LedgerStore::apply_delta` → event. Per-account lanes keep a user's own
//! operations in admission order; per-match lanes serialize settlement.

pub mod book;
pub mod deposit;
pub mod escrow;
pub mod feed;
pub mod lanes;
pub mod retry;
pub mod service;
pub mod settlement;
pub mod withdrawal;

pub use book::{BetBook, BookExport};
pub use deposit::{DepositConfig, DepositError, DepositProcessor};
pub use escrow::{BetError, BetEscrow, Resolution};
pub use feed::{FeedError, FeedOutcome, MatchFeed};
pub use retry::RetryPolicy;
pub use service::{Collaborators, Platform, PlatformConfig};
pub use settlement::{
    PayoutPolicy, SettlementConfig, SettlementEngine, SettlementError, SettlementSummary,
};
pub use withdrawal::{WithdrawalConfig, WithdrawalError, WithdrawalProcessor};
