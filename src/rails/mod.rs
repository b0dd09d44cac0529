//! Payment rails.
//!
//! A `PaymentRail` moves native tokens between the user's wallet and the
//! platform. Every call carries an idempotency key (the ledger reference of
//! the operation), so a retried transfer is executed by the rail at most once.
//! The processors call the rail before touching the ledger; a failed
//! transfer leaves balances unchanged.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::{AccountId, Classified, ErrorClass, Money, TxReference};

pub use http::HttpPaymentRail;

/// Default attempts per transfer, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff between attempts.
pub const BASE_BACKOFF_MS: u64 = 200;

/// Ceiling on the delay between attempts.
pub const MAX_BACKOFF_MS: u64 = 10_000;

/// Keys an `InstantRail` remembers before forgetting the oldest.
pub const INSTANT_KEY_CAPACITY: usize = 100_000;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Wallet → platform (deposit).
    In,
    /// Platform → wallet (withdrawal).
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
        }
    }
}

/// Confirmation returned by the rail for a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailReceipt {
    /// Rail-side transaction id (e.g. an on-chain signature).
    pub rail_reference: String,
    pub key: TxReference,
    pub amount: Money,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RailError {
    #[error("payment rail timed out")]
    Timeout,

    #[error("payment rail unavailable: {0}")]
    Unavailable(String),

    #[error("payment rail rejected transfer: {0}")]
    Rejected(String),
}

impl Classified for RailError {
    fn class(&self) -> ErrorClass {
        match self {
            RailError::Timeout | RailError::Unavailable(_) => ErrorClass::External,
            RailError::Rejected(_) => ErrorClass::Policy,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            RailError::Timeout => "rail_timeout",
            RailError::Unavailable(_) => "rail_unavailable",
            RailError::Rejected(_) => "rail_rejected",
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentRail: Send + Sync {
    /// Pull `amount` from the user's wallet into the platform.
    async fn transfer_in(
        &self,
        key: &TxReference,
        account_id: &AccountId,
        amount: Money,
    ) -> Result<RailReceipt, RailError>;

    /// Push `amount` from the platform to the user's wallet.
    async fn transfer_out(
        &self,
        key: &TxReference,
        account_id: &AccountId,
        amount: Money,
    ) -> Result<RailReceipt, RailError>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RailPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RailPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RailPolicy {
    /// Delay before retry number `retry` (1-based). Saturates rather than
    /// overflowing for large attempt counts.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(2u32.pow(exp))
            .min(self.max_backoff)
    }
}

/// Run a transfer with bounded retries, reusing the same idempotency key on
/// every attempt. Only `Timeout` and `Unavailable` are retried.
pub async fn call_with_retry(
    rail: &dyn PaymentRail,
    policy: &RailPolicy,
    direction: Direction,
    key: &TxReference,
    account_id: &AccountId,
    amount: Money,
) -> Result<RailReceipt, RailError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = RailError::Timeout;

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = policy.backoff(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, key = %key, "Retrying rail transfer");
            tokio::time::sleep(delay).await;
        }

        let call = async {
            match direction {
                Direction::In => rail.transfer_in(key, account_id, amount).await,
                Direction::Out => rail.transfer_out(key, account_id, amount).await,
            }
        };
        let result = match tokio::time::timeout(policy.attempt_timeout, call).await {
            Ok(r) => r,
            Err(_) => Err(RailError::Timeout),
        };

        match result {
            Ok(receipt) => return Ok(receipt),
            Err(e @ RailError::Rejected(_)) => return Err(e),
            Err(e) => {
                warn!(
                    rail = rail.name(),
                    direction = %direction,
                    attempt,
                    key = %key,
                    error = %e,
                    "Rail transfer failed"
                );
                last_error = e;
            }
        }
    }

    Err(last_error)
}

// ---------------------------------------------------------------------------
// In-process rail
// ---------------------------------------------------------------------------

/// Rail that settles instantly in-process. Used for local runs and tests;
/// it honours idempotency keys like a real rail, remembering the most recent
/// `capacity` of them.
pub struct InstantRail {
    state: Mutex<InstantState>,
    capacity: usize,
}

#[derive(Default)]
struct InstantState {
    seen: HashMap<TxReference, RailReceipt>,
    order: VecDeque<TxReference>,
    executed: usize,
}

impl Default for InstantRail {
    fn default() -> Self {
        Self::with_capacity(INSTANT_KEY_CAPACITY)
    }
}

impl InstantRail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(InstantState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Number of distinct transfers executed.
    pub fn executed(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).executed
    }

    /// Number of idempotency keys currently remembered.
    pub fn remembered(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).seen.len()
    }

    fn execute(&self, key: &TxReference, amount: Money) -> Result<RailReceipt, RailError> {
        if !amount.is_positive() {
            return Err(RailError::Rejected(format!("non-positive amount {amount}")));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(receipt) = state.seen.get(key) {
            return Ok(receipt.clone());
        }
        let receipt = RailReceipt {
            rail_reference: format!("instant-{}", uuid::Uuid::new_v4()),
            key: key.clone(),
            amount,
            at: Utc::now(),
        };
        state.executed += 1;
        state.seen.insert(key.clone(), receipt.clone());
        state.order.push_back(key.clone());
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.seen.remove(&oldest);
            }
        }
        Ok(receipt)
    }
}

#[async_trait]
impl PaymentRail for InstantRail {
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
        "instant"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
