//! Ledger event bus.
//!
//! Processors publish an event after every successful money movement.
//! Notification and observability collaborators subscribe to the bus;
//! publishing never blocks and never fails the operation that emitted it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{AccountId, BetId, BetStatus, MatchId, Money, Operation, Outcome};

/// Default capacity of the broadcast channel. Slow subscribers lag rather
/// than back-pressure the ledger.
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Deposited {
        account_id: AccountId,
        amount: Money,
        balance: Money,
        at: DateTime<Utc>,
    },
    Withdrawn {
        account_id: AccountId,
        amount: Money,
        balance: Money,
        at: DateTime<Utc>,
    },
    BetPlaced {
        bet_id: BetId,
        account_id: AccountId,
        match_id: MatchId,
        outcome: Outcome,
        stake: Money,
        at: DateTime<Utc>,
    },
    BetResolved {
        bet_id: BetId,
        account_id: AccountId,
        status: BetStatus,
        payout: Money,
        at: DateTime<Utc>,
    },
    MatchLocked {
        match_id: MatchId,
        total_pool: Money,
        at: DateTime<Utc>,
    },
    MatchSettled {
        match_id: MatchId,
        winning_outcome: Outcome,
        total_paid: Money,
        rake: Money,
        at: DateTime<Utc>,
    },
    MatchVoided {
        match_id: MatchId,
        refunded: Money,
        at: DateTime<Utc>,
    },
    /// A request passed the risk gate but needs compliance follow-up.
    RiskReview {
        account_id: AccountId,
        operation: Operation,
        amount: Money,
        score: u8,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: LedgerEvent) {
        // No subscribers is not an error.
        if self.sender.send(event).is_err() {
            trace!("Ledger event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let event = LedgerEvent::Deposited {
            account_id: AccountId::new("a"),
            amount: Money::from_units(5),
            balance: Money::from_units(5),
            at: Utc::now(),
        };
        bus.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(LedgerEvent::MatchVoided {
            match_id: MatchId::new("m"),
            refunded: Money::ZERO,
            at: Utc::now(),
        });
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(LedgerEvent::MatchLocked {
            match_id: MatchId::new("m1"),
            total_pool: Money::from_units(40),
            at: Utc::now(),
        })
        .unwrap();
        assert_eq!(json["type"], "match_locked");
        assert_eq!(json["match_id"], "m1");
    }
}
