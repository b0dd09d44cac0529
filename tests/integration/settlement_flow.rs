//! Match lifecycle: placement, freeze, settlement, void and recovery.

use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio_test::assert_ok;

use wager_ledger::clock::{Clock, ManualClock};
use wager_ledger::engine::{
    BetError, Collaborators, FeedOutcome, PayoutPolicy, Platform, SettlementError,
};
use wager_ledger::storage::PlatformSnapshot;
use wager_ledger::types::*;

use crate::common::{fast_config, harness, harness_with, units, Fault, Harness};

/// Two bettors, 20 each on opposite sides of `m1`.
async fn two_sided(h: &Harness) -> (AccountId, AccountId) {
    let alice = h.fund("alice", 50).await;
    let bob = h.fund("bob", 50).await;
    h.open("m1", &["A", "B"]).await;
    h.bet("m1", &alice, "A", 20).await;
    h.bet("m1", &bob, "B", 20).await;
    (alice, bob)
}

async fn restore(snapshot: PlatformSnapshot) -> Platform {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    Platform::build(fast_config(), Collaborators::restore(snapshot, clock))
        .await
        .unwrap()
}

#[tokio::test]
async fn settles_parimutuel_pool_and_conserves_funds() {
    let h = harness().await;
    let (alice, bob) = two_sided(&h).await;
    let m1 = MatchId::new("m1");
    assert_eq!(h.total_held().await, units(100));

    h.platform.freeze_and_lock(&m1).await.unwrap();
    let summary = h.platform.settle(&m1, &Outcome::new("A")).await.unwrap();

    assert_eq!(summary.status, MatchStatus::Settled);
    assert_eq!(summary.total_pool, units(40));
    assert_eq!(summary.total_paid, units(38));
    assert_eq!(summary.rake, units(2));
    assert_eq!((summary.bets_won, summary.bets_lost), (1, 1));

    assert_eq!(h.available(&alice).await, units(68));
    assert_eq!(h.locked(&alice).await, Money::ZERO);
    assert_eq!(h.available(&bob).await, units(30));
    assert_eq!(h.locked(&bob).await, Money::ZERO);
    assert_eq!(h.available(h.platform.treasury()).await, units(2));
    assert_eq!(h.total_held().await, units(100));

    let err = h.platform.withdraw(&alice, units(1000)).await.unwrap_err();
    assert_eq!(err.code(), "insufficient_available");
}

#[tokio::test]
async fn odds_at_placement_never_change() {
    let h = harness().await;
    let alice = h.fund("alice", 50).await;
    let bob = h.fund("bob", 50).await;
    h.open("m1", &["A", "B"]).await;
    let m1 = MatchId::new("m1");

    let first = h.bet("m1", &alice, "A", 20).await;
    assert_eq!(first.odds_at_placement, dec!(0.95));

    h.bet("m1", &bob, "B", 20).await;
    let live = h.platform.current_odds(&m1, &Outcome::new("A")).await.unwrap();
    assert_eq!(live, Some(dec!(1.9)));

    let stored = h.platform.bet(&first.bet_id).await.unwrap();
    assert_eq!(stored.odds_at_placement, dec!(0.95));
}

#[tokio::test]
async fn settling_twice_is_rejected_without_new_records() {
    let h = harness().await;
    let (alice, _) = two_sided(&h).await;
    let m1 = MatchId::new("m1");
    h.platform.freeze_and_lock(&m1).await.unwrap();
    h.platform.settle(&m1, &Outcome::new("A")).await.unwrap();
    let records = h.platform.journal(&alice).await.unwrap().len();

    let err = h.platform.settle(&m1, &Outcome::new("A")).await.unwrap_err();
    assert!(matches!(err, SettlementError::AlreadySettled(_)));
    assert_eq!(h.platform.journal(&alice).await.unwrap().len(), records);
    assert_eq!(h.available(&alice).await, units(68));
}

#[tokio::test]
async fn bets_after_lock_are_rejected() {
    let h = harness().await;
    let (alice, _) = two_sided(&h).await;
    h.platform.freeze_and_lock(&MatchId::new("m1")).await.unwrap();

    let err = h
        .platform
        .place_bet(
            &MatchId::new("m1"),
            &BetRequest {
                account_id: alice.clone(),
                outcome: Outcome::new("A"),
                stake: units(5),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BetError::MatchNotOpen { status: MatchStatus::Locked, .. }));
    assert_eq!(h.available(&alice).await, units(30));
}

#[tokio::test]
async fn settle_requires_lock() {
    let h = harness().await;
    two_sided(&h).await;
    let err = h
        .platform
        .settle(&MatchId::new("m1"), &Outcome::new("A"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "match_not_locked");
}

#[tokio::test]
async fn settlement_rides_out_store_outage() {
    let h = harness().await;
    let (alice, bob) = two_sided(&h).await;
    let m1 = MatchId::new("m1");
    h.platform.freeze_and_lock(&m1).await.unwrap();

    h.ledger.inject(LedgerReason::BetSettled, Fault::Unavailable, 3);
    let summary = assert_ok!(h.platform.settle(&m1, &Outcome::new("A")).await);
    assert_eq!(summary.total_paid, units(38));
    assert_eq!(h.ledger.faults_fired(), 3);
    assert_eq!(h.available(&alice).await, units(68));
    assert_eq!(h.available(&bob).await, units(30));
}

#[tokio::test]
async fn settlement_retries_write_conflicts() {
    let h = harness().await;
    let (alice, _) = two_sided(&h).await;
    let m1 = MatchId::new("m1");
    h.platform.freeze_and_lock(&m1).await.unwrap();

    h.ledger.inject(LedgerReason::Rake, Fault::Conflict, 2);
    let summary = assert_ok!(h.platform.settle(&m1, &Outcome::new("A")).await);
    assert_eq!(summary.rake, units(2));
    assert_eq!(h.available(h.platform.treasury()).await, units(2));
    assert_eq!(h.available(&alice).await, units(68));
}

#[tokio::test]
async fn lost_acknowledgement_is_adopted_not_repaid() {
    let h = harness().await;
    let (alice, _) = two_sided(&h).await;
    let m1 = MatchId::new("m1");
    h.platform.freeze_and_lock(&m1).await.unwrap();

    h.ledger.inject(LedgerReason::BetSettled, Fault::LostAck, 2);
    let summary = h.platform.settle(&m1, &Outcome::new("A")).await.unwrap();
    assert_eq!(summary.total_paid, units(38));

    let settled: Vec<_> = h
        .platform
        .journal(&alice)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.reason == LedgerReason::BetSettled)
        .collect();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].available_delta, units(38));
    assert_eq!(h.available(&alice).await, units(68));
    assert_eq!(h.total_held().await, units(100));
}

#[tokio::test]
async fn resumes_after_crash_between_ledger_and_bet_update() {
    let h = harness().await;
    let (alice, _) = two_sided(&h).await;
    let m1 = MatchId::new("m1");
    h.platform.freeze_and_lock(&m1).await.unwrap();
    h.platform.settle(&m1, &Outcome::new("A")).await.unwrap();
    let records_before = h.platform.export_snapshot().await.unwrap().ledger.journal.len();

    // Rewind the book as if the process died after the payout was journaled
    // but before the bet and pool were marked.
    let mut snapshot = h.platform.export_snapshot().await.unwrap();
    for bet in snapshot.book.bets.iter_mut().filter(|b| b.account_id == alice) {
        bet.status = BetStatus::Open;
        bet.payout = Money::ZERO;
        bet.resolved_at = None;
    }
    for pool in snapshot.book.pools.iter_mut() {
        pool.status = MatchStatus::Locked;
    }

    let recovered = restore(snapshot).await;
    let summary = recovered.settle(&m1, &Outcome::new("A")).await.unwrap();
    assert_eq!(summary.total_paid, units(38));
    assert_eq!(summary.rake, units(2));

    let after = recovered.export_snapshot().await.unwrap();
    assert_eq!(after.ledger.journal.len(), records_before);
    assert!(after.reconcile().is_empty());
    assert_eq!(recovered.account_snapshot(&alice).await.unwrap().available, units(68));
    assert_eq!(
        recovered.account_snapshot(recovered.treasury()).await.unwrap().available,
        units(2)
    );
}

#[tokio::test]
async fn declared_winner_is_binding() {
    let h = harness().await;
    two_sided(&h).await;
    let m1 = MatchId::new("m1");
    h.platform.freeze_and_lock(&m1).await.unwrap();

    let mut snapshot = h.platform.export_snapshot().await.unwrap();
    snapshot.book.pools[0].declared_winner = Some(Outcome::new("A"));
    let recovered = restore(snapshot).await;

    let err = recovered.settle(&m1, &Outcome::new("B")).await.unwrap_err();
    assert!(matches!(err, SettlementError::OutcomeMismatch { .. }));
    let err = recovered.void_match(&m1).await.unwrap_err();
    assert_eq!(err.code(), "winner_declared");

    assert_ok!(recovered.settle(&m1, &Outcome::new("A")).await);
}

#[tokio::test]
async fn no_stake_on_winner_refunds_everyone() {
    let h = harness().await;
    let alice = h.fund("alice", 50).await;
    let bob = h.fund("bob", 50).await;
    h.open("m1", &["A", "B", "draw"]).await;
    h.bet("m1", &alice, "A", 20).await;
    h.bet("m1", &bob, "B", 10).await;
    let m1 = MatchId::new("m1");
    h.platform.freeze_and_lock(&m1).await.unwrap();

    let summary = h.platform.settle(&m1, &Outcome::new("draw")).await.unwrap();
    assert_eq!(summary.status, MatchStatus::Voided);
    assert_eq!(summary.bets_refunded, 2);
    assert_eq!(summary.rake, Money::ZERO);
    assert_eq!(h.available(&alice).await, units(50));
    assert_eq!(h.available(&bob).await, units(50));
    assert_eq!(h.available(h.platform.treasury()).await, Money::ZERO);
}

#[tokio::test]
async fn cancelled_feed_event_voids_match() {
    let h = harness().await;
    let (alice, bob) = two_sided(&h).await;
    let m1 = MatchId::new("m1");

    let started = h
        .platform
        .handle_feed_event(MatchFeedEvent::Started { match_id: m1.clone() })
        .await
        .unwrap();
    assert!(matches!(started, FeedOutcome::Locked { .. }));

    let cancelled = h
        .platform
        .handle_feed_event(MatchFeedEvent::Cancelled { match_id: m1.clone() })
        .await
        .unwrap();
    match cancelled {
        FeedOutcome::Voided { summary } => assert_eq!(summary.total_paid, units(40)),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.available(&alice).await, units(50));
    assert_eq!(h.available(&bob).await, units(50));

    let err = h
        .platform
        .handle_feed_event(MatchFeedEvent::Finished {
            match_id: m1,
            winning_outcome: Outcome::new("A"),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "already_voided");
}

#[tokio::test]
async fn fixed_policy_pays_placement_odds() {
    let mut cfg = fast_config();
    cfg.settlement.policy = PayoutPolicy::FixedAtPlacement;
    let h = harness_with(cfg).await;
    let (alice, _) = two_sided(&h).await;
    let m1 = MatchId::new("m1");
    h.platform.freeze_and_lock(&m1).await.unwrap();

    // Alice bet first, into an empty pool: 0.95x.
    let summary = h.platform.settle(&m1, &Outcome::new("A")).await.unwrap();
    assert_eq!(summary.total_paid, units(19));
    assert_eq!(summary.rake, units(21));
    assert_eq!(h.available(&alice).await, units(49));
    assert_eq!(h.available(h.platform.treasury()).await, units(21));
    assert_eq!(h.total_held().await, units(100));
}
