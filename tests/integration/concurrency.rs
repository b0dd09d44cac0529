//! Concurrent access: balances stay non-negative and settlement runs once.

use futures::future::join_all;
use std::sync::Arc;

use wager_ledger::engine::{BetError, SettlementError, WithdrawalError};
use wager_ledger::types::*;

use crate::common::{harness, units};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bets_cannot_overdraw() {
    let h = harness().await;
    let alice = h.fund("alice", 50).await;
    h.open("m1", &["A", "B"]).await;

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let platform = Arc::clone(&h.platform);
            let alice = alice.clone();
            let outcome = if i % 2 == 0 { "A" } else { "B" };
            tokio::spawn(async move {
                platform
                    .place_bet(
                        &MatchId::new("m1"),
                        &BetRequest {
                            account_id: alice,
                            outcome: Outcome::new(outcome),
                            stake: units(10),
                        },
                    )
                    .await
            })
        })
        .collect();

    let mut placed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => placed += 1,
            Err(BetError::InsufficientAvailable { .. }) => {}
            Err(e) => panic!("unexpected error {e:?}"),
        }
    }

    assert_eq!(placed, 5);
    let snap = h.platform.account_snapshot(&alice).await.unwrap();
    assert_eq!(snap.available, Money::ZERO);
    assert_eq!(snap.locked, units(50));

    let board = h.platform.odds_board(&MatchId::new("m1")).await.unwrap();
    assert_eq!(board.total_pool, units(50));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_settles_pay_once() {
    let h = harness().await;
    let alice = h.fund("alice", 50).await;
    let bob = h.fund("bob", 50).await;
    h.open("m1", &["A", "B"]).await;
    h.bet("m1", &alice, "A", 20).await;
    h.bet("m1", &bob, "B", 20).await;
    let m1 = MatchId::new("m1");
    h.platform.freeze_and_lock(&m1).await.unwrap();

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let platform = Arc::clone(&h.platform);
            let m1 = m1.clone();
            tokio::spawn(async move { platform.settle(&m1, &Outcome::new("A")).await })
        })
        .collect();

    let mut settled = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => settled += 1,
            Err(SettlementError::AlreadySettled(_)) => {}
            Err(e) => panic!("unexpected error {e:?}"),
        }
    }

    assert_eq!(settled, 1);
    assert_eq!(h.available(&alice).await, units(68));
    assert_eq!(h.available(h.platform.treasury()).await, units(2));
    assert_eq!(h.total_held().await, units(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_withdrawals_respect_cooldown() {
    let h = harness().await;
    let alice = h.fund("alice", 50).await;

    let results = join_all((0..4).map(|_| h.platform.withdraw(&alice, units(5)))).await;
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let cooling = results
        .iter()
        .filter(|r| matches!(r, Err(WithdrawalError::CooldownActive { .. })))
        .count();

    assert_eq!(ok, 1);
    assert_eq!(cooling, 3);
    assert_eq!(h.available(&alice).await, units(45));
    assert_eq!(h.rail.calls().len(), 2); // one deposit, one withdrawal
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_bettors_one_match_conserve_funds() {
    let h = harness().await;
    let mut bettors = Vec::new();
    for i in 0..20 {
        bettors.push(h.fund(&format!("user-{i}"), 30).await);
    }
    h.open("final", &["home", "away"]).await;

    let handles: Vec<_> = bettors
        .iter()
        .enumerate()
        .map(|(i, who)| {
            let platform = Arc::clone(&h.platform);
            let who = who.clone();
            let outcome = if i % 4 == 0 { "home" } else { "away" };
            tokio::spawn(async move {
                platform
                    .place_bet(
                        &MatchId::new("final"),
                        &BetRequest {
                            account_id: who,
                            outcome: Outcome::new(outcome),
                            stake: units(10),
                        },
                    )
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let before = h.total_held().await;
    assert_eq!(before, units(600));

    let m = MatchId::new("final");
    h.platform.freeze_and_lock(&m).await.unwrap();
    let summary = h.platform.settle(&m, &Outcome::new("home")).await.unwrap();

    // 5 winners share 200 less 5% rake.
    assert_eq!(summary.bets_won, 5);
    assert_eq!(summary.bets_lost, 15);
    assert_eq!(summary.total_paid, units(190));
    assert_eq!(summary.rake, units(10));
    assert_eq!(h.available(&bettors[0]).await, units(58));
    assert_eq!(h.available(&bettors[1]).await, units(20));
    assert_eq!(h.total_held().await, before);

    let snapshot = h.platform.export_snapshot().await.unwrap();
    assert!(snapshot.reconcile().is_empty());
    assert!(snapshot
        .ledger
        .accounts
        .iter()
        .all(|a| a.locked == Money::ZERO && !a.available.is_negative()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshots_taken_under_load_always_reconcile() {
    let h = harness().await;
    let mut bettors = Vec::new();
    for i in 0..12 {
        bettors.push(h.fund(&format!("user-{i}"), 100).await);
    }
    for m in ["m0", "m1", "m2"] {
        h.open(m, &["A", "B"]).await;
    }

    let exporter = {
        let platform = Arc::clone(&h.platform);
        tokio::spawn(async move {
            let mut taken = 0;
            for _ in 0..40 {
                let snapshot = platform.export_snapshot().await.unwrap();
                let problems = snapshot.reconcile();
                assert!(problems.is_empty(), "{problems:?}");
                taken += 1;
                tokio::task::yield_now().await;
            }
            taken
        })
    };

    let placements: Vec<_> = bettors
        .iter()
        .enumerate()
        .flat_map(|(i, who)| {
            (0..3).map(move |round| (i, round, who.clone()))
        })
        .map(|(i, round, who)| {
            let platform = Arc::clone(&h.platform);
            tokio::spawn(async move {
                let outcome = if (i + round) % 2 == 0 { "A" } else { "B" };
                platform
                    .place_bet(
                        &MatchId::new(format!("m{round}")),
                        &BetRequest {
                            account_id: who,
                            outcome: Outcome::new(outcome),
                            stake: units(5),
                        },
                    )
                    .await
            })
        })
        .collect();
    for handle in placements {
        handle.await.unwrap().unwrap();
    }

    let settles: Vec<_> = ["m0", "m1", "m2"]
        .into_iter()
        .map(|m| {
            let platform = Arc::clone(&h.platform);
            tokio::spawn(async move {
                let m = MatchId::new(m);
                platform.freeze_and_lock(&m).await.unwrap();
                platform.settle(&m, &Outcome::new("A")).await
            })
        })
        .collect();
    for handle in settles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(exporter.await.unwrap(), 40);
    let last = h.platform.export_snapshot().await.unwrap();
    assert!(last.reconcile().is_empty());
    assert_eq!(h.total_held().await, units(1200));
}
