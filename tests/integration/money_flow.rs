//! Deposits and withdrawals through the platform with a scripted rail.

use chrono::Duration;
use tokio_test::{assert_err, assert_ok};

use wager_ledger::engine::{DepositError, WithdrawalError};
use wager_ledger::rails::RailError;
use wager_ledger::types::*;

use crate::common::{harness, units, Fault, COMMIT_ATTEMPTS};

#[tokio::test]
async fn deposit_below_minimum_is_rejected_before_the_rail() {
    let h = harness().await;
    let alice = AccountId::new("alice");

    let err = h
        .platform
        .deposit(&alice, Money::parse_units("0.05").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, DepositError::BelowMinimum { .. }));
    assert_eq!(err.class(), ErrorClass::Policy);
    assert!(h.rail.calls().is_empty());
    assert_err!(h.platform.account_snapshot(&alice).await);
}

#[tokio::test]
async fn deposit_retries_transient_rail_failures_with_one_key() {
    let h = harness().await;
    let alice = AccountId::new("alice");
    h.rail.fail_next(2, RailError::Unavailable("maintenance".into()));

    let receipt = assert_ok!(h.platform.deposit(&alice, units(50)).await);
    assert_eq!(receipt.available, units(50));

    let calls = h.rail.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|(key, _)| *key == receipt.reference));
    assert_eq!(h.rail.executed(), 1);
    assert_eq!(h.platform.journal(&alice).await.unwrap().len(), 1);
}

#[tokio::test]
async fn deposit_rail_outage_leaves_ledger_untouched() {
    let h = harness().await;
    let alice = h.fund("alice", 10).await;
    h.rail.set_error(RailError::Timeout);

    let err = h.platform.deposit(&alice, units(5)).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::External);
    assert_eq!(h.available(&alice).await, units(10));
    assert_eq!(h.platform.journal(&alice).await.unwrap().len(), 1);

    h.rail.clear_error();
    assert_ok!(h.platform.deposit(&alice, units(5)).await);
    assert_eq!(h.available(&alice).await, units(15));
}

#[tokio::test]
async fn rejected_deposit_is_not_retried() {
    let h = harness().await;
    h.rail.set_error(RailError::Rejected("wallet frozen".into()));

    let err = h
        .platform
        .deposit(&AccountId::new("alice"), units(5))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "rail_rejected");
    assert_eq!(h.rail.calls().len(), 1);
}

#[tokio::test]
async fn withdrawal_cooldown_window() {
    let h = harness().await;
    let alice = h.fund("alice", 50).await;

    assert_ok!(h.platform.withdraw(&alice, units(10)).await);
    assert_eq!(h.available(&alice).await, units(40));

    h.clock.advance(Duration::minutes(10));
    let err = h.platform.withdraw(&alice, units(5)).await.unwrap_err();
    match &err {
        WithdrawalError::CooldownActive { remaining } => {
            assert_eq!(*remaining, Duration::hours(24) - Duration::minutes(10));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.to_string(), "withdrawal cooldown: 23h50m remaining");
    assert_eq!(h.available(&alice).await, units(40));

    h.clock.advance(Duration::hours(24));
    assert_ok!(h.platform.withdraw(&alice, units(5)).await);
    assert_eq!(h.available(&alice).await, units(35));
}

#[tokio::test]
async fn withdrawal_cannot_touch_locked_stake() {
    let h = harness().await;
    let alice = h.fund("alice", 50).await;
    h.open("m1", &["A", "B"]).await;
    h.bet("m1", &alice, "A", 20).await;

    let err = h.platform.withdraw(&alice, units(40)).await.unwrap_err();
    assert!(matches!(
        err,
        WithdrawalError::InsufficientAvailable { requested, available }
            if requested == units(40) && available == units(30)
    ));
    assert_eq!(h.locked(&alice).await, units(20));
    assert!(h.rail.calls().iter().all(|(_, amount)| *amount != units(40)));
}

#[tokio::test]
async fn failed_withdrawal_does_not_start_cooldown() {
    let h = harness().await;
    let alice = h.fund("alice", 50).await;
    h.rail.set_error(RailError::Unavailable("down".into()));

    assert_err!(h.platform.withdraw(&alice, units(10)).await);
    let snap = h.platform.account_snapshot(&alice).await.unwrap();
    assert!(snap.last_withdrawal_at.is_none());
    assert_eq!(snap.available, units(50));

    h.rail.clear_error();
    assert_ok!(h.platform.withdraw(&alice, units(10)).await);
}

#[tokio::test]
async fn withdrawal_from_unknown_account() {
    let h = harness().await;
    let err = h
        .platform
        .withdraw(&AccountId::new("ghost"), units(1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unknown_account");
}

#[tokio::test]
async fn withdrawal_debit_retried_after_store_blip() {
    let h = harness().await;
    let alice = h.fund("alice", 100).await;
    h.ledger.inject(LedgerReason::Withdrawal, Fault::Unavailable, 1);

    let receipt = assert_ok!(h.platform.withdraw(&alice, units(40)).await);
    assert_eq!(receipt.available, units(60));
    assert_eq!(h.ledger.faults_fired(), 1);

    let snap = h.platform.account_snapshot(&alice).await.unwrap();
    assert_eq!(snap.available, units(60));
    assert!(snap.last_withdrawal_at.is_some());
    assert_eq!(h.rail.executed(), 2); // one deposit, one withdrawal
    assert_eq!(h.platform.journal(&alice).await.unwrap().len(), 2);
}

#[tokio::test]
async fn withdrawal_with_lost_ack_debits_once() {
    let h = harness().await;
    let alice = h.fund("alice", 100).await;
    h.ledger.inject(LedgerReason::Withdrawal, Fault::LostAck, 1);

    let receipt = assert_ok!(h.platform.withdraw(&alice, units(40)).await);
    assert_eq!(receipt.available, units(60));
    assert_eq!(h.available(&alice).await, units(60));
    assert_eq!(h.platform.journal(&alice).await.unwrap().len(), 2);
}

#[tokio::test]
async fn keyed_withdrawal_completes_when_repeated_after_ledger_outage() {
    let h = harness().await;
    let alice = h.fund("alice", 100).await;
    h.ledger
        .inject(LedgerReason::Withdrawal, Fault::Unavailable, COMMIT_ATTEMPTS);

    // Funds leave through the rail but the debit cannot be written.
    let err = h
        .platform
        .withdraw_with_key(&alice, units(40), Some("payout-1"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "store_unavailable");
    assert_eq!(err.class(), ErrorClass::External);
    assert_eq!(h.rail.executed(), 2);
    assert_eq!(h.available(&alice).await, units(100));

    // The caller repeats with the same key; the rail recognises it and the
    // debit lands once.
    let receipt = assert_ok!(
        h.platform
            .withdraw_with_key(&alice, units(40), Some("payout-1"))
            .await
    );
    assert_eq!(receipt.available, units(60));
    assert_eq!(h.rail.executed(), 2);
    let rail_keys: Vec<_> = h.rail.calls().into_iter().skip(1).map(|(key, _)| key).collect();
    assert_eq!(rail_keys, vec![receipt.reference.clone(), receipt.reference.clone()]);

    // A third repeat is answered from the journal without touching the rail.
    let again = assert_ok!(
        h.platform
            .withdraw_with_key(&alice, units(40), Some("payout-1"))
            .await
    );
    assert_eq!(again.reference, receipt.reference);
    assert_eq!(h.rail.calls().len(), 3);
    assert_eq!(h.available(&alice).await, units(60));
    assert_eq!(h.platform.journal(&alice).await.unwrap().len(), 2);
}

#[tokio::test]
async fn deposit_credit_retried_after_lost_race() {
    let h = harness().await;
    let alice = h.fund("alice", 10).await;
    h.ledger.inject(LedgerReason::Deposit, Fault::Conflict, 2);

    let receipt = assert_ok!(h.platform.deposit(&alice, units(50)).await);
    assert_eq!(receipt.available, units(60));
    assert_eq!(h.ledger.faults_fired(), 2);
    assert_eq!(h.rail.executed(), 2);
    assert_eq!(h.platform.journal(&alice).await.unwrap().len(), 2);
}

#[tokio::test]
async fn keyed_deposit_repeated_after_ledger_outage_credits_once() {
    let h = harness().await;
    let alice = h.fund("alice", 10).await;
    h.ledger
        .inject(LedgerReason::Deposit, Fault::Unavailable, COMMIT_ATTEMPTS);

    let err = h
        .platform
        .deposit_with_key(&alice, units(25), Some("topup-9"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::External);
    assert_eq!(h.available(&alice).await, units(10));

    let receipt = assert_ok!(
        h.platform
            .deposit_with_key(&alice, units(25), Some("topup-9"))
            .await
    );
    assert_eq!(receipt.available, units(35));
    assert_eq!(h.rail.executed(), 2);

    let err = h
        .platform
        .deposit_with_key(&alice, units(30), Some("topup-9"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "idempotency_key_reused");
    assert_eq!(h.available(&alice).await, units(35));
}
