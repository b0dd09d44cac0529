//! In-memory ledger store.
//!
//! Each account lives behind its own `tokio::sync::Mutex`, giving
//! single-writer-per-account semantics while distinct accounts proceed in
//! parallel. The journal is a shared append-only vector indexed by
//! reference; it is only locked while an account lock is already held, or
//! on its own, so lock order is always account → journal.
//!
//! The journal lock is global: references are unique across all accounts
//! and `seq` is one total order, so the duplicate check, the balance check
//! and the append for two different accounts still take turns. The section
//! it guards is pure in-memory work with no await inside it, so the cost is
//! a short critical section per write rather than a wait on I/O. A store
//! backed by a database gets the same guarantees from a unique index and a
//! sequence and does not share this bottleneck.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::{LedgerDelta, LedgerError, LedgerExport, LedgerStore};
use crate::clock::Clock;
use crate::types::{
    Account, AccountId, AccountSnapshot, LedgerReason, LedgerRecord, Money, TxReference,
};

#[derive(Debug, Default)]
struct Journal {
    records: Vec<LedgerRecord>,
    by_reference: HashMap<TxReference, usize>,
    next_seq: u64,
}

impl Journal {
    fn from_records(records: Vec<LedgerRecord>) -> Self {
        let by_reference = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.reference.clone(), i))
            .collect();
        let next_seq = records.iter().map(|r| r.seq + 1).max().unwrap_or(1);
        Self {
            records,
            by_reference,
            next_seq,
        }
    }
}

pub struct InMemoryLedger {
    accounts: RwLock<HashMap<AccountId, Arc<Mutex<Account>>>>,
    journal: Mutex<Journal>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            journal: Mutex::new(Journal {
                next_seq: 1,
                ..Journal::default()
            }),
            clock,
        }
    }

    /// Rebuild a ledger from a persisted export.
    pub fn restore(export: LedgerExport, clock: Arc<dyn Clock>) -> Self {
        let accounts = export
            .accounts
            .into_iter()
            .map(|a| (a.account_id.clone(), Arc::new(Mutex::new(a))))
            .collect();
        Self {
            accounts: RwLock::new(accounts),
            journal: Mutex::new(Journal::from_records(export.journal)),
            clock,
        }
    }

    async fn slot(&self, account_id: &AccountId) -> Option<Arc<Mutex<Account>>> {
        self.accounts.read().await.get(account_id).cloned()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn open_account(&self, account_id: &AccountId) -> Result<AccountSnapshot, LedgerError> {
        if let Some(slot) = self.slot(account_id).await {
            return Ok(slot.lock().await.snapshot());
        }

        let mut accounts = self.accounts.write().await;
        let slot = accounts
            .entry(account_id.clone())
            .or_insert_with(|| {
                debug!(account_id = %account_id, "Opening account");
                Arc::new(Mutex::new(Account::new(account_id.clone(), self.clock.now())))
            })
            .clone();
        drop(accounts);

        let snapshot = slot.lock().await.snapshot();
        Ok(snapshot)
    }

    async fn apply_delta(&self, delta: LedgerDelta) -> Result<AccountSnapshot, LedgerError> {
        let slot = self
            .slot(&delta.account_id)
            .await
            .ok_or_else(|| LedgerError::UnknownAccount(delta.account_id.clone()))?;
        let mut account = slot.lock().await;

        // A replayed reference reports as a duplicate even if the balances
        // have since moved on.
        let mut journal = self.journal.lock().await;
        if journal.by_reference.contains_key(&delta.reference) {
            debug!(reference = %delta.reference, "Duplicate ledger reference");
            return Err(LedgerError::DuplicateReference(delta.reference));
        }

        let overflow = || LedgerError::Overflow(delta.account_id.clone());
        let available_after = account.available.checked_add(delta.available).ok_or_else(overflow)?;
        let locked_after = account.locked.checked_add(delta.locked).ok_or_else(overflow)?;

        if available_after.is_negative() || locked_after.is_negative() {
            warn!(
                account_id = %delta.account_id,
                reason = %delta.reason,
                available = %account.available,
                locked = %account.locked,
                available_delta = %delta.available,
                locked_delta = %delta.locked,
                "Rejected delta: would produce a negative balance"
            );
            return Err(LedgerError::InsufficientFunds {
                account_id: delta.account_id.clone(),
                available: account.available,
                locked: account.locked,
                available_delta: delta.available,
                locked_delta: delta.locked,
            });
        }

        // Audit counters are computed up front so a failure leaves nothing applied.
        let mut total_deposited = account.total_deposited;
        let mut total_withdrawn = account.total_withdrawn;
        match delta.reason {
            LedgerReason::Deposit if delta.available.is_positive() => {
                total_deposited = total_deposited.checked_add(delta.available).ok_or_else(overflow)?;
            }
            LedgerReason::Withdrawal if delta.available.is_negative() => {
                total_withdrawn = total_withdrawn.checked_add(-delta.available).ok_or_else(overflow)?;
            }
            _ => {}
        }

        let now = self.clock.now();
        let record = LedgerRecord {
            seq: journal.next_seq,
            account_id: delta.account_id.clone(),
            reason: delta.reason,
            reference: delta.reference.clone(),
            available_delta: delta.available,
            locked_delta: delta.locked,
            available_before: account.available,
            available_after,
            locked_before: account.locked,
            locked_after,
            at: now,
        };

        account.available = available_after;
        account.locked = locked_after;
        account.total_deposited = total_deposited;
        account.total_withdrawn = total_withdrawn;
        if delta.reason == LedgerReason::Withdrawal {
            account.last_withdrawal_at = Some(now);
        }

        debug!(record = %record, "Ledger record appended");
        let index = journal.records.len();
        journal.next_seq += 1;
        journal.by_reference.insert(delta.reference, index);
        journal.records.push(record);

        Ok(account.snapshot())
    }

    async fn snapshot(&self, account_id: &AccountId) -> Result<AccountSnapshot, LedgerError> {
        let slot = self
            .slot(account_id)
            .await
            .ok_or_else(|| LedgerError::UnknownAccount(account_id.clone()))?;
        let snapshot = slot.lock().await.snapshot();
        Ok(snapshot)
    }

    async fn journal(&self, account_id: &AccountId) -> Result<Vec<LedgerRecord>, LedgerError> {
        if self.slot(account_id).await.is_none() {
            return Err(LedgerError::UnknownAccount(account_id.clone()));
        }
        let journal = self.journal.lock().await;
        Ok(journal
            .records
            .iter()
            .filter(|r| &r.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn find_record(&self, reference: &TxReference) -> Result<Option<LedgerRecord>, LedgerError> {
        let journal = self.journal.lock().await;
        Ok(journal
            .by_reference
            .get(reference)
            .map(|&i| journal.records[i].clone()))
    }

    async fn export(&self) -> Result<LedgerExport, LedgerError> {
        let slots: Vec<Arc<Mutex<Account>>> = self.accounts.read().await.values().cloned().collect();

        // Hold every account lock while reading the journal so the export is
        // a consistent cut.
        let mut guards = Vec::with_capacity(slots.len());
        for slot in &slots {
            guards.push(slot.lock().await);
        }
        let journal = self.journal.lock().await;

        let mut accounts: Vec<Account> = guards.iter().map(|g| (**g).clone()).collect();
        accounts.sort_by(|a, b| a.account_id.cmp(&b.account_id));

        Ok(LedgerExport {
            accounts,
            journal: journal.records.clone(),
        })
    }
}

/// Sum of `available + locked` across every account in an export.
pub fn total_value(export: &LedgerExport) -> Money {
    export.accounts.iter().map(Account::total).sum()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
