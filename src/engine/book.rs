//! Bet book: in-memory store of match pools and bets.
//!
//! Each pool and each bet sits behind its own `tokio::sync::Mutex`, so
//! placement, locking and settlement of one match never contend with
//! another. The outer maps are only write-locked to insert.
//!
//! Writes that touch both the ledger and the book (placing and resolving a
//! bet) hold the commit gate for reading across both halves. An export holds
//! it for writing, so it never sees a stake in the ledger without its bet or
//! a resolved bet whose ledger record is missing. The gate is taken before
//! any pool or bet lock and never while one is held.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::odds::MatchPool;
use crate::types::{Bet, BetId, MatchId};

pub type PoolSlot = Arc<Mutex<MatchPool>>;
pub type BetSlot = Arc<Mutex<Bet>>;

/// Serializable copy of the book, for snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookExport {
    pub pools: Vec<MatchPool>,
    pub bets: Vec<Bet>,
}

#[derive(Default)]
pub struct BetBook {
    pools: RwLock<HashMap<MatchId, PoolSlot>>,
    bets: RwLock<HashMap<BetId, BetSlot>>,
    commit_gate: RwLock<()>,
}

impl BetBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(export: BookExport) -> Self {
        let pools = export
            .pools
            .into_iter()
            .map(|p| (p.match_id.clone(), Arc::new(Mutex::new(p))))
            .collect();
        let bets = export
            .bets
            .into_iter()
            .map(|b| (b.bet_id, Arc::new(Mutex::new(b))))
            .collect();
        Self {
            pools: RwLock::new(pools),
            bets: RwLock::new(bets),
            commit_gate: RwLock::new(()),
        }
    }

    /// Shared hold for a write spanning the ledger and the book.
    pub async fn commit_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    /// Exclusive hold: waits for in-flight cross-store writes and blocks new
    /// ones until dropped.
    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit_gate.write().await
    }

    /// Register a new pool. Returns the id back if it is already taken.
    pub async fn insert_pool(&self, pool: MatchPool) -> Result<PoolSlot, MatchId> {
        let mut pools = self.pools.write().await;
        if pools.contains_key(&pool.match_id) {
            return Err(pool.match_id);
        }
        let match_id = pool.match_id.clone();
        let slot = Arc::new(Mutex::new(pool));
        pools.insert(match_id, slot.clone());
        Ok(slot)
    }

    pub async fn pool(&self, match_id: &MatchId) -> Option<PoolSlot> {
        self.pools.read().await.get(match_id).cloned()
    }

    pub async fn insert_bet(&self, bet: Bet) -> BetSlot {
        let bet_id = bet.bet_id;
        let slot = Arc::new(Mutex::new(bet));
        self.bets.write().await.insert(bet_id, slot.clone());
        slot
    }

    pub async fn bet(&self, bet_id: &BetId) -> Option<BetSlot> {
        self.bets.read().await.get(bet_id).cloned()
    }

    /// Current copies of the given bets, in the order requested. Unknown ids
    /// are skipped.
    pub async fn bets_for(&self, bet_ids: &[BetId]) -> Vec<Bet> {
        let slots: Vec<BetSlot> = {
            let bets = self.bets.read().await;
            bet_ids.iter().filter_map(|id| bets.get(id).cloned()).collect()
        };
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.clone());
        }
        out
    }

    pub async fn match_ids(&self) -> Vec<MatchId> {
        let mut ids: Vec<MatchId> = self.pools.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn export(&self) -> BookExport {
        let pool_slots: Vec<PoolSlot> = self.pools.read().await.values().cloned().collect();
        let bet_slots: Vec<BetSlot> = self.bets.read().await.values().cloned().collect();

        let mut pools = Vec::with_capacity(pool_slots.len());
        for slot in pool_slots {
            pools.push(slot.lock().await.clone());
        }
        pools.sort_by(|a, b| a.match_id.cmp(&b.match_id));

        let mut bets = Vec::with_capacity(bet_slots.len());
        for slot in bet_slots {
            bets.push(slot.lock().await.clone());
        }
        bets.sort_by(|a, b| a.placed_at.cmp(&b.placed_at).then(a.bet_id.cmp(&b.bet_id)));

        BookExport { pools, bets }
    }
}
