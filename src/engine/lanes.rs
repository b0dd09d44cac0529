//! Keyed admission lanes.
//!
//! A lane is a FIFO `tokio::sync::Mutex` per key. Processors hold an
//! account's lane from the risk gate until the ledger write completes, so a
//! user's own operations take effect in the order they were admitted.
//! Settlement uses the same structure keyed by match.
//!
//! A lane exists only while someone holds or waits for it; the last guard to
//! leave removes it, so the map stays as small as the set of busy keys.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::{AccountId, MatchId};

pub struct Lanes<K> {
    lanes: StdMutex<HashMap<K, Arc<Mutex<()>>>>,
}

pub type AccountLanes = Lanes<AccountId>;
pub type MatchLanes = Lanes<MatchId>;

impl<K: Eq + Hash + Clone> Lanes<K> {
    pub fn new() -> Self {
        Self {
            lanes: StdMutex::new(HashMap::new()),
        }
    }

    /// Wait for the lane of `key`. Waiters are served in arrival order.
    pub async fn enter(&self, key: &K) -> LaneGuard<'_, K> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            lanes.entry(key.clone()).or_default().clone()
        };
        LaneGuard {
            lanes: self,
            key: key.clone(),
            held: Some(lane.lock_owned().await),
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for Lanes<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a lane until dropped.
pub struct LaneGuard<'a, K: Eq + Hash> {
    lanes: &'a Lanes<K>,
    key: K,
    held: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for LaneGuard<'_, K> {
    fn drop(&mut self) {
        // Entries are cloned only under the map lock, so a count of one here
        // means nobody else holds or waits for this lane.
        let mut lanes = self.lanes.lanes.lock().unwrap_or_else(|e| e.into_inner());
        drop(self.held.take());
        if lanes.get(&self.key).is_some_and(|lane| Arc::strong_count(lane) == 1) {
            lanes.remove(&self.key);
        }
    }
}
