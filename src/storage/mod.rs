//! Persistence layer.
//!
//! Saves and loads a full platform snapshot (ledger accounts, journal, match
//! pools and bets) to/from a JSON file. Writes go to a temporary file that is
//! renamed into place, so a crash mid-save never leaves a truncated snapshot.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::engine::book::BookExport;
use crate::ledger::LedgerExport;
use crate::types::{AccountId, BetStatus, Money};

/// Default snapshot file path.
pub const DEFAULT_SNAPSHOT_FILE: &str = "wager_ledger_state.json";

/// Bumped when the snapshot layout changes incompatibly.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub ledger: LedgerExport,
    pub book: BookExport,
}

impl PlatformSnapshot {
    pub fn new(ledger: LedgerExport, book: BookExport, saved_at: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at,
            ledger,
            book,
        }
    }

    /// Replay the journal and compare with stored balances, then compare each
    /// locked balance with the stakes of that account's open bets. Returns
    /// one line per disagreement.
    pub fn reconcile(&self) -> Vec<String> {
        let mut replayed: HashMap<&AccountId, (Money, Money)> = HashMap::new();
        for record in &self.ledger.journal {
            let entry = replayed.entry(&record.account_id).or_default();
            entry.0 += record.available_delta;
            entry.1 += record.locked_delta;
        }

        let mut problems = Vec::new();
        for account in &self.ledger.accounts {
            let (available, locked) = replayed
                .get(&account.account_id)
                .copied()
                .unwrap_or_default();
            if available != account.available || locked != account.locked {
                problems.push(format!(
                    "{}: stored available={} locked={}, journal says available={} locked={}",
                    account.account_id, account.available, account.locked, available, locked
                ));
            }
            if account.available.is_negative() || account.locked.is_negative() {
                problems.push(format!("{}: negative balance", account.account_id));
            }
        }

        let mut open_stakes: HashMap<&AccountId, Money> = HashMap::new();
        for bet in self.book.bets.iter().filter(|b| b.status == BetStatus::Open) {
            *open_stakes.entry(&bet.account_id).or_default() += bet.stake;
        }
        for account in &self.ledger.accounts {
            let staked = open_stakes.remove(&account.account_id).unwrap_or_default();
            if staked != account.locked {
                problems.push(format!(
                    "{}: locked={} but open bets stake {}",
                    account.account_id, account.locked, staked
                ));
            }
        }
        for (account_id, staked) in open_stakes {
            problems.push(format!("{account_id}: open bets stake {staked} on an unknown account"));
        }
        problems
    }
}

/// Save a snapshot to a JSON file.
pub fn save_snapshot(snapshot: &PlatformSnapshot, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_SNAPSHOT_FILE);
    let json = serde_json::to_string_pretty(snapshot).context("Failed to serialise snapshot")?;

    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).context(format!("Failed to write snapshot to {tmp}"))?;
    std::fs::rename(&tmp, path).context(format!("Failed to move snapshot into {path}"))?;

    debug!(
        path,
        accounts = snapshot.ledger.accounts.len(),
        records = snapshot.ledger.journal.len(),
        "Snapshot saved"
    );
    Ok(())
}

/// Load a snapshot from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_snapshot(path: Option<&str>) -> Result<Option<PlatformSnapshot>> {
    let path = path.unwrap_or(DEFAULT_SNAPSHOT_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved snapshot found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path).context(format!("Failed to read snapshot from {path}"))?;
    let snapshot: PlatformSnapshot =
        serde_json::from_str(&json).context(format!("Failed to parse snapshot from {path}"))?;

    if snapshot.version != SNAPSHOT_VERSION {
        anyhow::bail!(
            "Snapshot {path} has version {}, expected {SNAPSHOT_VERSION}",
            snapshot.version
        );
    }

    let problems = snapshot.reconcile();
    for p in &problems {
        warn!(path, problem = %p, "Snapshot does not reconcile");
    }

    info!(
        path,
        saved_at = %snapshot.saved_at,
        accounts = snapshot.ledger.accounts.len(),
        records = snapshot.ledger.journal.len(),
        matches = snapshot.book.pools.len(),
        bets = snapshot.book.bets.len(),
        "Snapshot loaded from disk"
    );

    Ok(Some(snapshot))
}

/// Delete the snapshot file (for testing or reset).
pub fn delete_snapshot(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_SNAPSHOT_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).context(format!("Failed to delete snapshot file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
