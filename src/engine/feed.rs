//! Match-result feed dispatch.
//!
//! `Started` locks the pool, `Finished` settles it and `Cancelled` voids it.
//! Feeds redeliver, so a repeated `Started` is acknowledged rather than
//! treated as an error, and `Finished`/`Cancelled` lock the pool first if the
//! `Started` event never arrived.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::settlement::{SettlementEngine, SettlementError, SettlementSummary};
use crate::odds::{OddsEngine, OddsError, OddsSnapshot};
use crate::types::{Classified, ErrorClass, MatchFeedEvent, MatchId, MatchStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FeedOutcome {
    Locked { snapshot: OddsSnapshot },
    Settled { summary: SettlementSummary },
    Voided { summary: SettlementSummary },
    /// Redelivered event with nothing left to do.
    Ignored { match_id: MatchId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error(transparent)]
    Odds(#[from] OddsError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

impl Classified for FeedError {
    fn class(&self) -> ErrorClass {
        match self {
            FeedError::Odds(e) => e.class(),
            FeedError::Settlement(e) => e.class(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            FeedError::Odds(e) => e.code(),
            FeedError::Settlement(e) => e.code(),
        }
    }
}

pub struct MatchFeed {
    odds: Arc<OddsEngine>,
    settlement: Arc<SettlementEngine>,
}

impl MatchFeed {
    pub fn new(odds: Arc<OddsEngine>, settlement: Arc<SettlementEngine>) -> Self {
        Self { odds, settlement }
    }

    pub async fn handle(&self, event: MatchFeedEvent) -> Result<FeedOutcome, FeedError> {
        debug!(match_id = %event.match_id(), event = ?event, "Feed event received");
        match event {
            MatchFeedEvent::Started { match_id } => match self.odds.freeze_and_lock(&match_id).await {
                Ok(snapshot) => Ok(FeedOutcome::Locked { snapshot }),
                Err(OddsError::AlreadyLocked { status, .. }) => {
                    info!(match_id = %match_id, status = %status, "Duplicate start event ignored");
                    Ok(FeedOutcome::Ignored {
                        match_id,
                        reason: format!("already {status}"),
                    })
                }
                Err(e) => Err(e.into()),
            },
            MatchFeedEvent::Finished {
                match_id,
                winning_outcome,
            } => {
                self.ensure_locked(&match_id).await?;
                let summary = self.settlement.settle(&match_id, &winning_outcome).await?;
                Ok(match summary.status {
                    MatchStatus::Voided => FeedOutcome::Voided { summary },
                    _ => FeedOutcome::Settled { summary },
                })
            }
            MatchFeedEvent::Cancelled { match_id } => {
                self.ensure_locked(&match_id).await?;
                let summary = self.settlement.void_match(&match_id).await?;
                Ok(FeedOutcome::Voided { summary })
            }
        }
    }

    /// Lock the pool if betting is still open. Any later state is left for
    /// the settlement engine to judge.
    async fn ensure_locked(&self, match_id: &MatchId) -> Result<(), FeedError> {
        match self.odds.freeze_and_lock(match_id).await {
            Ok(_) => {
                info!(match_id = %match_id, "Pool locked by result event");
                Ok(())
            }
            Err(OddsError::AlreadyLocked { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
