//! API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<Platform>`.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::engine::{
    BetError, DepositError, FeedError, FeedOutcome, Platform, SettlementError, SettlementSummary,
    WithdrawalError,
};
use crate::ledger::LedgerError;
use crate::odds::{MatchPool, OddsBoard, OddsError, OddsSnapshot};
use crate::types::{
    AccountId, AccountSnapshot, Bet, BetId, BetRequest, Classified, DepositRequest, ErrorClass,
    LedgerRecord, MatchFeedEvent, MatchId, OpenMatchRequest, Receipt, SettleRequest,
    WithdrawalRequest,
};

pub type AppState = Arc<Platform>;

/// Optional request header carrying a client idempotency key for deposits
/// and withdrawals.
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Rejection body: stable code, error class and readable reason.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: &'static str,
    pub class: ErrorClass,
    pub reason: String,
}

impl ApiError {
    pub fn from_classified<E: Classified>(err: &E) -> Self {
        let code = err.code();
        let class = err.class();
        Self {
            status: status_for(class, code),
            code,
            class,
            reason: err.to_string(),
        }
    }
}

fn status_for(class: ErrorClass, code: &str) -> StatusCode {
    if matches!(
        code,
        "unknown_account" | "match_not_found" | "bet_not_found"
    ) {
        return StatusCode::NOT_FOUND;
    }
    match class {
        ErrorClass::Validation => StatusCode::BAD_REQUEST,
        ErrorClass::Policy => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorClass::Concurrency => StatusCode::CONFLICT,
        ErrorClass::Integrity => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorClass::External => StatusCode::SERVICE_UNAVAILABLE,
    }
}

macro_rules! from_classified {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for ApiError {
                fn from(e: $err) -> Self {
                    ApiError::from_classified(&e)
                }
            }
        )*
    };
}

from_classified!(
    LedgerError,
    DepositError,
    WithdrawalError,
    BetError,
    OddsError,
    SettlementError,
    FeedError,
);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.class == ErrorClass::Integrity {
            warn!(code = self.code, reason = %self.reason, "Integrity error returned to caller");
        }
        (self.status, Json(self)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// GET /api/accounts/:id
pub async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<AccountSnapshot> {
    Ok(Json(state.account_snapshot(&AccountId::new(id)).await?))
}

/// GET /api/accounts/:id/journal
pub async fn get_journal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<LedgerRecord>> {
    Ok(Json(state.journal(&AccountId::new(id)).await?))
}

/// POST /api/accounts/:id/deposits
pub async fn post_deposit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<DepositRequest>,
) -> ApiResult<Receipt> {
    let key = idempotency_key(&headers)?;
    Ok(Json(
        state
            .deposit_with_key(&AccountId::new(id), req.amount, key)
            .await?,
    ))
}

/// POST /api/accounts/:id/withdrawals
pub async fn post_withdrawal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<WithdrawalRequest>,
) -> ApiResult<Receipt> {
    let key = idempotency_key(&headers)?;
    Ok(Json(
        state
            .withdraw_with_key(&AccountId::new(id), req.amount, key)
            .await?,
    ))
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<&str>, ApiError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY) else {
        return Ok(None);
    };
    match value.to_str().map(str::trim) {
        Ok(key) if !key.is_empty() && key.len() <= 200 => Ok(Some(key)),
        _ => Err(ApiError {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_idempotency_key",
            class: ErrorClass::Validation,
            reason: "Idempotency-Key must be 1-200 visible ASCII characters".into(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Matches and bets
// ---------------------------------------------------------------------------

/// POST /api/matches
pub async fn post_match(
    State(state): State<AppState>,
    Json(req): Json<OpenMatchRequest>,
) -> ApiResult<MatchPool> {
    Ok(Json(state.open_match(req).await?))
}

/// GET /api/matches/:id/odds
pub async fn get_odds(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<OddsBoard> {
    Ok(Json(state.odds_board(&MatchId::new(id)).await?))
}

/// POST /api/matches/:id/bets
pub async fn post_bet(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<BetRequest>,
) -> ApiResult<Bet> {
    Ok(Json(state.place_bet(&MatchId::new(id), &req).await?))
}

/// POST /api/matches/:id/lock
pub async fn post_lock(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<OddsSnapshot> {
    Ok(Json(state.freeze_and_lock(&MatchId::new(id)).await?))
}

/// POST /api/matches/:id/void
pub async fn post_void(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SettlementSummary> {
    Ok(Json(state.void_match(&MatchId::new(id)).await?))
}

/// GET /api/bets/:id
pub async fn get_bet(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Bet> {
    let bet_id = BetId(id);
    match state.bet(&bet_id).await {
        Some(bet) => Ok(Json(bet)),
        None => Err(BetError::BetNotFound(bet_id).into()),
    }
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// POST /api/settlements
pub async fn post_settlement(
    State(state): State<AppState>,
    Json(req): Json<SettleRequest>,
) -> ApiResult<SettlementSummary> {
    Ok(Json(state.settle(&req.match_id, &req.winning_outcome).await?))
}

/// POST /api/feed
pub async fn post_feed_event(
    State(state): State<AppState>,
    Json(event): Json<MatchFeedEvent>,
) -> ApiResult<FeedOutcome> {
    Ok(Json(state.handle_feed_event(event).await?))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
