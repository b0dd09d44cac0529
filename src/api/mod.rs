//! HTTP API: Axum server exposing the platform operations as JSON endpoints.
//!
//! Money travels as integer minor units. Rejections carry
//! `{ code, class, reason }` with a status chosen by error class.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use routes::AppState;

/// Bind the API port and serve in a background task until `shutdown` flips
/// to `true`.
///
/// Returns once the listener is bound, so a port clash fails startup. The
/// returned handle completes after in-flight requests have drained.
pub async fn spawn_api(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API port {port}"))?;
    info!(port, "API server listening on http://localhost:{port}");

    let handle = tokio::spawn(async move {
        let stop = async move {
            // A dropped sender also stops the server.
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("API server draining");
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
            error!(error = %e, "API server error");
        }
    });

    Ok(handle)
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static(routes::IDEMPOTENCY_KEY),
        ]);

    Router::new()
        // Accounts
        .route("/api/accounts/:id", get(routes::get_account))
        .route("/api/accounts/:id/journal", get(routes::get_journal))
        .route("/api/accounts/:id/deposits", post(routes::post_deposit))
        .route("/api/accounts/:id/withdrawals", post(routes::post_withdrawal))
        // Matches and bets
        .route("/api/matches", post(routes::post_match))
        .route("/api/matches/:id/odds", get(routes::get_odds))
        .route("/api/matches/:id/bets", post(routes::post_bet))
        .route("/api/matches/:id/lock", post(routes::post_lock))
        .route("/api/matches/:id/void", post(routes::post_void))
        .route("/api/bets/:id", get(routes::get_bet))
        // Settlement
        .route("/api/settlements", post(routes::post_settlement))
        .route("/api/feed", post(routes::post_feed_event))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
