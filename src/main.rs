//! wager_ledger: betting ledger and settlement service.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the ledger and bet book from disk (or starts fresh), serves the
//! HTTP API and saves snapshots periodically with graceful shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use wager_ledger::api;
use wager_ledger::clock::{Clock, SystemClock};
use wager_ledger::config::{self, RailProvider};
use wager_ledger::engine::{Collaborators, Platform};
use wager_ledger::events::LedgerEvent;
use wager_ledger::rails::HttpPaymentRail;
use wager_ledger::risk::compliance::HttpComplianceOracle;
use wager_ledger::storage;

/// Longest wait for in-flight API requests at shutdown.
const API_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = config::AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging();

    let platform_cfg = cfg.platform_config()?;
    info!(
        treasury = %cfg.ledger.treasury_account,
        default_rake_bps = cfg.odds.default_rake_bps,
        payout_policy = ?cfg.settlement.payout_policy,
        rail = ?cfg.payment_rail.provider,
        compliance = cfg.compliance.enabled,
        "wager_ledger starting up"
    );

    // -- Restore or create state -----------------------------------------

    let snapshot_path = cfg.storage.snapshot_path.clone();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut parts = match storage::load_snapshot(Some(&snapshot_path))? {
        Some(snapshot) => {
            info!(saved_at = %snapshot.saved_at, "Resumed from saved snapshot");
            Collaborators::restore(snapshot, clock)
        }
        None => {
            info!("Fresh start");
            Collaborators::in_memory(clock)
        }
    };

    // -- External collaborators ------------------------------------------

    if cfg.payment_rail.provider == RailProvider::Http {
        let base_url = cfg
            .payment_rail
            .base_url
            .as_deref()
            .context("payment_rail.base_url is required for the http provider")?;
        let api_key = config::AppConfig::resolve_secret(cfg.payment_rail.api_key_env.as_deref())?;
        let rail = HttpPaymentRail::new(
            base_url,
            api_key,
            Duration::from_secs(cfg.payment_rail.timeout_secs),
        )?;
        info!(base_url, "Using HTTP payment rail");
        parts = parts.with_rail(Arc::new(rail));
    } else {
        warn!("Using instant in-process payment rail; no funds leave the ledger");
    }

    if cfg.compliance.enabled {
        let base_url = cfg
            .compliance
            .base_url
            .as_deref()
            .context("compliance.base_url is required when compliance is enabled")?;
        let api_key = config::AppConfig::resolve_secret(cfg.compliance.api_key_env.as_deref())?;
        let oracle = HttpComplianceOracle::new(
            base_url,
            api_key,
            Duration::from_secs(cfg.compliance.timeout_secs),
        )?;
        info!(base_url, "Compliance oracle enabled");
        parts = parts.with_compliance(Arc::new(oracle));
    }

    // -- Initialise platform ---------------------------------------------

    let platform = Arc::new(
        Platform::build(platform_cfg, parts)
            .await
            .context("Failed to open treasury account")?,
    );

    spawn_event_log(&platform);

    let (stop_api, api_shutdown) = watch::channel(false);
    let api_task = if cfg.api.enabled {
        Some(api::spawn_api(platform.clone(), cfg.api.port, api_shutdown).await?)
    } else {
        None
    };

    // -- Main loop --------------------------------------------------------

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.storage.save_interval_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        save_interval_secs = cfg.storage.save_interval_secs,
        "Ready. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = save(&platform, &snapshot_path).await {
                    error!(error = %e, "Failed to save snapshot");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // -- Shutdown ---------------------------------------------------------

    // Stop taking requests and let in-flight ones finish before the last save.
    let _ = stop_api.send(true);
    if let Some(task) = api_task {
        match tokio::time::timeout(API_DRAIN_TIMEOUT, task).await {
            Ok(Ok(())) => info!("API server stopped"),
            Ok(Err(e)) => error!(error = %e, "API server task failed"),
            Err(_) => warn!(
                timeout_secs = API_DRAIN_TIMEOUT.as_secs(),
                "API server did not drain in time, saving anyway"
            ),
        }
    }

    save(&platform, &snapshot_path).await?;
    info!(path = %snapshot_path, "Snapshot saved. Goodbye.");

    Ok(())
}

async fn save(platform: &Platform, path: &str) -> Result<()> {
    let snapshot = platform
        .export_snapshot()
        .await
        .context("Failed to export ledger")?;
    storage::save_snapshot(&snapshot, Some(path))
}

/// Log every ledger event. Stands in for the notification collaborator.
fn spawn_event_log(platform: &Platform) {
    let mut rx = platform.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event @ LedgerEvent::RiskReview { .. }) => {
                    info!(event = ?event, "Risk review requested");
                }
                Ok(event) => debug!(event = ?event, "Ledger event"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Initialise the tracing subscriber.
///
/// Uses JSON output if `WAGER_LOG_JSON` is set, otherwise human-readable.
/// Log level controlled by `RUST_LOG` env var (default: `wager_ledger=info`).
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wager_ledger=info"));

    let json_logging = std::env::var("WAGER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
