//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Amounts are written as decimal native units (`"0.1"`) and converted to
//! minor units here. Secrets (rail and compliance API keys) are referenced by
//! env-var name in the config and resolved at runtime into `SecretString`.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::engine::{
    DepositConfig, PayoutPolicy, PlatformConfig, RetryPolicy, SettlementConfig, WithdrawalConfig,
};
use crate::rails::RailPolicy;
use crate::risk::RiskConfig;
use crate::types::{AccountId, Money};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub ledger: LedgerConfig,
    pub odds: OddsConfig,
    pub settlement: SettlementTable,
    pub risk: RiskTable,
    pub payment_rail: PaymentRailConfig,
    pub compliance: ComplianceConfig,
    pub api: ApiConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Native units, e.g. `"0.1"`.
    pub min_deposit: String,
    pub withdrawal_cooldown_hours: i64,
    pub treasury_account: String,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Attempts at the ledger write that follows a completed rail transfer.
    #[serde(default = "default_commit_attempts")]
    pub commit_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OddsConfig {
    /// Rake in basis points for matches opened without one.
    pub default_rake_bps: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SettlementTable {
    #[serde(default)]
    pub payout_policy: PayoutPolicy,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskTable {
    pub review_score: u8,
    pub block_score: u8,
    pub velocity_window_secs: i64,
    pub velocity_limit: usize,
    pub large_amount: String,
    pub compliance_threshold: String,
    pub new_account_age_secs: i64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RailProvider {
    /// In-process rail that completes every transfer immediately.
    Instant,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentRailConfig {
    pub provider: RailProvider,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    #[serde(default = "default_rail_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ComplianceConfig {
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub snapshot_path: String,
    pub save_interval_secs: u64,
}

fn default_event_capacity() -> usize {
    1024
}

fn default_commit_attempts() -> u32 {
    8
}

fn default_rail_max_backoff_ms() -> u64 {
    crate::rails::MAX_BACKOFF_MS
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        // Surface bad amounts at startup rather than on first use.
        config.platform_config()?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Resolve an optional secret reference. A configured but unset variable
    /// is an error; no reference means no secret.
    pub fn resolve_secret(env_name: Option<&str>) -> Result<Option<SecretString>> {
        env_name
            .map(|name| Self::resolve_env(name).map(SecretString::new))
            .transpose()
    }

    /// Build the component tunables.
    pub fn platform_config(&self) -> Result<PlatformConfig> {
        // Ledger writes after a rail transfer share the settlement backoff.
        let commit_retry = RetryPolicy {
            max_attempts: Some(self.ledger.commit_attempts.max(1)),
            base_backoff: Duration::from_millis(self.settlement.base_backoff_ms),
            max_backoff: Duration::from_millis(self.settlement.max_backoff_ms),
            attempt_timeout: Duration::from_millis(self.settlement.attempt_timeout_ms),
        };
        Ok(PlatformConfig {
            deposit: DepositConfig {
                min_deposit: parse_amount("ledger.min_deposit", &self.ledger.min_deposit)?,
                commit_retry: commit_retry.clone(),
            },
            withdrawal: WithdrawalConfig {
                cooldown: chrono::Duration::hours(self.ledger.withdrawal_cooldown_hours),
                commit_retry,
            },
            settlement: SettlementConfig {
                policy: self.settlement.payout_policy,
                base_backoff: Duration::from_millis(self.settlement.base_backoff_ms),
                max_backoff: Duration::from_millis(self.settlement.max_backoff_ms),
                attempt_timeout: Duration::from_millis(self.settlement.attempt_timeout_ms),
                treasury: AccountId::new(self.ledger.treasury_account.clone()),
            },
            risk: RiskConfig {
                review_score: self.risk.review_score,
                block_score: self.risk.block_score,
                velocity_window: chrono::Duration::seconds(self.risk.velocity_window_secs),
                velocity_limit: self.risk.velocity_limit,
                large_amount: parse_amount("risk.large_amount", &self.risk.large_amount)?,
                compliance_threshold: parse_amount(
                    "risk.compliance_threshold",
                    &self.risk.compliance_threshold,
                )?,
                new_account_age: chrono::Duration::seconds(self.risk.new_account_age_secs),
            },
            rail_policy: RailPolicy {
                max_attempts: self.payment_rail.max_attempts.max(1),
                base_backoff: Duration::from_millis(self.payment_rail.base_backoff_ms),
                max_backoff: Duration::from_millis(self.payment_rail.max_backoff_ms),
                attempt_timeout: Duration::from_secs(self.payment_rail.timeout_secs),
            },
            default_rake_bps: self.odds.default_rake_bps,
            event_capacity: self.ledger.event_capacity,
        })
    }
}

fn parse_amount(field: &str, raw: &str) -> Result<Money> {
    let amount = Money::parse_units(raw)
        .with_context(|| format!("{field}: '{raw}' is not a valid amount"))?;
    anyhow::ensure!(!amount.is_negative(), "{field}: amount must not be negative");
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const SAMPLE: &str = r#"
        [ledger]
        min_deposit = "0.1"
        withdrawal_cooldown_hours = 24
        treasury_account = "treasury"

        [odds]
        default_rake_bps = 500

        [settlement]
        payout_policy = "parimutuel"
        base_backoff_ms = 100
        max_backoff_ms = 30000
        attempt_timeout_ms = 5000

        [risk]
        review_score = 50
        block_score = 80
        velocity_window_secs = 600
        velocity_limit = 10
        large_amount = "1000"
        compliance_threshold = "500"
        new_account_age_secs = 3600

        [payment_rail]
        provider = "instant"
        timeout_secs = 10
        max_attempts = 3
        base_backoff_ms = 200

        [compliance]
        enabled = false
        timeout_secs = 5

        [api]
        enabled = true
        port = 8080

        [storage]
        snapshot_path = "wager_ledger_state.json"
        save_interval_secs = 60
    "#;

    #[test]
    fn test_parse_sample() {
        let cfg = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.payment_rail.provider, RailProvider::Instant);
        assert_eq!(cfg.ledger.event_capacity, 1024);

        let platform = cfg.platform_config().unwrap();
        assert_eq!(platform.deposit.min_deposit, Money::parse_units("0.1").unwrap());
        assert_eq!(platform.withdrawal.cooldown, chrono::Duration::hours(24));
        assert_eq!(platform.settlement.policy, PayoutPolicy::Parimutuel);
        assert_eq!(platform.settlement.treasury, AccountId::new("treasury"));
        assert_eq!(platform.risk.large_amount, Money::from_units(1_000));
        assert_eq!(platform.default_rake_bps, 500);
        assert_eq!(platform.withdrawal.commit_retry.max_attempts, Some(8));
        assert_eq!(platform.deposit.commit_retry.max_backoff, Duration::from_millis(30000));
        assert_eq!(platform.rail_policy.max_backoff, Duration::from_millis(10_000));
    }

    #[test]
    fn test_fixed_policy_parses() {
        let toml = SAMPLE.replace("\"parimutuel\"", "\"fixed_at_placement\"");
        let cfg = AppConfig::parse(&toml).unwrap();
        assert_eq!(cfg.settlement.payout_policy, PayoutPolicy::FixedAtPlacement);
    }

    #[test]
    fn test_bad_amount_rejected() {
        let toml = SAMPLE.replace("min_deposit = \"0.1\"", "min_deposit = \"lots\"");
        let err = AppConfig::parse(&toml).unwrap_err();
        assert!(format!("{err:#}").contains("ledger.min_deposit"));
    }

    #[test]
    fn test_resolve_secret() {
        assert!(AppConfig::resolve_secret(None).unwrap().is_none());
        assert!(AppConfig::resolve_secret(Some("WAGER_TEST_UNSET_SECRET_VAR")).is_err());

        std::env::set_var("WAGER_TEST_RAIL_KEY", "s3cret");
        let secret = AppConfig::resolve_secret(Some("WAGER_TEST_RAIL_KEY"))
            .unwrap()
            .unwrap();
        assert_eq!(secret.expose_secret(), "s3cret");
    }

    #[test]
    fn test_load_config() {
        // Requires config.toml in the working directory.
        if let Ok(cfg) = AppConfig::load("config.toml") {
            assert!(cfg.odds.default_rake_bps < crate::odds::BPS_DENOMINATOR);
            assert!(cfg.storage.save_interval_secs > 0);
        }
    }
}
