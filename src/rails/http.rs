//! HTTP payment-rail client.
//!
//! Talks to a custody service exposing `POST /v1/transfers/{in|out}`. The
//! ledger reference is sent as the `Idempotency-Key` header; the service
//! returns the original receipt when it sees a key twice.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{Direction, PaymentRail, RailError, RailReceipt};
use crate::types::{AccountId, Money, TxReference};

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    account_id: &'a str,
    /// Minor units.
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    rail_reference: String,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
}

pub struct HttpPaymentRail {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpPaymentRail {
    pub fn new(base_url: &str, api_key: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build payment rail HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn transfer_url(&self, direction: Direction) -> String {
        format!("{}/v1/transfers/{}", self.base_url, direction)
    }

    async fn transfer(
        &self,
        direction: Direction,
        key: &TxReference,
        account_id: &AccountId,
        amount: Money,
    ) -> Result<RailReceipt, RailError> {
        let body = TransferRequest {
            account_id: account_id.as_str(),
            amount: amount.as_minor(),
        };
        let mut req = self
            .http
            .post(self.transfer_url(direction))
            .header("Idempotency-Key", urlencoding::encode(key.as_str()).into_owned())
            .json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                RailError::Timeout
            } else {
                RailError::Unavailable(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: TransferResponse = resp
            .json()
            .await
            .map_err(|e| RailError::Unavailable(format!("bad rail response: {e}")))?;

        debug!(
            direction = %direction,
            key = %key,
            rail_reference = %parsed.rail_reference,
            "Rail transfer confirmed"
        );

        Ok(RailReceipt {
            rail_reference: parsed.rail_reference,
            key: key.clone(),
            amount,
            at: parsed.completed_at.unwrap_or_else(Utc::now),
        })
    }
}

/// 429 and 5xx are transient; any other failure status is a refusal.
fn classify_status(status: StatusCode, body: String) -> RailError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        RailError::Unavailable(format!("HTTP {status}: {body}"))
    } else if status == StatusCode::REQUEST_TIMEOUT {
        RailError::Timeout
    } else {
        RailError::Rejected(format!("HTTP {status}: {body}"))
    }
}

#[async_trait]
impl PaymentRail for HttpPaymentRail {
    async fn transfer_in(
        &self,
        key: &TxReference,
        account_id: &AccountId,
        amount: Money,
    ) -> Result<RailReceipt, RailError> {
        self.transfer(Direction::In, key, account_id, amount).await
    }

    async fn transfer_out(
        &self,
        key: &TxReference,
        account_id: &AccountId,
        amount: Money,
    ) -> Result<RailReceipt, RailError> {
        self.transfer(Direction::Out, key, account_id, amount).await
    }

    fn name(&self) -> &str {
        "http"
    }
}
