//! Compliance verdict collaborator.
//!
//! The risk evaluator consults a `ComplianceOracle` for large transactions.
//! KYC itself happens elsewhere; this module only asks for the verdict.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::types::{AccountId, Money, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceVerdict {
    Compliant,
    Pending,
    Rejected,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComplianceOracle: Send + Sync {
    async fn verdict(
        &self,
        account_id: &AccountId,
        amount: Money,
        operation: Operation,
    ) -> Result<ComplianceVerdict>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct VerdictResponse {
    verdict: ComplianceVerdict,
}

/// Queries `GET {base_url}/v1/verdicts/{account}?amount=..&operation=..`.
pub struct HttpComplianceOracle {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpComplianceOracle {
    pub fn new(base_url: &str, api_key: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build compliance HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn verdict_url(&self, account_id: &AccountId) -> String {
        format!(
            "{}/v1/verdicts/{}",
            self.base_url,
            urlencoding::encode(account_id.as_str())
        )
    }
}

#[async_trait]
impl ComplianceOracle for HttpComplianceOracle {
    async fn verdict(
        &self,
        account_id: &AccountId,
        amount: Money,
        operation: Operation,
    ) -> Result<ComplianceVerdict> {
        let mut req = self.http.get(self.verdict_url(account_id)).query(&[
            ("amount", amount.as_minor().to_string()),
            ("operation", operation.to_string()),
        ]);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req
            .send()
            .await
            .context("Compliance request failed")?
            .error_for_status()
            .context("Compliance service returned an error status")?;
        let body: VerdictResponse = resp
            .json()
            .await
            .context("Failed to parse compliance verdict")?;

        debug!(account_id = %account_id, verdict = ?body.verdict, "Compliance verdict");
        Ok(body.verdict)
    }
}
