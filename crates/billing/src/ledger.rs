//! Buzz ledger client
//!
//! The ledger service owns every account balance. Billing only reads balances and
//! asks the ledger to move units between accounts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

/// Kind of account on the receiving side of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    User,
    Club,
}

/// Ledger transaction categories used by billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    ClubMembership,
}

/// A user's ledger balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub id: i32,
    pub balance: i64,
}

/// Request to move units between two ledger accounts
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub from_account_id: i32,
    pub to_account_id: i32,
    pub to_account_type: AccountType,
    pub amount: i64,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_transaction_id: Option<String>,
}

/// Ledger acknowledgement of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReceipt {
    pub transaction_id: String,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Look up a user's account, `None` if the ledger has never seen the user
    async fn get_account(&self, user_id: i32) -> BillingResult<Option<LedgerAccount>>;

    /// Move units between accounts
    async fn create_transfer(&self, transfer: &TransferRequest) -> BillingResult<TransferReceipt>;
}

/// Ledger service configuration
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub endpoint: String,
    /// Extra attempts for account reads. Transfers are never retried.
    pub max_retries: usize,
}

impl LedgerConfig {
    pub fn from_env() -> BillingResult<Self> {
        let endpoint = std::env::var("BUZZ_ENDPOINT")
            .map_err(|_| BillingError::Config("BUZZ_ENDPOINT not set".to_string()))?;
        let max_retries = std::env::var("BUZZ_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            max_retries,
        })
    }
}

/// HTTP client for the buzz ledger service
#[derive(Clone)]
pub struct HttpLedgerClient {
    http: reqwest::Client,
    config: LedgerConfig,
}

impl HttpLedgerClient {
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: LedgerConfig) -> Self {
        Self { http, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(LedgerConfig::from_env()?))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint, path)
    }

    async fn fetch_account(&self, user_id: i32) -> BillingResult<Option<LedgerAccount>> {
        let response = self
            .http
            .get(self.url(&format!("/account/{}", user_id)))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<LedgerAccount>().await?)),
            status => Err(BillingError::Ledger(format!(
                "Account lookup for user {} failed with status {}",
                user_id, status
            ))),
        }
    }
}

#[async_trait]
impl Ledger for HttpLedgerClient {
    async fn get_account(&self, user_id: i32) -> BillingResult<Option<LedgerAccount>> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(50)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.config.max_retries);

        RetryIf::spawn(
            strategy,
            || self.fetch_account(user_id),
            |e: &BillingError| {
                if e.is_transient() {
                    tracing::warn!(user_id = user_id, error = %e, "Retrying ledger account lookup");
                    true
                } else {
                    false
                }
            },
        )
        .await
    }

    async fn create_transfer(&self, transfer: &TransferRequest) -> BillingResult<TransferReceipt> {
        let response = self
            .http
            .post(self.url("/transaction"))
            .json(transfer)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let receipt = response.json::<TransferReceipt>().await?;
            tracing::info!(
                from_account_id = transfer.from_account_id,
                to_account_id = transfer.to_account_id,
                amount = transfer.amount,
                transaction_id = %receipt.transaction_id,
                "Ledger transfer created"
            );
            return Ok(receipt);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::BAD_REQUEST => Err(BillingError::InvalidInput(body)),
            StatusCode::CONFLICT => Err(BillingError::InsufficientFunds),
            _ => Err(BillingError::Ledger(format!(
                "Transfer failed with status {}: {}",
                status, body
            ))),
        }
    }
}
