//! Fiat onramp.
//!
//! The onramp runs its purchase flow outside this system and eventually
//! deposits the funding asset into the sender's wallet. We only build the
//! hosted purchase URL and ask for status by our own reference.

use crate::config::OnrampConfig;
use crate::error::GiftError;
use crate::pricing::MICRO_USD;
use crate::types::Asset;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, instrument};

/// Purchase status as reported by the onramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnrampStatus {
    /// Not started, or not known to the provider yet.
    Pending,
    Completed,
    Failed,
}

#[async_trait]
pub trait Onramp: Send + Sync {
    /// Hosted purchase URL depositing `usd_amount` (micro-USD) of `asset`
    /// into `wallet`, tagged with `reference`.
    fn funding_url(
        &self,
        wallet: &str,
        asset: &Asset,
        usd_amount: u64,
        reference: &str,
    ) -> Result<String, GiftError>;

    /// Status of the purchase tagged with `reference`.
    async fn status(&self, reference: &str) -> Result<OnrampStatus, GiftError>;
}

/// Onramp provider over HTTP.
pub struct HttpOnramp {
    client: Client,
    config: OnrampConfig,
}

#[derive(Debug, Deserialize)]
struct OnrampTransaction {
    status: String,
}

impl HttpOnramp {
    pub fn new(config: OnrampConfig) -> Result<Self, GiftError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GiftError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }
}

/// `50_000_000` micro-USD -> `"50.00"`, rounded up to the cent.
fn usd_decimal(micro_usd: u64) -> String {
    let cents = micro_usd.div_ceil(MICRO_USD / 100);
    format!("{}.{:02}", cents / 100, cents % 100)
}

#[async_trait]
impl Onramp for HttpOnramp {
    fn funding_url(
        &self,
        wallet: &str,
        asset: &Asset,
        usd_amount: u64,
        reference: &str,
    ) -> Result<String, GiftError> {
        let mut params = vec![
            ("currencyCode", format!("{}_sol", asset.symbol.to_lowercase())),
            ("walletAddress", wallet.to_string()),
            ("baseCurrencyCode", "usd".to_string()),
            ("baseCurrencyAmount", usd_decimal(usd_amount)),
            ("externalTransactionId", reference.to_string()),
        ];
        if asset.is_native() {
            params[0].1 = "sol".to_string();
        }
        if let Some(key) = &self.config.public_key {
            params.insert(0, ("apiKey", key.clone()));
        }

        let url = Url::parse_with_params(&self.config.widget_url, &params)
            .map_err(|e| GiftError::Config(format!("Invalid onramp widget URL: {}", e)))?;
        Ok(url.to_string())
    }

    #[instrument(skip(self))]
    async fn status(&self, reference: &str) -> Result<OnrampStatus, GiftError> {
        let url = format!(
            "{}/v1/transactions/ext/{}",
            self.config.api_url.trim_end_matches('/'),
            reference
        );

        let mut request = self.client.get(&url);
        if let Some(key) = &self.config.secret_key {
            request = request.header("Authorization", format!("Api-Key {}", key.expose_secret()));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            debug!("Onramp has no transaction for {} yet", reference);
            return Ok(OnrampStatus::Pending);
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(GiftError::NetworkError(format!("Onramp returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GiftError::Provider(format!("Onramp returned {}: {}", status, body)));
        }

        let transactions: Vec<OnrampTransaction> = response
            .json()
            .await
            .map_err(|e| GiftError::Provider(format!("Invalid onramp response: {}", e)))?;

        let statuses = transactions.iter().map(|t| t.status.as_str());
        Ok(if statuses.clone().any(|s| s == "completed") {
            OnrampStatus::Completed
        } else if !transactions.is_empty() && statuses.clone().all(|s| s == "failed") {
            OnrampStatus::Failed
        } else {
            OnrampStatus::Pending
        })
    }
}
