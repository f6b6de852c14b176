//! Price oracle HTTP client.

use crate::error::PriceOracleError;
use crate::types::*;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_BACKOFF_MS: u64 = 5000;

/// Client for a USD price API keyed by asset id (token mint).
#[derive(Clone)]
pub struct PriceOracleClient {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl PriceOracleClient {
    /// Create a new price oracle client.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PriceOracleError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.map(SecretString::new),
        })
    }

    /// Fetch USD prices for the given asset ids.
    ///
    /// Ids the oracle does not know, or quotes that are not positive numbers,
    /// are left out of the result.
    #[instrument(skip(self), fields(count = ids.len()))]
    pub async fn prices(&self, ids: &[String]) -> Result<HashMap<String, f64>, PriceOracleError> {
        let mut request = self
            .client
            .get(format!("{}/price", self.base_url))
            .query(&[("ids", ids.join(","))]);

        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key.expose_secret());
        }

        let response = request.send().await?;
        let body = self.handle_response::<PriceResponse>(response).await?;

        let mut prices = HashMap::new();
        for (id, entry) in body.data {
            let Some(entry) = entry else {
                debug!("No price for {}", id);
                continue;
            };
            match entry.price.to_usd() {
                Some(price) => {
                    prices.insert(id, price);
                }
                None => {
                    let err = PriceOracleError::InvalidPrice {
                        id: id.clone(),
                        value: entry.price.to_string(),
                    };
                    warn!("{}", err);
                }
            }
        }

        Ok(prices)
    }

    /// Fetch prices with exponential backoff on transient failures.
    #[instrument(skip(self), fields(count = ids.len()))]
    pub async fn prices_with_retry(
        &self,
        ids: &[String],
        max_retries: Option<u32>,
    ) -> Result<HashMap<String, f64>, PriceOracleError> {
        let max_retries = max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let mut backoff_ms = DEFAULT_INITIAL_BACKOFF_MS;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                debug!("Retry attempt {} after {}ms backoff", attempt, backoff_ms);
                sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(DEFAULT_MAX_BACKOFF_MS);
            }

            match self.prices(ids).await {
                Ok(prices) => return Ok(prices),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!("Price request failed (attempt {}): {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(PriceOracleError::Api {
            status: 0,
            message: "Max retries exceeded".into(),
        }))
    }

    /// Health check - returns true if the API answers.
    pub async fn health_check(&self) -> bool {
        self.prices(&[]).await.is_ok()
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, PriceOracleError> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            debug!("Response body: {}", &body[..body.len().min(200)]);
            serde_json::from_str(&body).map_err(PriceOracleError::from)
        } else {
            Err(self.extract_error(response).await)
        }
    }

    async fn extract_error(&self, response: reqwest::Response) -> PriceOracleError {
        let status = response.status();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("Rate limit exceeded");
                PriceOracleError::RateLimit
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!("Authentication failed");
                PriceOracleError::Unauthorized
            }
            _ => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".into());
                PriceOracleError::Api {
                    status: status.as_u16(),
                    message,
                }
            }
        }
    }
}
