//! Swap venue HTTP client.

use crate::error::SwapVenueError;
use crate::types::*;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_BACKOFF_MS: u64 = 5000;

/// Client for a swap aggregator that quotes routes and builds unsigned swap
/// transactions for the user to sign.
#[derive(Clone)]
pub struct SwapVenueClient {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl SwapVenueClient {
    /// Create a new swap venue client.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SwapVenueError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.map(SecretString::new),
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("x-api-key", key.expose_secret()),
            None => request,
        }
    }

    /// Request a route quote.
    #[instrument(skip(self), fields(input = %request.input_mint, output = %request.output_mint))]
    pub async fn quote(&self, request: &QuoteRequest) -> Result<QuoteResponse, SwapVenueError> {
        let response = self
            .authorized(self.client.get(format!("{}/quote", self.base_url)))
            .query(request)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Request a quote with exponential backoff on transient failures.
    #[instrument(skip(self), fields(input = %request.input_mint, output = %request.output_mint))]
    pub async fn quote_with_retry(
        &self,
        request: &QuoteRequest,
        max_retries: Option<u32>,
    ) -> Result<QuoteResponse, SwapVenueError> {
        let max_retries = max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let mut backoff_ms = DEFAULT_INITIAL_BACKOFF_MS;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                debug!("Retry attempt {} after {}ms backoff", attempt, backoff_ms);
                sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(DEFAULT_MAX_BACKOFF_MS);
            }

            match self.quote(request).await {
                Ok(quote) => return Ok(quote),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!("Quote request failed (attempt {}): {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(SwapVenueError::Api {
            status: 0,
            message: "Max retries exceeded".into(),
        }))
    }

    /// Build the unsigned swap transaction for a quote.
    #[instrument(skip(self, quote))]
    pub async fn swap_transaction(
        &self,
        quote: QuoteResponse,
        user_public_key: &str,
    ) -> Result<SwapResponse, SwapVenueError> {
        let request = SwapRequest {
            quote_response: quote,
            user_public_key: user_public_key.to_string(),
            wrap_and_unwrap_sol: true,
            dynamic_compute_unit_limit: true,
        };

        let response = self
            .authorized(self.client.post(format!("{}/swap", self.base_url)))
            .json(&request)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Execution status of a submitted swap.
    #[instrument(skip(self))]
    pub async fn execution_status(&self, signature: &str) -> Result<ExecutionStatus, SwapVenueError> {
        let response = self
            .authorized(
                self.client
                    .get(format!("{}/status/{}", self.base_url, signature)),
            )
            .send()
            .await?;

        self.handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, SwapVenueError> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            debug!("Response body: {}", &body[..body.len().min(200)]);
            serde_json::from_str(&body).map_err(SwapVenueError::from)
        } else {
            Err(self.extract_error(response).await)
        }
    }

    async fn extract_error(&self, response: reqwest::Response) -> SwapVenueError {
        let status = response.status();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("Rate limit exceeded");
                SwapVenueError::RateLimit
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!("Authentication failed");
                SwapVenueError::Unauthorized
            }
            _ => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".into());
                if status == StatusCode::BAD_REQUEST && message.to_ascii_uppercase().contains("ROUTE") {
                    SwapVenueError::NoRoute(message)
                } else {
                    SwapVenueError::Api {
                        status: status.as_u16(),
                        message,
                    }
                }
            }
        }
    }
}
