//! Price oracle client errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PriceOracleError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Authentication failed")]
    Unauthorized,

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid price for {id}: {value}")]
    InvalidPrice { id: String, value: String },
}

impl PriceOracleError {
    /// Whether a retry may succeed (network hiccups, throttling, 5xx).
    pub fn is_retryable(&self) -> bool {
        match self {
            PriceOracleError::Http(_) | PriceOracleError::RateLimit => true,
            PriceOracleError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
