//! Swap venue client errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwapVenueError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Authentication failed")]
    Unauthorized,

    #[error("No route found: {0}")]
    NoRoute(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid amount in venue response: {0}")]
    InvalidAmount(String),
}

impl SwapVenueError {
    /// Whether a retry may succeed (network hiccups, throttling, 5xx).
    pub fn is_retryable(&self) -> bool {
        match self {
            SwapVenueError::Http(_) | SwapVenueError::RateLimit => true,
            SwapVenueError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
