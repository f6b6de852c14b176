//! Application error types.

use thiserror::Error;

/// Main application error type.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Gift pipeline error: {0}")]
    Gift(#[from] gift_escrow::GiftError),

    #[error("Price oracle error: {0}")]
    PriceOracle(#[from] price_oracle_client::PriceOracleError),

    #[error("Swap venue error: {0}")]
    SwapVenue(#[from] swap_venue_client::SwapVenueError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for application errors.
pub type AppResult<T> = Result<T, AppError>;
