//! Gift pipeline error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use price_oracle_client::PriceOracleError;
use serde::Serialize;
use swap_venue_client::SwapVenueError;
use thiserror::Error;

/// Errors that can occur anywhere in the gift pipeline.
#[derive(Error, Debug)]
pub enum GiftError {
    /// No price for an asset from the oracle, the cache or the registry defaults.
    #[error("Price unavailable for {0}")]
    PriceUnavailable(String),

    /// Funding never arrived within the detector's attempt budget.
    #[error("Funding not detected after {attempts} attempts")]
    FundingTimeout { attempts: u32 },

    /// A swap leg was rejected or never confirmed.
    #[error("Swap leg {leg} ({asset}) failed: {reason}")]
    SwapLegFailed {
        leg: u32,
        asset: String,
        reason: String,
    },

    /// The sender wallet cannot cover the expected deposit.
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },

    /// An escrow funding transfer failed or never confirmed.
    #[error("Escrow funding failed: {0}")]
    EscrowFundingFailed(String),

    /// The signature is already recorded against another leg.
    #[error("Signature already used: {0}")]
    SignatureReused(String),

    /// A confirmed transfer did not leave the escrow holding what the leg requires.
    #[error("Transfer does not match the leg: {0}")]
    TransferMismatch(String),

    /// Claim token does not resolve to a claimable gift.
    #[error("Claim not found")]
    ClaimNotFound,

    /// The gift was already claimed (or a claim is being settled).
    #[error("Gift already claimed")]
    AlreadyClaimed,

    /// The gift went unclaimed and was returned to the sender.
    #[error("Gift already refunded")]
    AlreadyRefunded,

    /// Claims are locked after repeated identity mismatches.
    #[error("Claim locked for another {remaining_secs}s")]
    Locked { remaining_secs: u64 },

    /// The claimant is not the recipient.
    #[error("Claimant identity does not match the recipient")]
    IdentityMismatch,

    /// Gift id not found.
    #[error("Gift not found: {0}")]
    GiftNotFound(String),

    /// Operation not allowed in the gift's current status.
    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    /// Leg index not part of the gift.
    #[error("Unknown leg: {0}")]
    UnknownLeg(u32),

    /// Malformed or inconsistent request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or rejected credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated, but not allowed to act on this gift.
    #[error("Forbidden")]
    Forbidden,

    /// Transaction landed but failed on-chain.
    #[error("Transaction failed: {0}")]
    TxFailed(String),

    /// Transaction status did not settle within the polling budget.
    #[error("Confirmation timed out for {0}")]
    ConfirmationTimeout(String),

    /// Hard rejection from the swap venue.
    #[error("Swap venue error: {0}")]
    SwapVenue(String),

    /// Hard rejection from an external provider (onramp, identity, e-mail, oracle).
    #[error("Provider error: {0}")]
    Provider(String),

    /// Transport-level failure; safe to retry.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Settlement network RPC failure; safe to retry.
    #[error("RPC error: {0}")]
    RpcError(String),

    /// Encryption/decryption error.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Storage I/O error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GiftError {
    /// Stable machine-readable code, also persisted in failure reasons.
    pub fn code(&self) -> &'static str {
        match self {
            GiftError::PriceUnavailable(_) => "PRICE_UNAVAILABLE",
            GiftError::FundingTimeout { .. } => "FUNDING_TIMEOUT",
            GiftError::SwapLegFailed { .. } => "SWAP_LEG_FAILED",
            GiftError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            GiftError::EscrowFundingFailed(_) => "ESCROW_FUNDING_FAILED",
            GiftError::SignatureReused(_) => "SIGNATURE_REUSED",
            GiftError::TransferMismatch(_) => "TRANSFER_MISMATCH",
            GiftError::ClaimNotFound => "CLAIM_NOT_FOUND",
            GiftError::AlreadyClaimed => "ALREADY_CLAIMED",
            GiftError::AlreadyRefunded => "ALREADY_REFUNDED",
            GiftError::Locked { .. } => "LOCKED",
            GiftError::IdentityMismatch => "IDENTITY_MISMATCH",
            GiftError::GiftNotFound(_) => "GIFT_NOT_FOUND",
            GiftError::InvalidState { .. } => "INVALID_STATE",
            GiftError::UnknownLeg(_) => "UNKNOWN_LEG",
            GiftError::InvalidRequest(_) => "INVALID_REQUEST",
            GiftError::Unauthorized(_) => "UNAUTHORIZED",
            GiftError::Forbidden => "FORBIDDEN",
            GiftError::TxFailed(_) => "TX_FAILED",
            GiftError::ConfirmationTimeout(_) => "CONFIRMATION_TIMEOUT",
            GiftError::SwapVenue(_) => "SWAP_VENUE_ERROR",
            GiftError::Provider(_) => "PROVIDER_ERROR",
            GiftError::NetworkError(_) => "NETWORK_ERROR",
            GiftError::RpcError(_) => "RPC_ERROR",
            GiftError::Encryption(_) => "ENCRYPTION_ERROR",
            GiftError::Storage(_) => "STORAGE_ERROR",
            GiftError::Serialization(_) => "SERIALIZATION_ERROR",
            GiftError::Config(_) => "CONFIG_ERROR",
            GiftError::RateLimited => "RATE_LIMIT_EXCEEDED",
            GiftError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Transient failures are retried within the caller's budget; everything
    /// else is a hard rejection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GiftError::NetworkError(_) | GiftError::RpcError(_) | GiftError::RateLimited
        )
    }

    /// Whether this error belongs to the recipient-facing claim flow.
    pub fn is_claim_outcome(&self) -> bool {
        matches!(
            self,
            GiftError::ClaimNotFound
                | GiftError::AlreadyClaimed
                | GiftError::AlreadyRefunded
                | GiftError::Locked { .. }
                | GiftError::IdentityMismatch
        )
    }

    /// Text safe to show a recipient. Never reveals who the gift is for.
    pub fn user_message(&self) -> String {
        match self {
            GiftError::IdentityMismatch => "This gift is not for you.".to_string(),
            GiftError::AlreadyClaimed => "This gift has already been claimed.".to_string(),
            GiftError::AlreadyRefunded => {
                "This gift expired and was returned to the sender.".to_string()
            }
            GiftError::Locked { remaining_secs } => {
                let minutes = remaining_secs.div_ceil(60).max(1);
                format!(
                    "Claiming is temporarily locked. Try again in {} minutes.",
                    minutes
                )
            }
            GiftError::ClaimNotFound => "This gift link is not valid.".to_string(),
            _ => "Something went wrong. Please try again later.".to_string(),
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl IntoResponse for GiftError {
    fn into_response(self) -> Response {
        let status = match &self {
            GiftError::PriceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GiftError::FundingTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GiftError::SwapLegFailed { .. } => StatusCode::BAD_GATEWAY,
            GiftError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            GiftError::EscrowFundingFailed(_) => StatusCode::BAD_GATEWAY,
            GiftError::SignatureReused(_) => StatusCode::CONFLICT,
            GiftError::TransferMismatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GiftError::ClaimNotFound => StatusCode::NOT_FOUND,
            GiftError::AlreadyClaimed => StatusCode::CONFLICT,
            GiftError::AlreadyRefunded => StatusCode::GONE,
            GiftError::Locked { .. } => StatusCode::LOCKED,
            GiftError::IdentityMismatch => StatusCode::FORBIDDEN,
            GiftError::GiftNotFound(_) => StatusCode::NOT_FOUND,
            GiftError::InvalidState { .. } => StatusCode::CONFLICT,
            GiftError::UnknownLeg(_) => StatusCode::NOT_FOUND,
            GiftError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GiftError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GiftError::Forbidden => StatusCode::FORBIDDEN,
            GiftError::TxFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GiftError::ConfirmationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GiftError::SwapVenue(_) | GiftError::Provider(_) => StatusCode::BAD_GATEWAY,
            GiftError::NetworkError(_) | GiftError::RpcError(_) => StatusCode::BAD_GATEWAY,
            GiftError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GiftError::Encryption(_)
            | GiftError::Storage(_)
            | GiftError::Serialization(_)
            | GiftError::Config(_)
            | GiftError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let retry_after_secs = match &self {
            GiftError::Locked { remaining_secs } => Some(*remaining_secs),
            _ => None,
        };

        let error = if self.is_claim_outcome() {
            self.user_message()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error,
            code: self.code().to_string(),
            retry_after_secs,
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for GiftError {
    fn from(e: std::io::Error) -> Self {
        GiftError::Storage(e.to_string())
    }
}

impl From<aes_gcm::Error> for GiftError {
    fn from(_: aes_gcm::Error) -> Self {
        GiftError::Encryption("AES-GCM operation failed".to_string())
    }
}

impl From<reqwest::Error> for GiftError {
    fn from(e: reqwest::Error) -> Self {
        GiftError::NetworkError(e.to_string())
    }
}

impl From<SwapVenueError> for GiftError {
    fn from(e: SwapVenueError) -> Self {
        if e.is_retryable() {
            GiftError::NetworkError(e.to_string())
        } else {
            GiftError::SwapVenue(e.to_string())
        }
    }
}

impl From<PriceOracleError> for GiftError {
    fn from(e: PriceOracleError) -> Self {
        if e.is_retryable() {
            GiftError::NetworkError(e.to_string())
        } else {
            GiftError::Provider(e.to_string())
        }
    }
}
