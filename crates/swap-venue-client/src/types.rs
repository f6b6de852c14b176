//! Request and response types for the swap venue API.

use crate::error::SwapVenueError;
use serde::{Deserialize, Serialize};

/// Query for `GET /quote`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    pub input_mint: String,
    pub output_mint: String,
    /// Input amount in the input asset's smallest unit.
    pub amount: u64,
    pub slippage_bps: u16,
}

/// A route quote. Passed back verbatim when requesting the swap transaction,
/// so unknown fields are preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    pub input_mint: String,
    pub in_amount: String,
    pub output_mint: String,
    pub out_amount: String,
    #[serde(default)]
    pub other_amount_threshold: Option<String>,
    #[serde(default)]
    pub slippage_bps: Option<u16>,
    #[serde(default)]
    pub price_impact_pct: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl QuoteResponse {
    /// Quoted output in the output asset's smallest unit.
    pub fn out_amount(&self) -> Result<u64, SwapVenueError> {
        self.out_amount
            .parse()
            .map_err(|_| SwapVenueError::InvalidAmount(self.out_amount.clone()))
    }

    /// Minimum output after slippage, falling back to the quoted output.
    pub fn min_out_amount(&self) -> Result<u64, SwapVenueError> {
        match &self.other_amount_threshold {
            Some(raw) => raw
                .parse()
                .map_err(|_| SwapVenueError::InvalidAmount(raw.clone())),
            None => self.out_amount(),
        }
    }
}

/// Body for `POST /swap`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRequest {
    pub quote_response: QuoteResponse,
    pub user_public_key: String,
    pub wrap_and_unwrap_sol: bool,
    pub dynamic_compute_unit_limit: bool,
}

/// Unsigned swap transaction built by the venue.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapResponse {
    /// Base64-encoded serialized transaction, to be signed by the user.
    pub swap_transaction: String,
    #[serde(default)]
    pub last_valid_block_height: Option<u64>,
}

/// Execution state reported for a submitted swap signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Success,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Response of `GET /status/{signature}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    pub status: ExecutionState,
    #[serde(default)]
    pub output_amount: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionStatus {
    /// Delivered output, if the venue reports it.
    pub fn output_amount(&self) -> Option<u64> {
        self.output_amount.as_deref().and_then(|s| s.parse().ok())
    }
}
