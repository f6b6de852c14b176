//! API request and response types.

use crate::claim::ClaimReceipt;
use crate::escrow::EscrowIntent;
use crate::pricing::FeeBreakdown;
use crate::swap::SwapIntent;
use crate::types::{GiftContent, GiftId, GiftStatus, OnrampCredit, PaymentMethod, Recipient};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fee preview request.
#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub content: GiftContent,
    /// Micro-USD.
    pub face_value_usd: u64,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub card_add_on: bool,
    /// Wallet to fund from; defaults to the caller's first Solana wallet.
    #[serde(default)]
    pub wallet: Option<String>,
}

/// Fee preview.
#[derive(Debug, Serialize)]
pub struct QuoteResponse {
    pub breakdown: FeeBreakdown,
    /// Total formatted for display.
    pub total: String,
    pub degraded_pricing: bool,
}

/// Gift initiation request.
#[derive(Debug, Deserialize)]
pub struct CreateGiftRequest {
    pub content: GiftContent,
    pub face_value_usd: u64,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub card_add_on: bool,
    pub recipient: Recipient,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub wallet: Option<String>,
}

/// Pending swap legs, ready for signing.
#[derive(Debug, Serialize)]
pub struct SwapIntentsResponse {
    pub gift_id: GiftId,
    pub intents: Vec<SwapIntent>,
}

/// Pending escrow transfers, ready for signing.
#[derive(Debug, Serialize)]
pub struct EscrowIntentsResponse {
    pub gift_id: GiftId,
    pub escrow_address: String,
    pub intents: Vec<EscrowIntent>,
}

/// Signature of a submitted leg.
#[derive(Debug, Deserialize)]
pub struct ConfirmLegRequest {
    pub signature: String,
}

/// Gift status after a transition request.
#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub gift_id: GiftId,
    pub status: GiftStatus,
}

/// Successful claim.
#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub status: String,
    pub message: String,
    #[serde(flatten)]
    pub receipt: ClaimReceipt,
}

/// Operator grant of promotional onramp credits.
#[derive(Debug, Deserialize)]
pub struct GrantCreditRequest {
    pub user_id: String,
    pub allowed: u32,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreditResponse {
    pub credit: OnrampCredit,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub gift_count: usize,
    pub settlement_network_healthy: bool,
}
