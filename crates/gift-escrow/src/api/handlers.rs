//! HTTP request handlers.

use super::middleware::{Caller, Operator};
use super::types::{
    ClaimResponse, ConfirmLegRequest, CreateGiftRequest, CreditResponse, EscrowIntentsResponse,
    GrantCreditRequest, HealthResponse, QuoteRequest, QuoteResponse, SwapIntentsResponse,
    TransitionResponse,
};
use super::AppState;
use crate::error::GiftError;
use crate::identity::AuthenticatedIdentity;
use crate::machine::{status_view, GiftOrder, GiftStatusView, InitiatedGift};
use crate::pricing::format_usd;
use crate::types::Sender;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use tracing::info;

/// Wallet the caller acts from: the requested one if linked, else the first.
fn sender_wallet(identity: &AuthenticatedIdentity, requested: Option<&str>) -> Result<String, GiftError> {
    match requested {
        Some(wallet) if identity.wallets.iter().any(|w| w == wallet) => Ok(wallet.to_string()),
        Some(_) => Err(GiftError::Forbidden),
        None => identity
            .primary_wallet()
            .map(str::to_string)
            .ok_or_else(|| GiftError::InvalidRequest("No Solana wallet linked".to_string())),
    }
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let network_healthy = state
        .machine
        .network()
        .health_check()
        .await
        .unwrap_or(false);

    Json(HealthResponse {
        status: "ok".to_string(),
        gift_count: state.machine.store().count().await,
        settlement_network_healthy: network_healthy,
    })
}

/// Fee preview.
pub async fn quote(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(request): Json<QuoteRequest>,
) -> Result<Json<QuoteResponse>, GiftError> {
    let wallet = sender_wallet(&identity, request.wallet.as_deref()).ok();

    let quote = state
        .machine
        .quote(
            &identity.user_id,
            wallet.as_deref(),
            &request.content,
            request.face_value_usd,
            request.payment_method,
            request.card_add_on,
        )
        .await?;

    Ok(Json(QuoteResponse {
        total: format_usd(quote.breakdown.total_usd),
        degraded_pricing: quote.snapshot.degraded,
        breakdown: quote.breakdown,
    }))
}

/// Initiate a gift.
pub async fn create_gift(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(request): Json<CreateGiftRequest>,
) -> Result<(StatusCode, Json<InitiatedGift>), GiftError> {
    let wallet = sender_wallet(&identity, request.wallet.as_deref())?;
    let sender = Sender {
        user_id: identity.user_id.clone(),
        wallet,
        display_name: request.sender_name,
    };
    let order = GiftOrder {
        content: request.content,
        face_value_usd: request.face_value_usd,
        payment_method: request.payment_method,
        card_add_on: request.card_add_on,
        recipient: request.recipient,
        message: request.message,
    };

    let initiated = state.machine.initiate(sender, order).await?;
    info!(gift_id = %initiated.gift_id, user_id = %identity.user_id, "Gift created");

    Ok((StatusCode::CREATED, Json(initiated)))
}

/// Gift status for its sender.
pub async fn get_gift(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(gift_id): Path<String>,
) -> Result<Json<GiftStatusView>, GiftError> {
    let gift = state.machine.sender_gift(&gift_id, &identity.user_id).await?;
    Ok(Json(status_view(&gift, Utc::now())))
}

/// Pending swap legs as unsigned transactions.
pub async fn pending_swaps(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(gift_id): Path<String>,
) -> Result<Json<SwapIntentsResponse>, GiftError> {
    state.machine.sender_gift(&gift_id, &identity.user_id).await?;
    let intents = state.machine.pending_swap_intents(&gift_id).await?;
    Ok(Json(SwapIntentsResponse { gift_id, intents }))
}

/// Confirm a signed swap leg.
pub async fn confirm_swap(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path((gift_id, leg)): Path<(String, u32)>,
    Json(request): Json<ConfirmLegRequest>,
) -> Result<Json<TransitionResponse>, GiftError> {
    state.machine.sender_gift(&gift_id, &identity.user_id).await?;
    let status = state
        .machine
        .confirm_swap_leg(&gift_id, leg, &request.signature)
        .await?;
    Ok(Json(TransitionResponse { gift_id, status }))
}

/// Pending escrow transfers as unsigned transactions.
pub async fn pending_escrow(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(gift_id): Path<String>,
) -> Result<Json<EscrowIntentsResponse>, GiftError> {
    let gift = state.machine.sender_gift(&gift_id, &identity.user_id).await?;
    let intents = state.machine.pending_escrow_transfers(&gift_id).await?;
    Ok(Json(EscrowIntentsResponse {
        gift_id,
        escrow_address: gift.escrow_address,
        intents,
    }))
}

/// Confirm a signed escrow transfer.
pub async fn confirm_escrow(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path((gift_id, leg)): Path<(String, u32)>,
    Json(request): Json<ConfirmLegRequest>,
) -> Result<Json<TransitionResponse>, GiftError> {
    state.machine.sender_gift(&gift_id, &identity.user_id).await?;
    let status = state
        .machine
        .fund_escrow_leg(&gift_id, leg, &request.signature)
        .await?;
    Ok(Json(TransitionResponse { gift_id, status }))
}

/// Sender cancellation.
pub async fn cancel_gift(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(gift_id): Path<String>,
) -> Result<Json<TransitionResponse>, GiftError> {
    state.machine.sender_gift(&gift_id, &identity.user_id).await?;
    let status = state.machine.cancel(&gift_id).await?;
    Ok(Json(TransitionResponse { gift_id, status }))
}

/// Recipient claim.
pub async fn claim_gift(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(token): Path<String>,
) -> Result<Json<ClaimResponse>, GiftError> {
    let receipt = state.claims.claim(&token, &identity).await?;

    Ok(Json(ClaimResponse {
        status: "claimed".to_string(),
        message: "Your gift is on its way to your wallet.".to_string(),
        receipt,
    }))
}

/// Grant onramp credits (operator only).
pub async fn grant_credit(
    State(state): State<AppState>,
    _operator: Operator,
    Json(request): Json<GrantCreditRequest>,
) -> Result<(StatusCode, Json<CreditResponse>), GiftError> {
    if request.user_id.trim().is_empty() {
        return Err(GiftError::InvalidRequest("user_id is required".to_string()));
    }

    let credit = state
        .machine
        .store()
        .grant_credit(&request.user_id, request.allowed, request.expires_at)
        .await?;
    info!(user_id = %request.user_id, "Granted {} onramp credits", request.allowed);

    Ok((StatusCode::CREATED, Json(CreditResponse { credit })))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET_A: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
    const WALLET_B: &str = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T";

    fn identity(wallets: &[&str]) -> AuthenticatedIdentity {
        AuthenticatedIdentity {
            user_id: "u".into(),
            verified_email: None,
            wallets: wallets.iter().map(|w| w.to_string()).collect(),
        }
    }

    #[test]
    fn test_sender_wallet_selection() {
        let caller = identity(&[WALLET_A, WALLET_B]);
        assert_eq!(sender_wallet(&caller, None).unwrap(), WALLET_A);
        assert_eq!(sender_wallet(&caller, Some(WALLET_B)).unwrap(), WALLET_B);

        let stranger = identity(&[WALLET_A]);
        assert!(matches!(
            sender_wallet(&stranger, Some(WALLET_B)),
            Err(GiftError::Forbidden)
        ));
        assert!(matches!(
            sender_wallet(&identity(&[]), None),
            Err(GiftError::InvalidRequest(_))
        ));
    }
}
