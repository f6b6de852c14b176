//! Fee computation.
//!
//! `total = face + network_fee + processing_fee`, where
//! - network fee = token-account rent + escrow rent + transaction fees (all
//!   priced in the settlement asset) + swap fee + card add-on;
//! - processing fee = card processing bps on `face + network_fee`, card onramp only.
//!
//! Every step is integer arithmetic over a fixed [`PriceSnapshot`], so the
//! same request and snapshot always produce the same breakdown.

use super::{bps_ceil, native_to_usd_ceil, usd_to_native, PriceCache, PriceSnapshot};
use crate::assets::AssetRegistry;
use crate::config::FeeConfig;
use crate::error::GiftError;
use crate::types::{BasketEntry, FrozenQuote, GiftContent, PaymentMethod, BPS_DENOMINATOR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Everything the fee engine needs to price a gift.
#[derive(Debug, Clone)]
pub struct FeeRequest {
    pub face_value_usd: u64,
    pub content: GiftContent,
    pub card_add_on: bool,
    pub payment_method: PaymentMethod,
    /// Mints for which the sender already has a token account. Anything not
    /// listed is assumed missing.
    pub sender_token_accounts: BTreeSet<String>,
    /// Sender holds a usable onramp credit.
    pub credit_available: bool,
}

/// Parts of the network fee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeComponents {
    pub token_accounts_created: u32,
    pub account_rent_lamports: u64,
    pub account_rent_usd: u64,
    pub transaction_count: u32,
    pub transaction_fee_lamports: u64,
    pub transaction_fee_usd: u64,
    pub swap_legs: u32,
    pub swap_fee_usd: u64,
    pub card_add_on_usd: u64,
}

/// Frozen price of a gift. USD amounts in micro-USD, lamport amounts in the
/// settlement asset at `settlement_price_usd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub face_value_usd: u64,
    pub network_fee_usd: u64,
    pub processing_fee_usd: u64,
    pub total_usd: u64,
    /// `(network + processing) / face` in basis points.
    pub overhead_bps: u64,
    pub components: FeeComponents,
    pub settlement_price_usd: u64,
    pub face_value_lamports: u64,
    pub network_fee_lamports: u64,
    pub processing_fee_lamports: u64,
    pub total_lamports: u64,
    /// Native balance the escrow needs to pay for the claim.
    pub escrow_buffer_lamports: u64,
    pub credit_applied: bool,
    pub degraded_pricing: bool,
}

impl FeeBreakdown {
    /// What must land on-chain; the processing fee is kept by the onramp.
    pub fn expected_deposit_usd(&self) -> u64 {
        self.total_usd - self.processing_fee_usd
    }
}

/// Split `face` by weights. The last entry absorbs the rounding remainder,
/// so allocations always sum to `face`.
pub fn allocations(face_usd: u64, entries: &[BasketEntry]) -> Vec<u64> {
    let mut out = Vec::with_capacity(entries.len());
    let mut assigned: u64 = 0;
    for (i, entry) in entries.iter().enumerate() {
        let share = if i + 1 == entries.len() {
            face_usd - assigned
        } else {
            (face_usd as u128 * entry.weight_bps as u128 / BPS_DENOMINATOR as u128) as u64
        };
        assigned += share;
        out.push(share);
    }
    out
}

/// Compute the fee breakdown for `request` against `snapshot`.
pub fn compute_fees(
    request: &FeeRequest,
    snapshot: &PriceSnapshot,
    registry: &AssetRegistry,
    config: &FeeConfig,
    basket_funding_mint: &str,
) -> Result<FeeBreakdown, GiftError> {
    let face = request.face_value_usd;
    if face == 0 || face < config.min_face_value_usd || face > config.max_face_value_usd {
        return Err(GiftError::InvalidRequest(format!(
            "face value {} outside [{}, {}] micro-USD",
            face, config.min_face_value_usd, config.max_face_value_usd
        )));
    }
    request.content.validate()?;

    let settlement = registry.settlement();
    let settlement_price = snapshot.price(&settlement.mint)?;
    let funding_mint = request.content.funding_mint(basket_funding_mint);
    registry.get(funding_mint)?;

    let entries = request.content.entries();
    let shares = allocations(face, &entries);

    let mut token_assets: u32 = 0;
    let mut token_accounts_created: u32 = 0;
    let mut swap_legs: u32 = 0;
    let mut swap_fee_usd: u64 = 0;

    for (entry, share) in entries.iter().zip(&shares) {
        let asset = registry.get(&entry.mint)?;
        if !asset.is_native() {
            token_assets += 1;
            // Escrow and recipient accounts never exist yet.
            token_accounts_created += 2;
            if !request.sender_token_accounts.contains(&asset.mint) {
                token_accounts_created += 1;
            }
        }
        if entry.mint != funding_mint {
            swap_legs += 1;
            swap_fee_usd += bps_ceil(*share, config.swap_fee_bps);
        }
    }

    let account_rent_lamports = config.escrow_account_rent_lamports
        + token_accounts_created as u64 * config.token_account_rent_lamports;

    // Swaps, one escrow transfer per entry plus the buffer, and the claim.
    let transaction_count = swap_legs + entries.len() as u32 + 1 + 1;
    let transaction_fee_lamports = transaction_count as u64 * config.transaction_fee_lamports;

    let account_rent_usd =
        native_to_usd_ceil(account_rent_lamports, settlement_price, settlement.decimals);
    let transaction_fee_usd =
        native_to_usd_ceil(transaction_fee_lamports, settlement_price, settlement.decimals);

    let card_fees_apply = request.card_add_on || request.payment_method == PaymentMethod::CardOnramp;
    let credit_applied = request.credit_available && card_fees_apply;

    let card_add_on_usd = if request.card_add_on && !credit_applied {
        config.card_add_on_usd
    } else {
        0
    };

    let network_fee_usd = account_rent_usd + transaction_fee_usd + swap_fee_usd + card_add_on_usd;

    let processing_fee_usd =
        if request.payment_method == PaymentMethod::CardOnramp && !credit_applied {
            bps_ceil(face + network_fee_usd, config.card_processing_fee_bps)
        } else {
            0
        };

    let total_usd = face + network_fee_usd + processing_fee_usd;
    let overhead_bps = ((network_fee_usd + processing_fee_usd) as u128
        * BPS_DENOMINATOR as u128)
        .checked_div(face as u128)
        .unwrap_or(0) as u64;

    let to_lamports = |usd: u64| usd_to_native(usd, settlement_price, settlement.decimals);

    let escrow_buffer_lamports = config.escrow_account_rent_lamports
        + token_assets as u64 * config.token_account_rent_lamports
        + config.transaction_fee_lamports;

    let breakdown = FeeBreakdown {
        face_value_usd: face,
        network_fee_usd,
        processing_fee_usd,
        total_usd,
        overhead_bps,
        components: FeeComponents {
            token_accounts_created,
            account_rent_lamports,
            account_rent_usd,
            transaction_count,
            transaction_fee_lamports,
            transaction_fee_usd,
            swap_legs,
            swap_fee_usd,
            card_add_on_usd,
        },
        settlement_price_usd: settlement_price,
        face_value_lamports: to_lamports(face),
        network_fee_lamports: to_lamports(network_fee_usd),
        processing_fee_lamports: to_lamports(processing_fee_usd),
        total_lamports: to_lamports(total_usd),
        escrow_buffer_lamports,
        credit_applied,
        degraded_pricing: snapshot.degraded,
    };

    debug!(
        "Priced gift: face={} network={} processing={} total={}",
        face, network_fee_usd, processing_fee_usd, total_usd
    );

    Ok(breakdown)
}

/// Fee engine bound to live prices.
pub struct FeeEngine {
    registry: Arc<AssetRegistry>,
    prices: Arc<PriceCache>,
    config: FeeConfig,
    basket_funding_mint: String,
}

impl FeeEngine {
    pub fn new(
        registry: Arc<AssetRegistry>,
        prices: Arc<PriceCache>,
        config: FeeConfig,
        basket_funding_mint: String,
    ) -> Self {
        Self {
            registry,
            prices,
            config,
            basket_funding_mint,
        }
    }

    /// Price a request with a fresh snapshot of every asset involved.
    pub async fn quote(&self, request: &FeeRequest) -> Result<FrozenQuote, GiftError> {
        let mut mints: Vec<String> = request
            .content
            .entries()
            .into_iter()
            .map(|e| e.mint)
            .collect();
        mints.push(self.registry.settlement().mint.clone());
        mints.push(
            request
                .content
                .funding_mint(&self.basket_funding_mint)
                .to_string(),
        );

        let snapshot = self.prices.snapshot(&mints).await?;
        let breakdown = compute_fees(
            request,
            &snapshot,
            &self.registry,
            &self.config,
            &self.basket_funding_mint,
        )?;

        Ok(FrozenQuote { breakdown, snapshot })
    }

    pub fn basket_funding_mint(&self) -> &str {
        &self.basket_funding_mint
    }

    pub fn registry(&self) -> &AssetRegistry {
        &self.registry
    }

    pub fn prices(&self) -> &PriceCache {
        &self.prices
    }
}
