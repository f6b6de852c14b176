//! Escrow funding.
//!
//! Once the basket is held by the sender, each basket asset plus a native
//! settlement buffer is moved into the gift's single-use escrow account. Legs
//! are independent and may be confirmed in any order.

use crate::assets::AssetRegistry;
use crate::chains::SettlementNetwork;
use crate::error::GiftError;
use crate::poll::{poll_until, PollPolicy};
use crate::pricing::{allocations, usd_to_native};
use crate::types::{
    Asset, AssetTransfer, EscrowLeg, EscrowLegKind, Gift, LegStatus, TxStatus, UnsignedTransaction,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Unsigned escrow transfer handed to the sender's signing agent.
#[derive(Debug, Clone, Serialize)]
pub struct EscrowIntent {
    pub leg: u32,
    pub kind: EscrowLegKind,
    pub mint: String,
    pub symbol: String,
    pub amount: u64,
    pub transaction: UnsignedTransaction,
}

/// Plans, prepares and confirms escrow funding legs.
pub struct EscrowController {
    network: Arc<dyn SettlementNetwork>,
    registry: Arc<AssetRegistry>,
    policy: PollPolicy,
}

impl EscrowController {
    pub fn new(
        network: Arc<dyn SettlementNetwork>,
        registry: Arc<AssetRegistry>,
        policy: PollPolicy,
    ) -> Self {
        Self {
            network,
            registry,
            policy,
        }
    }

    /// One leg per basket asset plus the settlement buffer. Swapped assets
    /// use the delivered (or minimum quoted) output; the funding asset uses
    /// its allocation at the frozen price.
    pub fn plan_legs(&self, gift: &Gift, funding_mint: &str) -> Result<Vec<EscrowLeg>, GiftError> {
        let quote = gift
            .quote
            .as_ref()
            .ok_or_else(|| GiftError::Internal(format!("Gift {} has no frozen quote", gift.id)))?;

        let entries = gift.content.entries();
        let shares = allocations(gift.face_value_usd, &entries);
        let mut legs = Vec::with_capacity(entries.len() + 1);

        for (entry, share) in entries.iter().zip(shares) {
            let asset = self.registry.get(&entry.mint)?.clone();

            let amount = if entry.mint == funding_mint {
                usd_to_native(share, quote.snapshot.price(&entry.mint)?, asset.decimals)
            } else {
                let swap = gift
                    .swap_legs
                    .iter()
                    .find(|l| l.output_mint == entry.mint && l.status == LegStatus::Confirmed)
                    .ok_or_else(|| {
                        GiftError::Internal(format!("No confirmed swap into {}", entry.mint))
                    })?;
                swap.output_amount.or(swap.quoted_output).ok_or_else(|| {
                    GiftError::Internal(format!("Swap into {} has no known output", entry.mint))
                })?
            };

            legs.push(EscrowLeg {
                index: legs.len() as u32,
                kind: EscrowLegKind::Asset,
                asset,
                amount,
                signature: None,
                status: LegStatus::Pending,
            });
        }

        legs.push(EscrowLeg {
            index: legs.len() as u32,
            kind: EscrowLegKind::SettlementBuffer,
            asset: self.registry.settlement().clone(),
            amount: quote.breakdown.escrow_buffer_lamports,
            signature: None,
            status: LegStatus::Pending,
        });

        debug!("Planned {} escrow legs for gift {}", legs.len(), gift.id);
        Ok(legs)
    }

    /// Unsigned sender -> escrow transfers for every pending leg.
    pub async fn pending_transfers(&self, gift: &Gift) -> Result<Vec<EscrowIntent>, GiftError> {
        let mut intents = Vec::new();

        for leg in gift.escrow_legs.iter().filter(|l| l.status == LegStatus::Pending) {
            let transfer = AssetTransfer {
                asset: leg.asset.clone(),
                amount: leg.amount,
            };
            let transaction = self
                .network
                .prepare_transfer(&gift.sender.wallet, &gift.escrow_address, &transfer)
                .await?;

            intents.push(EscrowIntent {
                leg: leg.index,
                kind: leg.kind,
                mint: leg.asset.mint.clone(),
                symbol: leg.asset.symbol.clone(),
                amount: leg.amount,
                transaction,
            });
        }

        Ok(intents)
    }

    /// Poll the settlement network until the leg's transfer is confirmed,
    /// then check the escrow actually holds it.
    ///
    /// A failed or never-confirming transfer is `EscrowFundingFailed`. A
    /// confirmed transaction that left the escrow short (an unrelated or
    /// smaller transfer) is `TransferMismatch`.
    pub async fn confirm_leg(
        &self,
        gift: &Gift,
        leg: &EscrowLeg,
        signature: &str,
    ) -> Result<(), GiftError> {
        let label = format!("escrow leg {} ({})", leg.index, signature);
        let network = &self.network;

        let result = poll_until(&label, self.policy, || async move {
            match network.signature_status(signature).await? {
                TxStatus::Pending => Ok(None),
                TxStatus::Confirmed { .. } => Ok(Some(())),
                TxStatus::Failed { reason } => Err(GiftError::TxFailed(reason)),
            }
        })
        .await;

        if let Err(e) = result {
            warn!("Escrow leg {} failed: {}", leg.index, e);
            return Err(GiftError::EscrowFundingFailed(format!(
                "leg {} ({}): {}",
                leg.index, leg.asset.symbol, e
            )));
        }

        // This leg plus every other confirmed leg of the same asset.
        let required = gift
            .escrow_legs
            .iter()
            .filter(|l| {
                l.index != leg.index
                    && l.asset.mint == leg.asset.mint
                    && l.status == LegStatus::Confirmed
            })
            .fold(leg.amount, |sum, l| sum.saturating_add(l.amount));
        self.check_balance(gift, &leg.asset, required).await?;

        info!(
            "Escrow leg {} confirmed: {} {}",
            leg.index, leg.amount, leg.asset.symbol
        );
        Ok(())
    }

    /// Check the escrow holds every leg at once, per asset.
    pub async fn verify_holdings(&self, gift: &Gift) -> Result<(), GiftError> {
        let mut required: Vec<(&Asset, u64)> = Vec::new();
        for leg in &gift.escrow_legs {
            match required.iter_mut().find(|(a, _)| a.mint == leg.asset.mint) {
                Some((_, sum)) => *sum = sum.saturating_add(leg.amount),
                None => required.push((&leg.asset, leg.amount)),
            }
        }

        for (asset, amount) in required {
            self.check_balance(gift, asset, amount).await?;
        }
        Ok(())
    }

    async fn check_balance(&self, gift: &Gift, asset: &Asset, required: u64) -> Result<(), GiftError> {
        let held = self.network.balance(&gift.escrow_address, asset).await?;
        if held < required {
            warn!(
                "Escrow {} holds {} {} but its legs need {}",
                gift.escrow_address, held, asset.symbol, required
            );
            return Err(GiftError::TransferMismatch(format!(
                "escrow holds {} {}, expected at least {}",
                held, asset.symbol, required
            )));
        }
        Ok(())
    }
}

/// What the escrow holds for the recipient: every confirmed basket asset.
/// The settlement buffer stays behind to pay for the release itself.
pub fn escrow_contents(gift: &Gift) -> Vec<AssetTransfer> {
    gift.escrow_legs
        .iter()
        .filter(|l| l.kind == EscrowLegKind::Asset && l.status == LegStatus::Confirmed)
        .map(|l| AssetTransfer {
            asset: l.asset.clone(),
            amount: l.amount,
        })
        .collect()
}
