//! Swap orchestration.
//!
//! Every basket entry that differs from the funding asset becomes one swap
//! leg. Legs are two-phase: the venue builds an unsigned transaction for the
//! sender to sign, then the submitted signature is confirmed with the venue.
//! Confirmed legs are never rolled back when a later leg fails.

use crate::assets::AssetRegistry;
use crate::error::GiftError;
use crate::poll::{poll_until, PollPolicy};
use crate::pricing::{allocations, usd_to_native};
use crate::types::{Gift, LegStatus, SwapLeg, UnsignedTransaction};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use swap_venue_client::{ExecutionState, QuoteRequest, SwapVenueClient};
use tracing::{debug, info, warn};

/// A quoted, unsigned swap.
#[derive(Debug, Clone)]
pub struct PreparedSwap {
    /// Minimum output after slippage.
    pub quoted_output: u64,
    pub transaction: UnsignedTransaction,
}

/// Venue view of a submitted swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapStatus {
    Pending,
    Confirmed { output_amount: Option<u64> },
    Failed { reason: String },
}

/// Swap aggregator operations.
#[async_trait]
pub trait SwapVenue: Send + Sync {
    /// Quote `amount` of `input_mint` into `output_mint` and build the
    /// unsigned transaction for `user` to sign.
    async fn prepare_swap(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
        user: &str,
    ) -> Result<PreparedSwap, GiftError>;

    async fn swap_status(&self, signature: &str) -> Result<SwapStatus, GiftError>;
}

#[async_trait]
impl SwapVenue for SwapVenueClient {
    async fn prepare_swap(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
        user: &str,
    ) -> Result<PreparedSwap, GiftError> {
        let request = QuoteRequest {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            amount,
            slippage_bps,
        };

        let quote = self.quote_with_retry(&request, Some(2)).await?;
        let quoted_output = quote.min_out_amount()?;
        let swap = self.swap_transaction(quote, user).await?;

        Ok(PreparedSwap {
            quoted_output,
            transaction: UnsignedTransaction {
                transaction: swap.swap_transaction,
                recent_blockhash: None,
                last_valid_block_height: swap.last_valid_block_height,
            },
        })
    }

    async fn swap_status(&self, signature: &str) -> Result<SwapStatus, GiftError> {
        let status = self.execution_status(signature).await?;
        Ok(match status.status {
            ExecutionState::Success => SwapStatus::Confirmed {
                output_amount: status.output_amount(),
            },
            ExecutionState::Failed => SwapStatus::Failed {
                reason: status
                    .error
                    .unwrap_or_else(|| "swap execution failed".to_string()),
            },
            ExecutionState::Pending | ExecutionState::Unknown => SwapStatus::Pending,
        })
    }
}

/// Unsigned swap handed to the sender's signing agent.
#[derive(Debug, Clone, Serialize)]
pub struct SwapIntent {
    pub leg: u32,
    pub input_mint: String,
    pub output_mint: String,
    pub input_amount: u64,
    pub quoted_output: u64,
    pub transaction: UnsignedTransaction,
}

/// Plans, prepares and confirms swap legs.
pub struct SwapOrchestrator {
    venue: Arc<dyn SwapVenue>,
    registry: Arc<AssetRegistry>,
    slippage_bps: u16,
    policy: PollPolicy,
}

impl SwapOrchestrator {
    pub fn new(
        venue: Arc<dyn SwapVenue>,
        registry: Arc<AssetRegistry>,
        slippage_bps: u16,
        policy: PollPolicy,
    ) -> Self {
        Self {
            venue,
            registry,
            slippage_bps,
            policy,
        }
    }

    /// One leg per basket entry not already held in the funding asset, sized
    /// to the entry's allocation at the frozen funding-asset price.
    pub fn plan_legs(&self, gift: &Gift, funding_mint: &str) -> Result<Vec<SwapLeg>, GiftError> {
        let quote = gift
            .quote
            .as_ref()
            .ok_or_else(|| GiftError::Internal(format!("Gift {} has no frozen quote", gift.id)))?;
        let funding = self.registry.get(funding_mint)?;
        let funding_price = quote.snapshot.price(funding_mint)?;

        let entries = gift.content.entries();
        let shares = allocations(gift.face_value_usd, &entries);

        let legs: Vec<SwapLeg> = entries
            .iter()
            .zip(shares)
            .filter(|(entry, _)| entry.mint != funding_mint)
            .enumerate()
            .map(|(index, (entry, share))| SwapLeg {
                index: index as u32,
                input_mint: funding_mint.to_string(),
                output_mint: entry.mint.clone(),
                input_amount: usd_to_native(share, funding_price, funding.decimals),
                target_usd: share,
                quoted_output: None,
                output_amount: None,
                signature: None,
                status: LegStatus::Pending,
            })
            .collect();

        debug!("Planned {} swap legs for gift {}", legs.len(), gift.id);
        Ok(legs)
    }

    /// Unsigned transactions for every leg still pending. Confirmed and
    /// submitted legs are not re-presented.
    pub async fn pending_intents(&self, gift: &Gift) -> Result<Vec<SwapIntent>, GiftError> {
        let mut intents = Vec::new();

        for leg in gift.swap_legs.iter().filter(|l| l.status == LegStatus::Pending) {
            let prepared = self
                .venue
                .prepare_swap(
                    &leg.input_mint,
                    &leg.output_mint,
                    leg.input_amount,
                    self.slippage_bps,
                    &gift.sender.wallet,
                )
                .await
                .map_err(|e| match e {
                    GiftError::SwapVenue(reason) => GiftError::SwapLegFailed {
                        leg: leg.index,
                        asset: leg.output_mint.clone(),
                        reason,
                    },
                    other => other,
                })?;

            intents.push(SwapIntent {
                leg: leg.index,
                input_mint: leg.input_mint.clone(),
                output_mint: leg.output_mint.clone(),
                input_amount: leg.input_amount,
                quoted_output: prepared.quoted_output,
                transaction: prepared.transaction,
            });
        }

        Ok(intents)
    }

    /// Poll the venue until the leg's swap settles. Returns the delivered
    /// output when the venue reports it.
    pub async fn confirm_leg(&self, leg: &SwapLeg, signature: &str) -> Result<Option<u64>, GiftError> {
        let label = format!("swap leg {} ({})", leg.index, signature);
        let venue = &self.venue;

        let result = poll_until(&label, self.policy, || async move {
            match venue.swap_status(signature).await? {
                SwapStatus::Pending => Ok(None),
                SwapStatus::Confirmed { output_amount } => Ok(Some(output_amount)),
                SwapStatus::Failed { reason } => Err(GiftError::SwapLegFailed {
                    leg: leg.index,
                    asset: leg.output_mint.clone(),
                    reason,
                }),
            }
        })
        .await;

        match result {
            Ok(output) => {
                info!(
                    "Swap leg {} confirmed: {} -> {} ({:?})",
                    leg.index, leg.input_mint, leg.output_mint, output
                );
                Ok(output)
            }
            Err(e @ GiftError::SwapLegFailed { .. }) => Err(e),
            Err(e) => {
                warn!("Swap leg {} did not confirm: {}", leg.index, e);
                Err(GiftError::SwapLegFailed {
                    leg: leg.index,
                    asset: leg.output_mint.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}
