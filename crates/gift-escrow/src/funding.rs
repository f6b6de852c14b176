//! Funding detection.
//!
//! One polling task per gift waits for the sender's wallet to grow by the
//! expected deposit, or for the onramp to report the purchase complete,
//! whichever comes first. Each tick re-reads the gift and stops as soon as it
//! has left `AWAITING_FUNDING`; the owner can also cancel through a `watch`
//! channel.

use crate::assets::AssetRegistry;
use crate::chains::SettlementNetwork;
use crate::config::FundingConfig;
use crate::error::GiftError;
use crate::onramp::{Onramp, OnrampStatus};
use crate::pricing::{bps_ceil, usd_to_native, PriceCache};
use crate::store::GiftStore;
use crate::types::{FundingExpectation, GiftStatus};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// How funding was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingSignal {
    Balance,
    Onramp,
}

/// How a detector run ended.
#[derive(Debug)]
pub enum FundingOutcome {
    Confirmed(FundingSignal),
    /// Attempt budget exhausted.
    TimedOut { attempts: u32 },
    /// The gift moved on, or the detector was cancelled.
    Stopped,
    /// Hard error; retrying will not help.
    Failed(GiftError),
}

/// Native amount that satisfies the expectation at `price` (micro-USD per unit).
fn required_native(expectation: &FundingExpectation, price: u64, decimals: u8) -> u64 {
    let expected = usd_to_native(expectation.expected_usd, price, decimals);
    bps_ceil(expected, expectation.threshold_bps as u64)
}

pub struct FundingDetector {
    store: Arc<GiftStore>,
    network: Arc<dyn SettlementNetwork>,
    onramp: Arc<dyn Onramp>,
    prices: Arc<PriceCache>,
    registry: Arc<AssetRegistry>,
    config: FundingConfig,
}

impl FundingDetector {
    pub fn new(
        store: Arc<GiftStore>,
        network: Arc<dyn SettlementNetwork>,
        onramp: Arc<dyn Onramp>,
        prices: Arc<PriceCache>,
        registry: Arc<AssetRegistry>,
        config: FundingConfig,
    ) -> Self {
        Self {
            store,
            network,
            onramp,
            prices,
            registry,
            config,
        }
    }

    pub fn threshold_bps(&self) -> u32 {
        self.config.threshold_bps
    }

    /// Current balance of the watched wallet in the funding asset.
    pub async fn balance(&self, expectation: &FundingExpectation) -> Result<u64, GiftError> {
        let asset = self.registry.get(&expectation.funding_mint)?;
        self.network.balance(&expectation.wallet, asset).await
    }

    /// Reject up front when a wallet-direct sender cannot cover the deposit.
    pub async fn ensure_sufficient_balance(
        &self,
        expectation: &FundingExpectation,
    ) -> Result<(), GiftError> {
        let asset = self.registry.get(&expectation.funding_mint)?;
        let price = self.prices.price(&expectation.funding_mint).await?;
        let required = usd_to_native(expectation.expected_usd, price, asset.decimals);
        let available = self.network.balance(&expectation.wallet, asset).await?;

        if available < required {
            return Err(GiftError::InsufficientBalance {
                required,
                available,
            });
        }
        Ok(())
    }

    /// One check. `Ok(Some(_))` means funded.
    pub async fn check(
        &self,
        expectation: &FundingExpectation,
    ) -> Result<Option<FundingSignal>, GiftError> {
        if let Some(reference) = &expectation.onramp_reference {
            match self.onramp.status(reference).await {
                Ok(OnrampStatus::Completed) => return Ok(Some(FundingSignal::Onramp)),
                Ok(OnrampStatus::Failed) => {
                    warn!("Onramp reports purchase {} failed; still watching balance", reference)
                }
                Ok(OnrampStatus::Pending) => {}
                Err(e) => warn!("Onramp status check failed for {}: {}", reference, e),
            }
        }

        let asset = self.registry.get(&expectation.funding_mint)?;
        let price = self.prices.price(&expectation.funding_mint).await?;
        let balance = self.network.balance(&expectation.wallet, asset).await?;

        let received = balance.saturating_sub(expectation.baseline);
        let required = required_native(expectation, price, asset.decimals);
        debug!(
            "Funding check {}: received {} of required {} {}",
            expectation.wallet, received, required, asset.symbol
        );

        Ok((received >= required).then_some(FundingSignal::Balance))
    }

    /// Poll until funded, timed out, stopped or cancelled.
    pub async fn watch(
        &self,
        gift_id: &str,
        expectation: &FundingExpectation,
        mut cancel: watch::Receiver<bool>,
    ) -> FundingOutcome {
        info!(
            "Watching funding for gift {} ({} attempts every {:?})",
            gift_id, self.config.max_attempts, self.config.poll_interval
        );

        for attempt in 1..=self.config.max_attempts {
            if *cancel.borrow() {
                debug!("Funding detector for {} cancelled", gift_id);
                return FundingOutcome::Stopped;
            }

            match self.store.get(gift_id).await {
                Ok(gift) if gift.status == GiftStatus::AwaitingFunding => {}
                Ok(gift) => {
                    debug!("Gift {} is {}, funding detector stopping", gift_id, gift.status);
                    return FundingOutcome::Stopped;
                }
                Err(e) => return FundingOutcome::Failed(e),
            }

            match self.check(expectation).await {
                Ok(Some(signal)) => {
                    info!("Funding confirmed for gift {} via {:?}", gift_id, signal);
                    return FundingOutcome::Confirmed(signal);
                }
                Ok(None) => {}
                Err(e) if e.is_transient() || matches!(e, GiftError::PriceUnavailable(_)) => {
                    warn!("Funding check for {} failed (attempt {}): {}", gift_id, attempt, e)
                }
                Err(e) => return FundingOutcome::Failed(e),
            }

            if attempt < self.config.max_attempts {
                tokio::select! {
                    _ = sleep(self.config.poll_interval) => {}
                    changed = cancel.changed() => {
                        // Sender dropped: nobody owns this detector any more.
                        if changed.is_err() {
                            return FundingOutcome::Stopped;
                        }
                    }
                }
            }
        }

        warn!(
            "Funding for gift {} not detected after {} attempts",
            gift_id, self.config.max_attempts
        );
        FundingOutcome::TimedOut {
            attempts: self.config.max_attempts,
        }
    }
}
