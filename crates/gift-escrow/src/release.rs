//! Escrow releases.
//!
//! Both a claim and a refund end with one escrow-signed transfer. The
//! transaction is signed and stored on the gift before it is sent, so after
//! a restart the outcome of an interrupted release can be read back from the
//! network by signature instead of guessed.
//!
//! Once a release lands, whatever the escrow still holds (the unspent
//! settlement buffer and any token account rent) is swept back to the sender.

use crate::chains::SettlementNetwork;
use crate::error::GiftError;
use crate::store::GiftStore;
use crate::types::{
    Asset, AssetTransfer, ClaimPhase, EscrowKeys, EscrowLegKind, Gift, LegStatus, SignedTransfer,
    TxStatus,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A release that reached the network.
#[derive(Debug, Clone)]
pub struct Released {
    pub signature: String,
    pub at: DateTime<Utc>,
}

/// What recovering an interrupted release did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// The release landed; the claim or refund is now final.
    Completed(String),
    /// The release never landed; the gift is open again.
    Reopened,
    /// The gift was not mid-release.
    Untouched,
}

/// Signs, records and submits escrow releases.
pub struct EscrowRelease {
    store: Arc<GiftStore>,
    network: Arc<dyn SettlementNetwork>,
}

impl EscrowRelease {
    pub fn new(store: Arc<GiftStore>, network: Arc<dyn SettlementNetwork>) -> Self {
        Self { store, network }
    }

    /// Release `transfers` to `destination` for a gift already reserved as
    /// `InFlight` or `Refunding`. On failure the reservation is dropped and
    /// the claim is open again.
    pub async fn release(
        &self,
        gift_id: &str,
        escrow: &EscrowKeys,
        destination: &str,
        transfers: &[AssetTransfer],
    ) -> Result<Released, GiftError> {
        let signed = match self
            .network
            .sign_escrow_transfer(escrow, destination, transfers)
            .await
        {
            Ok(signed) => signed,
            Err(e) => {
                self.reopen(gift_id).await?;
                return Err(e);
            }
        };

        self.store
            .update(gift_id, |gift| {
                gift.claim.pending_release = Some(signed.clone());
            })
            .await?;
        debug!(gift_id = %gift_id, "Recorded pending release {}", signed.signature);

        self.submit(gift_id, &signed).await
    }

    async fn submit(&self, gift_id: &str, signed: &SignedTransfer) -> Result<Released, GiftError> {
        match self.network.submit_escrow_transfer(signed).await {
            Ok(signature) => self.complete(gift_id, signature).await,
            Err(e) => {
                // A send that timed out may still have landed.
                match self.network.signature_status(&signed.signature).await {
                    Ok(TxStatus::Confirmed { .. }) => {
                        warn!(
                            gift_id = %gift_id,
                            "Release reported an error but is confirmed: {}", e
                        );
                        self.complete(gift_id, signed.signature.clone()).await
                    }
                    _ => {
                        error!(gift_id = %gift_id, "Escrow release failed: {}", e);
                        self.reopen(gift_id).await?;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Record the release as final: `InFlight -> Claimed`,
    /// `Refunding -> Refunded`.
    async fn complete(&self, gift_id: &str, signature: String) -> Result<Released, GiftError> {
        let at = Utc::now();
        self.store
            .try_update(gift_id, |gift| {
                match gift.claim.phase {
                    ClaimPhase::InFlight => {
                        gift.claim.phase = ClaimPhase::Claimed;
                        gift.claim.claimed_at = Some(at);
                        gift.claim.claim_signature = Some(signature.clone());
                    }
                    ClaimPhase::Refunding => {
                        gift.claim.phase = ClaimPhase::Refunded;
                        gift.claim.refunded_at = Some(at);
                        gift.claim.refund_signature = Some(signature.clone());
                    }
                    other => {
                        return Err(GiftError::Internal(format!(
                            "Release completed for gift {} in phase {:?}",
                            gift_id, other
                        )))
                    }
                }
                gift.claim.pending_release = None;
                gift.updated_at = at;
                Ok(())
            })
            .await?;

        Ok(Released { signature, at })
    }

    async fn reopen(&self, gift_id: &str) -> Result<(), GiftError> {
        self.store
            .update(gift_id, |gift| {
                gift.claim.phase = ClaimPhase::Open;
                gift.claim.claimant_wallet = None;
                gift.claim.pending_release = None;
            })
            .await
    }

    /// Settle a gift left `InFlight` or `Refunding` by a restart.
    ///
    /// A stored release that confirmed completes the claim or refund; one
    /// that failed, or a reservation that never got as far as signing, is
    /// reopened. A release with no known outcome is sent again.
    pub async fn recover(&self, gift: &Gift) -> Result<Recovery, GiftError> {
        if !matches!(gift.claim.phase, ClaimPhase::InFlight | ClaimPhase::Refunding) {
            return Ok(Recovery::Untouched);
        }

        let Some(signed) = &gift.claim.pending_release else {
            info!(gift_id = %gift.id, "Reopening {:?} gift with no release on record", gift.claim.phase);
            self.reopen(&gift.id).await?;
            return Ok(Recovery::Reopened);
        };

        match self.network.signature_status(&signed.signature).await? {
            TxStatus::Confirmed { .. } => {
                info!(gift_id = %gift.id, "Interrupted release {} had landed", signed.signature);
                let released = self.complete(&gift.id, signed.signature.clone()).await?;
                Ok(Recovery::Completed(released.signature))
            }
            TxStatus::Failed { reason } => {
                info!(gift_id = %gift.id, "Interrupted release failed on chain: {}", reason);
                self.reopen(&gift.id).await?;
                Ok(Recovery::Reopened)
            }
            TxStatus::Pending => match self.submit(&gift.id, signed).await {
                Ok(released) => Ok(Recovery::Completed(released.signature)),
                Err(e) => {
                    warn!(gift_id = %gift.id, "Resending interrupted release failed: {}", e);
                    Ok(Recovery::Reopened)
                }
            },
        }
    }

    /// Sweep what the escrow still holds back to the sender once the claim
    /// or refund is final. Returns the sweep signature, if anything moved.
    pub async fn return_buffer(&self, gift_id: &str) -> Result<Option<String>, GiftError> {
        let gift = self.store.get(gift_id).await?;
        if !needs_buffer_return(&gift) {
            return Ok(None);
        }

        let assets = escrowed_assets(&gift);
        let signature = self
            .network
            .sweep_escrow(&gift.secrets.escrow, &assets, &gift.sender.wallet)
            .await?;

        let now = Utc::now();
        self.store
            .update(gift_id, |gift| {
                gift.claim.buffer_returned_at = Some(now);
                gift.claim.buffer_return_signature = signature.clone();
                gift.updated_at = now;
            })
            .await?;

        match &signature {
            Some(sig) => info!(gift_id = %gift_id, "Escrow leftovers returned to sender, signature: {}", sig),
            None => debug!(gift_id = %gift_id, "Escrow had nothing left to return"),
        }
        Ok(signature)
    }

    /// [`return_buffer`](Self::return_buffer) for every final gift still
    /// holding its buffer. Returns how many sweeps were recorded.
    pub async fn return_pending_buffers(&self) -> usize {
        let mut returned = 0;
        for gift in self.store.find(needs_buffer_return).await {
            match self.return_buffer(&gift.id).await {
                Ok(_) => returned += 1,
                Err(e) => warn!(gift_id = %gift.id, "Escrow leftover return failed: {}", e),
            }
        }
        returned
    }
}

/// Final (claimed or refunded) and the leftovers not yet swept.
pub fn needs_buffer_return(gift: &Gift) -> bool {
    matches!(gift.claim.phase, ClaimPhase::Claimed | ClaimPhase::Refunded)
        && gift.claim.buffer_returned_at.is_none()
        && gift
            .escrow_legs
            .iter()
            .any(|l| l.kind == EscrowLegKind::SettlementBuffer && l.status == LegStatus::Confirmed)
}

/// Distinct assets that were moved into the escrow.
fn escrowed_assets(gift: &Gift) -> Vec<Asset> {
    let mut assets: Vec<Asset> = Vec::new();
    for leg in gift.escrow_legs.iter().filter(|l| l.status == LegStatus::Confirmed) {
        if !assets.contains(&leg.asset) {
            assets.push(leg.asset.clone());
        }
    }
    assets
}
