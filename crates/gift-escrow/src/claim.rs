//! Claim verification and lockout.
//!
//! A claim is checked and reserved in one store update, so concurrent
//! attempts on the same gift see the reservation and fail with
//! `AlreadyClaimed`. The escrow release runs after the store lock is
//! released, through [`EscrowRelease`], which records its outcome.

use crate::chains::{is_valid_address, SettlementNetwork};
use crate::config::ClaimConfig;
use crate::error::GiftError;
use crate::escrow::escrow_contents;
use crate::identity::AuthenticatedIdentity;
use crate::release::EscrowRelease;
use crate::store::GiftStore;
use crate::types::{AssetTransfer, ClaimPhase, EscrowKeys, Gift, GiftId, GiftStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// A settled claim.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimReceipt {
    pub gift_id: GiftId,
    pub signature: String,
    pub wallet: String,
    pub assets: Vec<AssetTransfer>,
    pub claimed_at: DateTime<Utc>,
}

/// What a successful reservation hands to the settlement step.
struct Reservation {
    escrow: EscrowKeys,
    wallet: String,
    transfers: Vec<AssetTransfer>,
}

pub struct ClaimVerifier {
    store: Arc<GiftStore>,
    release: EscrowRelease,
    config: ClaimConfig,
}

impl ClaimVerifier {
    pub fn new(
        store: Arc<GiftStore>,
        network: Arc<dyn SettlementNetwork>,
        config: ClaimConfig,
    ) -> Self {
        Self {
            release: EscrowRelease::new(store.clone(), network),
            store,
            config,
        }
    }

    pub async fn claim(
        &self,
        claim_token: &str,
        claimant: &AuthenticatedIdentity,
    ) -> Result<ClaimReceipt, GiftError> {
        self.claim_at(claim_token, claimant, Utc::now()).await
    }

    /// Claim as of `now`.
    pub async fn claim_at(
        &self,
        claim_token: &str,
        claimant: &AuthenticatedIdentity,
        now: DateTime<Utc>,
    ) -> Result<ClaimReceipt, GiftError> {
        let gift_id = self
            .store
            .resolve_claim_token(claim_token)
            .await
            .ok_or(GiftError::ClaimNotFound)?;

        // Mismatches must be recorded, so this update always commits.
        let reservation = self
            .store
            .update(&gift_id, |gift| self.reserve(gift, claimant, now))
            .await??;

        let released = self
            .release
            .release(
                &gift_id,
                &reservation.escrow,
                &reservation.wallet,
                &reservation.transfers,
            )
            .await?;
        info!(gift_id = %gift_id, "Gift claimed, signature: {}", released.signature);

        if let Err(e) = self.release.return_buffer(&gift_id).await {
            warn!(gift_id = %gift_id, "Escrow leftovers not returned yet: {}", e);
        }

        Ok(ClaimReceipt {
            gift_id,
            signature: released.signature,
            wallet: reservation.wallet,
            assets: reservation.transfers,
            claimed_at: released.at,
        })
    }

    /// Run every check in order and, if all pass, mark the claim in flight.
    fn reserve(
        &self,
        gift: &mut Gift,
        claimant: &AuthenticatedIdentity,
        now: DateTime<Utc>,
    ) -> Result<Reservation, GiftError> {
        match gift.claim.phase {
            ClaimPhase::Refunding | ClaimPhase::Refunded => return Err(GiftError::AlreadyRefunded),
            ClaimPhase::InFlight | ClaimPhase::Claimed => return Err(GiftError::AlreadyClaimed),
            ClaimPhase::Open => {}
        }

        if let Some(remaining) = gift.claim.lock_remaining(now) {
            let remaining_ms = remaining.num_milliseconds().max(1) as u64;
            return Err(GiftError::Locked {
                remaining_secs: remaining_ms.div_ceil(1000),
            });
        }

        if gift.status != GiftStatus::Sent {
            return Err(GiftError::ClaimNotFound);
        }

        if !claimant.has_verified_email(&gift.recipient.email) {
            self.record_failure(gift, now);
            return Err(GiftError::IdentityMismatch);
        }

        let wallet = claimant
            .wallets
            .iter()
            .find(|w| is_valid_address(w))
            .cloned()
            .ok_or_else(|| {
                GiftError::InvalidRequest("Claimant has no Solana wallet".to_string())
            })?;

        let transfers = escrow_contents(gift);
        if transfers.is_empty() {
            return Err(GiftError::Internal(format!(
                "Gift {} is sent but holds nothing",
                gift.id
            )));
        }

        gift.claim.phase = ClaimPhase::InFlight;
        gift.claim.claimant_wallet = Some(wallet.clone());
        gift.updated_at = now;

        Ok(Reservation {
            escrow: gift.secrets.escrow.clone(),
            wallet,
            transfers,
        })
    }

    /// Count a mismatch; lock once the threshold is reached. Each lockout
    /// doubles the next lock duration, up to the configured cap.
    fn record_failure(&self, gift: &mut Gift, now: DateTime<Utc>) {
        gift.claim.failed_attempts += 1;
        gift.updated_at = now;

        if gift.claim.failed_attempts < self.config.max_failed_attempts {
            warn!(
                gift_id = %gift.id,
                "Claim identity mismatch ({} of {})",
                gift.claim.failed_attempts, self.config.max_failed_attempts
            );
            return;
        }

        let multiplier = 1u32.checked_shl(gift.claim.lockouts).unwrap_or(u32::MAX);
        let duration = self
            .config
            .lock_duration
            .saturating_mul(multiplier)
            .min(self.config.max_lock_duration);
        let duration = chrono::Duration::from_std(duration)
            .unwrap_or_else(|_| chrono::Duration::hours(48));

        gift.claim.lockouts += 1;
        gift.claim.failed_attempts = 0;
        gift.claim.locked_until = Some(now + duration);

        warn!(
            gift_id = %gift.id,
            "Claims locked for {}s after repeated identity mismatches (lockout {})",
            duration.num_seconds(),
            gift.claim.lockouts
        );
    }
}
