//! Unclaimed-gift refund sweep.
//!
//! Periodically returns the escrow contents of `SENT` gifts that nobody
//! claimed within the configured window (counted from creation) to the
//! sender's wallet. Each cycle also retries any escrow leftovers that were
//! not yet swept back after a claim or refund.

use crate::chains::SettlementNetwork;
use crate::config::RefundConfig;
use crate::error::GiftError;
use crate::escrow::escrow_contents;
use crate::release::EscrowRelease;
use crate::store::GiftStore;
use crate::types::{AssetTransfer, ClaimPhase, Gift, GiftId, GiftStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A completed refund.
#[derive(Debug, Clone)]
pub struct RefundRecord {
    pub gift_id: GiftId,
    pub to: String,
    pub signature: String,
    pub assets: Vec<AssetTransfer>,
    pub refunded_at: DateTime<Utc>,
}

pub struct RefundSweeper {
    store: Arc<GiftStore>,
    release: EscrowRelease,
    config: RefundConfig,
}

impl RefundSweeper {
    pub fn new(
        store: Arc<GiftStore>,
        network: Arc<dyn SettlementNetwork>,
        config: RefundConfig,
    ) -> Self {
        Self {
            release: EscrowRelease::new(store.clone(), network),
            store,
            config,
        }
    }

    fn is_due(&self, gift: &Gift, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.config.unclaimed_after)
            .unwrap_or_else(|_| chrono::Duration::hours(48));
        gift.status == GiftStatus::Sent
            && gift.claim.phase == ClaimPhase::Open
            && gift.created_at + window <= now
    }

    /// Refund every gift that is due at `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Vec<RefundRecord> {
        let due = self.store.find(|g| self.is_due(g, now)).await;
        let mut records = Vec::new();

        for gift in due {
            match self.refund(&gift.id, now).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => debug!("Gift {} no longer due for refund", gift.id),
                Err(e) => error!("Refund failed for gift {}: {}", gift.id, e),
            }
        }

        let swept = self.release.return_pending_buffers().await;
        if swept > 0 {
            info!("Returned escrow leftovers of {} gifts", swept);
        }

        records
    }

    async fn refund(&self, gift_id: &str, now: DateTime<Utc>) -> Result<Option<RefundRecord>, GiftError> {
        // Reserve first so a claim racing the sweep sees `AlreadyRefunded`.
        let reserved = self
            .store
            .try_update(gift_id, |gift| {
                if !self.is_due(gift, now) {
                    return Ok(None);
                }
                gift.claim.phase = ClaimPhase::Refunding;
                gift.updated_at = now;
                Ok(Some((
                    gift.secrets.escrow.clone(),
                    gift.sender.wallet.clone(),
                    escrow_contents(gift),
                )))
            })
            .await?;

        let Some((escrow, sender_wallet, transfers)) = reserved else {
            return Ok(None);
        };

        info!(
            "Refunding unclaimed gift {} ({} assets) to {}",
            gift_id,
            transfers.len(),
            sender_wallet
        );

        let released = self
            .release
            .release(gift_id, &escrow, &sender_wallet, &transfers)
            .await?;
        info!("Gift {} refunded, signature: {}", gift_id, released.signature);

        if let Err(e) = self.release.return_buffer(gift_id).await {
            warn!("Escrow leftovers of gift {} not returned yet: {}", gift_id, e);
        }

        Ok(Some(RefundRecord {
            gift_id: gift_id.to_string(),
            to: sender_wallet,
            signature: released.signature,
            assets: transfers,
            refunded_at: released.at,
        }))
    }

    /// Sweep forever, sleeping between cycles.
    pub async fn run(&self) {
        info!(
            "Starting refund sweeper, interval: {:?}, unclaimed after: {:?}",
            self.config.interval, self.config.unclaimed_after
        );

        loop {
            tokio::time::sleep(self.config.interval).await;

            let records = self.sweep_once(Utc::now()).await;
            if records.is_empty() {
                debug!("No refunds this cycle");
            } else {
                info!("Refund cycle complete: {} gifts refunded", records.len());
            }
        }
    }
}

/// Spawn the refund sweeper as a background task.
pub fn spawn_refund_sweeper(sweeper: Arc<RefundSweeper>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        sweeper.run().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sent_gift, MockNetwork};

    async fn setup() -> (RefundSweeper, Arc<GiftStore>, Arc<MockNetwork>) {
        let store = Arc::new(GiftStore::memory());
        let network = Arc::new(MockNetwork::default());
        let sweeper = RefundSweeper::new(store.clone(), network.clone(), RefundConfig::default());
        (sweeper, store, network)
    }

    #[tokio::test]
    async fn test_only_stale_unclaimed_gifts_are_refunded() {
        let (sweeper, store, network) = setup().await;
        let now = Utc::now();

        let mut stale = sent_gift("stale", "token-1");
        stale.created_at = now - chrono::Duration::hours(49);
        let mut fresh = sent_gift("fresh", "token-2");
        fresh.created_at = now - chrono::Duration::hours(47);
        let mut claimed = sent_gift("claimed", "token-3");
        claimed.created_at = now - chrono::Duration::hours(72);
        claimed.claim.phase = ClaimPhase::Claimed;
        claimed.claim.buffer_returned_at = Some(now);

        for gift in [stale, fresh, claimed] {
            store.insert(gift).await.unwrap();
        }

        let records = sweeper.sweep_once(now).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].gift_id, "stale");
        assert_eq!(records[0].to, store.get("stale").await.unwrap().sender.wallet);
        assert_eq!(network.escrow_transfer_count(), 1);

        let refunded = store.get("stale").await.unwrap();
        assert_eq!(refunded.claim.phase, ClaimPhase::Refunded);
        assert!(refunded.claim.refund_signature.is_some());

        // The leftover buffer follows the refund to the sender.
        assert_eq!(network.sweeps(), vec![refunded.sender.wallet.clone()]);
        assert!(refunded.claim.buffer_returned_at.is_some());

        // Nothing left to do on the next cycle.
        assert!(sweeper.sweep_once(now).await.is_empty());
        assert_eq!(network.sweeps().len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_retries_missing_buffer_returns() {
        let (sweeper, store, network) = setup().await;
        let mut claimed = sent_gift("claimed", "token-1");
        claimed.claim.phase = ClaimPhase::Claimed;
        store.insert(claimed).await.unwrap();

        assert!(sweeper.sweep_once(Utc::now()).await.is_empty());
        assert_eq!(network.sweeps().len(), 1);
        assert!(store
            .get("claimed")
            .await
            .unwrap()
            .claim
            .buffer_returned_at
            .is_some());
    }

    #[tokio::test]
    async fn test_failed_refund_is_retried_next_cycle() {
        let (sweeper, store, network) = setup().await;
        let now = Utc::now();
        let mut gift = sent_gift("gift-1", "token-1");
        gift.created_at = now - chrono::Duration::hours(49);
        store.insert(gift).await.unwrap();

        network.fail_escrow_transfers(true);
        assert!(sweeper.sweep_once(now).await.is_empty());
        assert_eq!(store.get("gift-1").await.unwrap().claim.phase, ClaimPhase::Open);

        network.fail_escrow_transfers(false);
        assert_eq!(sweeper.sweep_once(now).await.len(), 1);
    }
}
