//! Fulfillment state machine.
//!
//! Drives a gift from initiation to `SENT`:
//!
//! ```text
//! SELECTING -> INITIATED -> AWAITING_FUNDING -> FUNDED -> SWAPPING -> ESCROW_FUNDING -> SENT
//!                                                     \________________/
//! ```
//!
//! with `FAILED` reachable from every non-terminal state. Every transition
//! is persisted before the next step starts, so [`FulfillmentMachine::resume`]
//! can pick a gift up where it stopped.

use crate::assets::AssetRegistry;
use crate::chains::{is_valid_address, SettlementNetwork};
use crate::config::GiftConfig;
use crate::error::GiftError;
use crate::escrow::{EscrowController, EscrowIntent};
use crate::funding::{FundingDetector, FundingOutcome};
use crate::notify::{claim_url, ClaimNotice, Notifier};
use crate::onramp::Onramp;
use crate::poll::PollPolicy;
use crate::pricing::{format_usd, FeeBreakdown, FeeEngine, FeeRequest, PriceCache, PriceOracle};
use crate::release::{EscrowRelease, Recovery};
use crate::store::{hash_claim_token, GiftStore};
use crate::swap::{SwapIntent, SwapOrchestrator, SwapVenue};
use crate::types::{
    ClaimPhase, EscrowLegKind, FailurePhase, FailureReason, FrozenQuote, FundingExpectation, Gift,
    GiftContent, GiftId, GiftSecrets, GiftStatus, LegRef, LegStatus, PaymentMethod, Recipient,
    Sender,
};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Longest personal message accepted with a gift.
const MAX_MESSAGE_LEN: usize = 1_000;

/// External collaborators the machine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub network: Arc<dyn SettlementNetwork>,
    pub swap_venue: Arc<dyn SwapVenue>,
    pub onramp: Arc<dyn Onramp>,
    pub notifier: Arc<dyn Notifier>,
    pub oracle: Arc<dyn PriceOracle>,
}

/// Gift parameters chosen by the sender.
#[derive(Debug, Clone, Deserialize)]
pub struct GiftOrder {
    pub content: GiftContent,
    /// Micro-USD.
    pub face_value_usd: u64,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub card_add_on: bool,
    pub recipient: Recipient,
    #[serde(default)]
    pub message: Option<String>,
}

/// Result of a successful initiation.
#[derive(Debug, Clone, Serialize)]
pub struct InitiatedGift {
    pub gift_id: GiftId,
    pub status: GiftStatus,
    pub escrow_address: String,
    pub breakdown: FeeBreakdown,
    pub funding: FundingExpectation,
}

/// Progress of one leg, for status views.
#[derive(Debug, Clone, Serialize)]
pub struct LegView {
    pub index: u32,
    pub asset: String,
    pub amount: u64,
    pub status: LegStatus,
    pub signature: Option<String>,
}

/// Sender-facing gift status.
#[derive(Debug, Clone, Serialize)]
pub struct GiftStatusView {
    pub gift_id: GiftId,
    pub status: GiftStatus,
    pub sub_status: String,
    pub breakdown: Option<FeeBreakdown>,
    pub funding: Option<FundingExpectation>,
    pub swap_legs: Vec<LegView>,
    pub escrow_legs: Vec<LegView>,
    pub claim_phase: ClaimPhase,
    pub failure: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What [`FulfillmentMachine::resume`] picked up.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResumeReport {
    pub detectors_started: usize,
    pub advanced: usize,
    /// Submitted swap and escrow legs checked again by signature.
    pub legs_rechecked: usize,
    /// Claims and refunds interrupted mid-release and settled.
    pub releases_recovered: usize,
    pub buffers_returned: usize,
    pub notifications_sent: usize,
}

pub struct FulfillmentMachine {
    config: GiftConfig,
    store: Arc<GiftStore>,
    registry: Arc<AssetRegistry>,
    fees: FeeEngine,
    network: Arc<dyn SettlementNetwork>,
    onramp: Arc<dyn Onramp>,
    notifier: Arc<dyn Notifier>,
    detector: Arc<FundingDetector>,
    swaps: SwapOrchestrator,
    escrow: EscrowController,
    release: EscrowRelease,
    /// Cancellation handles of running funding detectors.
    detectors: Mutex<HashMap<GiftId, watch::Sender<bool>>>,
    /// Gifts whose claim e-mail is being sent right now.
    notifying: Mutex<HashSet<GiftId>>,
}

/// 32 random bytes, base58.
fn new_claim_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bs58::encode(bytes).into_string()
}

fn is_plausible_email(email: &str) -> bool {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}

impl FulfillmentMachine {
    pub fn new(
        config: GiftConfig,
        store: Arc<GiftStore>,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>, GiftError> {
        let registry = Arc::new(AssetRegistry::from_config(&config.assets)?);
        registry.get(&config.basket_funding_mint)?;

        let prices = Arc::new(PriceCache::new(
            collaborators.oracle,
            registry.clone(),
            config.fees.price_ttl,
        ));
        let fees = FeeEngine::new(
            registry.clone(),
            prices.clone(),
            config.fees.clone(),
            config.basket_funding_mint.clone(),
        );
        let detector = Arc::new(FundingDetector::new(
            store.clone(),
            collaborators.network.clone(),
            collaborators.onramp.clone(),
            prices,
            registry.clone(),
            config.funding.clone(),
        ));
        let policy = PollPolicy::from(&config.confirmation);
        let swaps = SwapOrchestrator::new(
            collaborators.swap_venue,
            registry.clone(),
            config.swap.slippage_bps,
            policy,
        );
        let escrow = EscrowController::new(collaborators.network.clone(), registry.clone(), policy);
        let release = EscrowRelease::new(store.clone(), collaborators.network.clone());

        Ok(Arc::new(Self {
            config,
            store,
            registry,
            fees,
            network: collaborators.network,
            onramp: collaborators.onramp,
            notifier: collaborators.notifier,
            detector,
            swaps,
            escrow,
            release,
            detectors: Mutex::new(HashMap::new()),
            notifying: Mutex::new(HashSet::new()),
        }))
    }

    pub fn store(&self) -> &Arc<GiftStore> {
        &self.store
    }

    pub fn network(&self) -> &Arc<dyn SettlementNetwork> {
        &self.network
    }

    pub fn registry(&self) -> &AssetRegistry {
        &self.registry
    }

    fn funding_mint<'a>(&'a self, gift: &'a Gift) -> &'a str {
        gift.funding_mint(&self.config.basket_funding_mint)
    }

    /// Price an order for `sender_wallet` without creating anything.
    pub async fn quote(
        &self,
        user_id: &str,
        sender_wallet: Option<&str>,
        content: &GiftContent,
        face_value_usd: u64,
        payment_method: PaymentMethod,
        card_add_on: bool,
    ) -> Result<FrozenQuote, GiftError> {
        let mut sender_token_accounts = BTreeSet::new();
        if let Some(wallet) = sender_wallet {
            for entry in content.entries() {
                let asset = self.registry.get(&entry.mint)?;
                if !asset.is_native() && self.network.token_account_exists(wallet, asset).await? {
                    sender_token_accounts.insert(asset.mint.clone());
                }
            }
        }

        let request = FeeRequest {
            face_value_usd,
            content: content.clone(),
            card_add_on,
            payment_method,
            sender_token_accounts,
            credit_available: self.store.has_usable_credit(user_id, Utc::now()).await,
        };

        self.fees.quote(&request).await
    }

    /// Create a gift, freeze its fees and start waiting for funding.
    pub async fn initiate(
        self: &Arc<Self>,
        sender: Sender,
        order: GiftOrder,
    ) -> Result<InitiatedGift, GiftError> {
        if !is_valid_address(&sender.wallet) {
            return Err(GiftError::InvalidRequest(format!(
                "Invalid sender wallet: {}",
                sender.wallet
            )));
        }
        if !is_plausible_email(&order.recipient.email) {
            return Err(GiftError::InvalidRequest(
                "Invalid recipient e-mail".to_string(),
            ));
        }
        if order
            .message
            .as_ref()
            .is_some_and(|m| m.chars().count() > MAX_MESSAGE_LEN)
        {
            return Err(GiftError::InvalidRequest(format!(
                "Message longer than {} characters",
                MAX_MESSAGE_LEN
            )));
        }

        let quote = self
            .quote(
                &sender.user_id,
                Some(&sender.wallet),
                &order.content,
                order.face_value_usd,
                order.payment_method,
                order.card_add_on,
            )
            .await?;
        if quote.snapshot.degraded {
            warn!("Initiating gift with degraded pricing");
        }

        let now = Utc::now();
        let escrow = self.network.generate_escrow()?;
        let claim_token = new_claim_token();

        let mut gift = Gift {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
            recipient: Recipient {
                email: order.recipient.email.trim().to_string(),
                name: order.recipient.name,
            },
            message: order.message,
            content: order.content,
            face_value_usd: order.face_value_usd,
            payment_method: order.payment_method,
            card_add_on: order.card_add_on,
            status: GiftStatus::Selecting,
            quote: None,
            funding: None,
            escrow_address: escrow.public_key.clone(),
            claim_token_hash: hash_claim_token(&claim_token),
            secrets: GiftSecrets {
                claim_token,
                escrow,
            },
            swap_legs: Vec::new(),
            escrow_legs: Vec::new(),
            claim: Default::default(),
            failure: None,
            credit_consumed: false,
            created_at: now,
            updated_at: now,
            funded_at: None,
            sent_at: None,
            notified_at: None,
        };
        gift.quote = Some(quote);
        gift.transition(GiftStatus::Initiated, now)?;
        let gift_id = gift.id.clone();
        let funding_mint = self.funding_mint(&gift).to_string();

        self.store.insert(gift.clone()).await?;
        info!(gift_id = %gift_id, "Gift initiated, fees frozen");

        let expectation = match self.funding_expectation(&gift, &funding_mint).await {
            Ok(expectation) => expectation,
            Err(e) => {
                self.fail(&gift_id, FailurePhase::Funding, &e).await;
                return Err(e);
            }
        };

        let expectation = self
            .store
            .try_update(&gift_id, |gift| {
                gift.transition(GiftStatus::AwaitingFunding, Utc::now())?;
                gift.funding = Some(expectation.clone());
                Ok(expectation)
            })
            .await?;
        info!(gift_id = %gift_id, "Awaiting funding of {}", format_usd(expectation.expected_usd));

        self.spawn_detector(gift_id.clone(), expectation.clone());

        let breakdown = gift
            .quote
            .map(|q| q.breakdown)
            .ok_or_else(|| GiftError::Internal("Quote missing after initiation".to_string()))?;

        Ok(InitiatedGift {
            gift_id,
            status: GiftStatus::AwaitingFunding,
            escrow_address: gift.escrow_address,
            breakdown,
            funding: expectation,
        })
    }

    async fn funding_expectation(
        &self,
        gift: &Gift,
        funding_mint: &str,
    ) -> Result<FundingExpectation, GiftError> {
        let breakdown = gift
            .breakdown()
            .ok_or_else(|| GiftError::Internal(format!("Gift {} has no frozen quote", gift.id)))?;

        let mut expectation = FundingExpectation {
            expected_usd: breakdown.expected_deposit_usd(),
            funding_mint: funding_mint.to_string(),
            wallet: gift.sender.wallet.clone(),
            baseline: 0,
            threshold_bps: self.detector.threshold_bps(),
            onramp_reference: None,
            onramp_url: None,
        };

        match gift.payment_method {
            PaymentMethod::DirectAssetTransfer => {
                self.detector.ensure_sufficient_balance(&expectation).await?;
            }
            PaymentMethod::CardOnramp => {
                expectation.baseline = self.detector.balance(&expectation).await?;
                let asset = self.registry.get(funding_mint)?;
                expectation.onramp_url = Some(self.onramp.funding_url(
                    &gift.sender.wallet,
                    asset,
                    breakdown.total_usd,
                    &gift.id,
                )?);
                expectation.onramp_reference = Some(gift.id.clone());
            }
        }

        Ok(expectation)
    }

    fn spawn_detector(self: &Arc<Self>, gift_id: GiftId, expectation: FundingExpectation) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        if let Ok(mut detectors) = self.detectors.lock() {
            if let Some(previous) = detectors.insert(gift_id.clone(), cancel_tx) {
                let _ = previous.send(true);
            }
        }

        let machine = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = machine
                .detector
                .watch(&gift_id, &expectation, cancel_rx)
                .await;
            machine.on_funding_outcome(&gift_id, outcome).await;
        });
    }

    fn stop_detector(&self, gift_id: &str) {
        if let Ok(mut detectors) = self.detectors.lock() {
            if let Some(cancel) = detectors.remove(gift_id) {
                let _ = cancel.send(true);
            }
        }
    }

    /// Number of funding detectors currently running.
    pub fn active_detectors(&self) -> usize {
        self.detectors.lock().map(|d| d.len()).unwrap_or(0)
    }

    async fn on_funding_outcome(self: &Arc<Self>, gift_id: &str, outcome: FundingOutcome) {
        if let Ok(mut detectors) = self.detectors.lock() {
            detectors.remove(gift_id);
        }

        match outcome {
            FundingOutcome::Confirmed(_) => {
                if let Err(e) = self.confirm_funding(gift_id).await {
                    error!(gift_id = %gift_id, "Failed to advance funded gift: {}", e);
                }
            }
            FundingOutcome::TimedOut { attempts } => {
                self.fail(
                    gift_id,
                    FailurePhase::Funding,
                    &GiftError::FundingTimeout { attempts },
                )
                .await;
            }
            FundingOutcome::Failed(e) => {
                self.fail(gift_id, FailurePhase::Funding, &e).await;
            }
            FundingOutcome::Stopped => {}
        }
    }

    /// Record that funding arrived. Signals for a gift already past
    /// `AWAITING_FUNDING` are ignored.
    pub async fn confirm_funding(&self, gift_id: &str) -> Result<GiftStatus, GiftError> {
        let now = Utc::now();
        let funded = self
            .store
            .try_update(gift_id, |gift| {
                if gift.status != GiftStatus::AwaitingFunding {
                    return Ok(false);
                }
                gift.transition(GiftStatus::Funded, now)?;
                Ok(true)
            })
            .await?;

        if !funded {
            let gift = self.store.get(gift_id).await?;
            debug!(gift_id = %gift_id, "Duplicate funding signal ignored ({})", gift.status);
            return Ok(gift.status);
        }

        info!(gift_id = %gift_id, "Gift funded");
        self.stop_detector(gift_id);

        if self.store.consume_credit(gift_id, now).await? {
            info!(gift_id = %gift_id, "Onramp credit consumed");
        }

        self.advance_funded(gift_id).await
    }

    /// `FUNDED -> SWAPPING`, or straight to `ESCROW_FUNDING` when nothing
    /// needs converting.
    async fn advance_funded(&self, gift_id: &str) -> Result<GiftStatus, GiftError> {
        let result = self
            .store
            .try_update(gift_id, |gift| {
                gift.expect_status(GiftStatus::Funded)?;
                let funding_mint = self.funding_mint(gift).to_string();
                let legs = self.swaps.plan_legs(gift, &funding_mint)?;
                let now = Utc::now();

                if legs.is_empty() {
                    gift.escrow_legs = self.escrow.plan_legs(gift, &funding_mint)?;
                    gift.transition(GiftStatus::EscrowFunding, now)?;
                } else {
                    gift.swap_legs = legs;
                    gift.transition(GiftStatus::Swapping, now)?;
                }
                Ok(gift.status)
            })
            .await;

        match result {
            Ok(status) => {
                info!(gift_id = %gift_id, "Gift is now {}", status);
                Ok(status)
            }
            Err(e) => {
                self.fail(gift_id, FailurePhase::Swapping, &e).await;
                Err(e)
            }
        }
    }

    /// Unsigned swaps for every leg still pending.
    pub async fn pending_swap_intents(&self, gift_id: &str) -> Result<Vec<SwapIntent>, GiftError> {
        let gift = self.store.get(gift_id).await?;
        gift.expect_status(GiftStatus::Swapping)?;

        let intents = match self.swaps.pending_intents(&gift).await {
            Ok(intents) => intents,
            Err(e @ GiftError::SwapLegFailed { .. }) => {
                self.fail_leg(gift_id, &e).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.store
            .update(gift_id, |gift| {
                for intent in &intents {
                    if let Some(leg) = gift
                        .swap_legs
                        .iter_mut()
                        .find(|l| l.index == intent.leg && l.status == LegStatus::Pending)
                    {
                        leg.quoted_output = Some(intent.quoted_output);
                    }
                }
            })
            .await?;

        Ok(intents)
    }

    /// Confirm a signed swap leg. Completes the swap phase once every leg
    /// is confirmed.
    pub async fn confirm_swap_leg(
        &self,
        gift_id: &str,
        leg_index: u32,
        signature: &str,
    ) -> Result<GiftStatus, GiftError> {
        let leg = self
            .store
            .try_update_leg(gift_id, LegRef::Swap(leg_index), signature, |gift| {
                let status = gift.status;
                let leg = gift
                    .swap_legs
                    .iter_mut()
                    .find(|l| l.index == leg_index)
                    .ok_or(GiftError::UnknownLeg(leg_index))?;
                if leg.status == LegStatus::Confirmed {
                    return Ok(None);
                }
                if status != GiftStatus::Swapping {
                    return Err(GiftError::InvalidState {
                        expected: GiftStatus::Swapping.to_string(),
                        actual: status.to_string(),
                    });
                }
                leg.signature = Some(signature.to_string());
                leg.status = LegStatus::Submitted;
                Ok(Some(leg.clone()))
            })
            .await?;

        let Some(leg) = leg else {
            debug!(gift_id = %gift_id, "Swap leg {} already confirmed", leg_index);
            return Ok(self.store.get(gift_id).await?.status);
        };

        let output = match self.swaps.confirm_leg(&leg, signature).await {
            Ok(output) => output,
            Err(e) => {
                self.fail_leg(gift_id, &e).await;
                return Err(e);
            }
        };

        let result = self
            .store
            .try_update(gift_id, |gift| {
                if let Some(leg) = gift.swap_legs.iter_mut().find(|l| l.index == leg_index) {
                    leg.status = LegStatus::Confirmed;
                    leg.output_amount = output;
                }
                gift.updated_at = Utc::now();

                let all_confirmed = gift
                    .swap_legs
                    .iter()
                    .all(|l| l.status == LegStatus::Confirmed);
                if all_confirmed && gift.status == GiftStatus::Swapping {
                    let funding_mint = self.funding_mint(gift).to_string();
                    gift.escrow_legs = self.escrow.plan_legs(gift, &funding_mint)?;
                    gift.transition(GiftStatus::EscrowFunding, Utc::now())?;
                }
                Ok(gift.status)
            })
            .await;

        match result {
            Ok(status) => {
                info!(gift_id = %gift_id, "Swap leg {} confirmed, gift is {}", leg_index, status);
                Ok(status)
            }
            Err(e) => {
                self.fail(gift_id, FailurePhase::Swapping, &e).await;
                Err(e)
            }
        }
    }

    async fn fail_leg(&self, gift_id: &str, err: &GiftError) {
        if let GiftError::SwapLegFailed { leg, .. } = err {
            let leg = *leg;
            if let Err(e) = self
                .store
                .update(gift_id, |gift| {
                    if let Some(l) = gift.swap_legs.iter_mut().find(|l| l.index == leg) {
                        l.status = LegStatus::Failed;
                    }
                })
                .await
            {
                error!(gift_id = %gift_id, "Could not mark swap leg {} failed: {}", leg, e);
            }
        }
        self.fail(gift_id, FailurePhase::Swapping, err).await;
    }

    /// Unsigned sender -> escrow transfers for every pending escrow leg.
    pub async fn pending_escrow_transfers(
        &self,
        gift_id: &str,
    ) -> Result<Vec<EscrowIntent>, GiftError> {
        let gift = self.store.get(gift_id).await?;
        gift.expect_status(GiftStatus::EscrowFunding)?;
        self.escrow.pending_transfers(&gift).await
    }

    /// Confirm a signed escrow transfer. The gift is `SENT` once every leg,
    /// buffer included, is confirmed and the escrow holds all of them; the
    /// claim e-mail follows.
    ///
    /// A signature already recorded against any other leg is rejected. A
    /// confirmed transaction that did not fund the escrow leaves the leg
    /// pending so the sender can submit the real transfer.
    pub async fn fund_escrow_leg(
        &self,
        gift_id: &str,
        leg_index: u32,
        signature: &str,
    ) -> Result<GiftStatus, GiftError> {
        let submitted = self
            .store
            .try_update_leg(gift_id, LegRef::Escrow(leg_index), signature, |gift| {
                let status = gift.status;
                let leg = gift
                    .escrow_legs
                    .iter_mut()
                    .find(|l| l.index == leg_index)
                    .ok_or(GiftError::UnknownLeg(leg_index))?;
                if leg.status == LegStatus::Confirmed {
                    return Ok(None);
                }
                if status != GiftStatus::EscrowFunding {
                    return Err(GiftError::InvalidState {
                        expected: GiftStatus::EscrowFunding.to_string(),
                        actual: status.to_string(),
                    });
                }
                leg.signature = Some(signature.to_string());
                leg.status = LegStatus::Submitted;
                let leg = leg.clone();
                Ok(Some((gift.clone(), leg)))
            })
            .await?;

        let Some((gift, leg)) = submitted else {
            debug!(gift_id = %gift_id, "Escrow leg {} already confirmed", leg_index);
            return Ok(self.store.get(gift_id).await?.status);
        };

        if let Err(e) = self.escrow.confirm_leg(&gift, &leg, signature).await {
            self.on_escrow_leg_error(gift_id, leg_index, &e).await;
            return Err(e);
        }

        let (status, all_confirmed) = self
            .store
            .try_update(gift_id, |gift| {
                if let Some(l) = gift.escrow_legs.iter_mut().find(|l| l.index == leg_index) {
                    l.status = LegStatus::Confirmed;
                }
                gift.updated_at = Utc::now();
                let all_confirmed = gift
                    .escrow_legs
                    .iter()
                    .all(|l| l.status == LegStatus::Confirmed);
                Ok((gift.status, all_confirmed))
            })
            .await?;

        info!(gift_id = %gift_id, "Escrow leg {} confirmed, gift is {}", leg_index, status);

        if all_confirmed && status == GiftStatus::EscrowFunding {
            return self.finish_escrow_funding(gift_id).await;
        }
        Ok(status)
    }

    /// Record what a failed leg confirmation means for the leg and the gift.
    async fn on_escrow_leg_error(&self, gift_id: &str, leg_index: u32, err: &GiftError) {
        let next = match err {
            GiftError::TransferMismatch(_) => LegStatus::Pending,
            // Stays submitted; resume checks the signature again.
            e if e.is_transient() => {
                warn!(gift_id = %gift_id, "Escrow leg {} not verified yet: {}", leg_index, e);
                return;
            }
            _ => LegStatus::Failed,
        };

        if let Err(e) = self
            .store
            .update(gift_id, |gift| {
                if let Some(l) = gift.escrow_legs.iter_mut().find(|l| l.index == leg_index) {
                    l.status = next;
                    if next == LegStatus::Pending {
                        l.signature = None;
                    }
                }
            })
            .await
        {
            error!(
                gift_id = %gift_id,
                "Could not mark escrow leg {} {:?}: {}", leg_index, next, e
            );
        }

        match next {
            LegStatus::Failed => self.fail(gift_id, FailurePhase::EscrowFunding, err).await,
            _ => warn!(gift_id = %gift_id, "Escrow leg {} rejected: {}", leg_index, err),
        }
    }

    /// `ESCROW_FUNDING -> SENT` once the escrow is seen holding every leg,
    /// then send the claim e-mail.
    async fn finish_escrow_funding(&self, gift_id: &str) -> Result<GiftStatus, GiftError> {
        let gift = self.store.get(gift_id).await?;
        if let Err(e) = self.escrow.verify_holdings(&gift).await {
            if !e.is_transient() {
                self.fail(gift_id, FailurePhase::EscrowFunding, &e).await;
            }
            return Err(e);
        }

        let status = self
            .store
            .try_update(gift_id, |gift| {
                let all_confirmed = gift
                    .escrow_legs
                    .iter()
                    .all(|l| l.status == LegStatus::Confirmed);
                if all_confirmed && gift.status == GiftStatus::EscrowFunding {
                    gift.transition(GiftStatus::Sent, Utc::now())?;
                }
                Ok(gift.status)
            })
            .await?;

        if status == GiftStatus::Sent {
            info!(gift_id = %gift_id, "Escrow funded, gift sent");
            if let Err(e) = self.notify(gift_id).await {
                error!(gift_id = %gift_id, "Claim e-mail not sent, will retry on resume: {}", e);
            }
        }

        Ok(status)
    }

    /// Send the claim e-mail unless it already went out. Returns whether an
    /// e-mail was sent by this call.
    pub async fn notify(&self, gift_id: &str) -> Result<bool, GiftError> {
        let claimed_slot = self
            .notifying
            .lock()
            .map(|mut set| set.insert(gift_id.to_string()))
            .unwrap_or(false);
        if !claimed_slot {
            debug!(gift_id = %gift_id, "Claim e-mail already in flight");
            return Ok(false);
        }

        let result = self.notify_inner(gift_id).await;

        if let Ok(mut set) = self.notifying.lock() {
            set.remove(gift_id);
        }
        result
    }

    async fn notify_inner(&self, gift_id: &str) -> Result<bool, GiftError> {
        let gift = self.store.get(gift_id).await?;
        if gift.status != GiftStatus::Sent || gift.notified_at.is_some() {
            return Ok(false);
        }

        let notice = ClaimNotice {
            gift_id: gift.id.clone(),
            to: gift.recipient.email.clone(),
            recipient_name: gift.recipient.name.clone(),
            sender_name: gift.sender.display_name.clone(),
            message: gift.message.clone(),
            face_value_usd: gift.face_value_usd,
            claim_url: claim_url(&self.config.claim_base_url, &gift.secrets.claim_token),
        };
        self.notifier.send_claim(&notice).await?;

        let now = Utc::now();
        self.store
            .update(gift_id, |gift| {
                gift.notified_at = Some(now);
                gift.updated_at = now;
            })
            .await?;

        info!(gift_id = %gift_id, "Recipient notified");
        Ok(true)
    }

    /// Sender cancellation. Only possible before any funds have moved.
    pub async fn cancel(&self, gift_id: &str) -> Result<GiftStatus, GiftError> {
        self.store
            .try_update(gift_id, |gift| match gift.status {
                GiftStatus::Selecting | GiftStatus::Initiated | GiftStatus::AwaitingFunding => {
                    gift.fail(FailureReason::cancelled(), Utc::now());
                    Ok(())
                }
                other => Err(GiftError::InvalidState {
                    expected: "a gift that has not been funded".to_string(),
                    actual: other.to_string(),
                }),
            })
            .await?;

        self.stop_detector(gift_id);
        info!(gift_id = %gift_id, "Gift cancelled by sender");
        Ok(GiftStatus::Failed)
    }

    /// Move a gift to `FAILED` (no-op if already terminal).
    pub async fn fail(&self, gift_id: &str, phase: FailurePhase, err: &GiftError) {
        let reason = FailureReason::from_error(phase, err);
        match self
            .store
            .update(gift_id, |gift| gift.fail(reason, Utc::now()))
            .await
        {
            Ok(true) => {
                error!(gift_id = %gift_id, "Gift failed during {:?}: {}", phase, err);
                self.stop_detector(gift_id);
            }
            Ok(false) => debug!(gift_id = %gift_id, "Gift already terminal, not failing: {}", err),
            Err(e) => error!(gift_id = %gift_id, "Could not record failure ({}): {}", err, e),
        }
    }

    /// Sender-facing status with a human readable sub-status.
    pub async fn get_status(&self, gift_id: &str) -> Result<GiftStatusView, GiftError> {
        let gift = self.store.get(gift_id).await?;
        Ok(status_view(&gift, Utc::now()))
    }

    /// Load a gift on behalf of its sender.
    pub async fn sender_gift(&self, gift_id: &str, user_id: &str) -> Result<Gift, GiftError> {
        let gift = self.store.get(gift_id).await?;
        if gift.sender.user_id != user_id {
            return Err(GiftError::Forbidden);
        }
        Ok(gift)
    }

    /// Pick up in-progress gifts after a restart.
    pub async fn resume(self: &Arc<Self>) -> ResumeReport {
        let mut report = ResumeReport::default();

        for gift in self.store.with_status(GiftStatus::AwaitingFunding).await {
            match gift.funding.clone() {
                Some(expectation) => {
                    self.spawn_detector(gift.id.clone(), expectation);
                    report.detectors_started += 1;
                }
                None => {
                    let err = GiftError::Internal("Awaiting funding without expectation".into());
                    self.fail(&gift.id, FailurePhase::Funding, &err).await;
                }
            }
        }

        for gift in self.store.with_status(GiftStatus::Funded).await {
            if self.advance_funded(&gift.id).await.is_ok() {
                report.advanced += 1;
            }
        }

        report.legs_rechecked += self.recheck_swap_legs().await;
        report.legs_rechecked += self.recheck_escrow_legs().await;

        let interrupted = self
            .store
            .find(|g| matches!(g.claim.phase, ClaimPhase::InFlight | ClaimPhase::Refunding))
            .await;
        for gift in interrupted {
            match self.release.recover(&gift).await {
                Ok(Recovery::Completed(signature)) => {
                    info!(gift_id = %gift.id, "Interrupted release settled: {}", signature);
                    report.releases_recovered += 1;
                }
                Ok(Recovery::Reopened) => report.releases_recovered += 1,
                Ok(Recovery::Untouched) => {}
                Err(e) => warn!(gift_id = %gift.id, "Could not settle interrupted release: {}", e),
            }
        }

        report.buffers_returned = self.release.return_pending_buffers().await;

        let unnotified = self
            .store
            .find(|g| g.status == GiftStatus::Sent && g.notified_at.is_none())
            .await;
        for gift in unnotified {
            match self.notify(&gift.id).await {
                Ok(true) => report.notifications_sent += 1,
                Ok(false) => {}
                Err(e) => warn!(gift_id = %gift.id, "Claim e-mail retry failed: {}", e),
            }
        }

        info!(
            "Resumed: {} funding detectors, {} funded gifts advanced, {} legs rechecked, \
             {} releases settled, {} buffers returned, {} e-mails sent",
            report.detectors_started,
            report.advanced,
            report.legs_rechecked,
            report.releases_recovered,
            report.buffers_returned,
            report.notifications_sent
        );
        report
    }

    /// Confirm swap legs that were submitted before the restart.
    async fn recheck_swap_legs(&self) -> usize {
        let mut rechecked = 0;
        for gift in self.store.with_status(GiftStatus::Swapping).await {
            for leg in gift.swap_legs.iter().filter(|l| l.status == LegStatus::Submitted) {
                let Some(signature) = &leg.signature else {
                    continue;
                };
                rechecked += 1;
                if let Err(e) = self.confirm_swap_leg(&gift.id, leg.index, signature).await {
                    warn!(gift_id = %gift.id, "Swap leg {} recheck failed: {}", leg.index, e);
                    break;
                }
            }
        }
        rechecked
    }

    /// Confirm escrow legs that were submitted before the restart, and finish
    /// gifts whose legs all confirmed but never reached `SENT`.
    async fn recheck_escrow_legs(&self) -> usize {
        let mut rechecked = 0;
        for gift in self.store.with_status(GiftStatus::EscrowFunding).await {
            let submitted: Vec<_> = gift
                .escrow_legs
                .iter()
                .filter(|l| l.status == LegStatus::Submitted)
                .filter_map(|l| Some((l.index, l.signature.clone()?)))
                .collect();

            if submitted.is_empty() {
                let all_confirmed = !gift.escrow_legs.is_empty()
                    && gift
                        .escrow_legs
                        .iter()
                        .all(|l| l.status == LegStatus::Confirmed);
                if all_confirmed {
                    if let Err(e) = self.finish_escrow_funding(&gift.id).await {
                        warn!(gift_id = %gift.id, "Could not finish escrow funding: {}", e);
                    }
                }
                continue;
            }

            for (index, signature) in submitted {
                rechecked += 1;
                if let Err(e) = self.fund_escrow_leg(&gift.id, index, &signature).await {
                    warn!(gift_id = %gift.id, "Escrow leg {} recheck failed: {}", index, e);
                }
            }
        }
        rechecked
    }
}

fn leg_progress(done: usize, total: usize, what: &str) -> String {
    if done >= total {
        format!("all {} {}s confirmed", total, what)
    } else {
        format!("{} {} of {} pending", what, done + 1, total)
    }
}

/// Build the sender-facing view of a gift.
pub fn status_view(gift: &Gift, now: DateTime<Utc>) -> GiftStatusView {
    let swaps_done = gift
        .swap_legs
        .iter()
        .filter(|l| l.status == LegStatus::Confirmed)
        .count();
    let escrow_done = gift
        .escrow_legs
        .iter()
        .filter(|l| l.status == LegStatus::Confirmed)
        .count();

    let sub_status = match gift.status {
        GiftStatus::Selecting => "selecting basket".to_string(),
        GiftStatus::Initiated => "fees frozen, preparing funding".to_string(),
        GiftStatus::AwaitingFunding => match &gift.funding {
            Some(f) => format!("waiting for a {} deposit", format_usd(f.expected_usd)),
            None => "waiting for funding".to_string(),
        },
        GiftStatus::Funded => "funded, preparing swaps".to_string(),
        GiftStatus::Swapping => leg_progress(swaps_done, gift.swap_legs.len(), "swap leg"),
        GiftStatus::EscrowFunding => {
            leg_progress(escrow_done, gift.escrow_legs.len(), "escrow transfer")
        }
        GiftStatus::Sent => match gift.claim.phase {
            ClaimPhase::Claimed => "claimed by recipient".to_string(),
            ClaimPhase::InFlight => "claim in progress".to_string(),
            ClaimPhase::Refunding => "refund in progress".to_string(),
            ClaimPhase::Refunded => "unclaimed, refunded to sender".to_string(),
            ClaimPhase::Open => match gift.claim.lock_remaining(now) {
                Some(remaining) => format!(
                    "claims locked for {} more minutes",
                    (remaining.num_seconds().max(1) as u64).div_ceil(60)
                ),
                None if gift.notified_at.is_none() => "sending claim e-mail".to_string(),
                None => "waiting for recipient to claim".to_string(),
            },
        },
        GiftStatus::Failed => match &gift.failure {
            Some(f) => format!("failed during {:?} phase: {}", f.phase, f.detail).to_lowercase(),
            None => "failed".to_string(),
        },
    };

    let leg_view = |index: u32, asset: &str, amount: u64, status: LegStatus, sig: &Option<String>| LegView {
        index,
        asset: asset.to_string(),
        amount,
        status,
        signature: sig.clone(),
    };

    GiftStatusView {
        gift_id: gift.id.clone(),
        status: gift.status,
        sub_status,
        breakdown: gift.breakdown().cloned(),
        funding: gift.funding.clone(),
        swap_legs: gift
            .swap_legs
            .iter()
            .map(|l| leg_view(l.index, &l.output_mint, l.input_amount, l.status, &l.signature))
            .collect(),
        escrow_legs: gift
            .escrow_legs
            .iter()
            .map(|l| {
                let asset = match l.kind {
                    EscrowLegKind::Asset => l.asset.symbol.clone(),
                    EscrowLegKind::SettlementBuffer => format!("{} (buffer)", l.asset.symbol),
                };
                leg_view(l.index, &asset, l.amount, l.status, &l.signature)
            })
            .collect(),
        claim_phase: gift.claim.phase,
        failure: gift.failure.clone(),
        created_at: gift.created_at,
        updated_at: gift.updated_at,
    }
}
