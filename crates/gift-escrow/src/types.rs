//! Core types for the gift pipeline.

use crate::error::GiftError;
use crate::pricing::{FeeBreakdown, PriceSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Gift identifier (UUID v4).
pub type GiftId = String;

/// Identity provider user id.
pub type UserId = String;

/// Basis-point denominator (100% = 10 000 bps).
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Mint address used for native SOL.
pub const NATIVE_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// An asset on the settlement network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub mint: String,
    pub decimals: u8,
}

impl Asset {
    /// Whether this is the native settlement asset (no token account needed).
    pub fn is_native(&self) -> bool {
        self.mint == NATIVE_SOL_MINT
    }
}

/// How the sender funds a gift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Sender already holds the funding asset.
    DirectAssetTransfer,
    /// Sender buys the funding asset through the fiat onramp.
    CardOnramp,
}

/// One asset of a basket with its share of the face value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasketEntry {
    pub mint: String,
    pub weight_bps: u32,
}

/// What the recipient receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GiftContent {
    Single { mint: String },
    Basket { entries: Vec<BasketEntry> },
}

impl GiftContent {
    /// Entries with weights; a single asset carries the full 10 000 bps.
    pub fn entries(&self) -> Vec<BasketEntry> {
        match self {
            GiftContent::Single { mint } => vec![BasketEntry {
                mint: mint.clone(),
                weight_bps: BPS_DENOMINATOR as u32,
            }],
            GiftContent::Basket { entries } => entries.clone(),
        }
    }

    /// Asset the sender funds the gift with. A single-asset gift is funded in
    /// that asset directly, so it never needs a swap.
    pub fn funding_mint<'a>(&'a self, basket_funding_mint: &'a str) -> &'a str {
        match self {
            GiftContent::Single { mint } => mint,
            GiftContent::Basket { .. } => basket_funding_mint,
        }
    }

    /// Check weights and duplicates.
    pub fn validate(&self) -> Result<(), GiftError> {
        let entries = self.entries();
        if entries.is_empty() {
            return Err(GiftError::InvalidRequest("basket is empty".into()));
        }

        let mut seen = HashSet::new();
        let mut total: u64 = 0;
        for entry in &entries {
            if entry.weight_bps == 0 {
                return Err(GiftError::InvalidRequest(format!(
                    "basket entry {} has zero weight",
                    entry.mint
                )));
            }
            if !seen.insert(entry.mint.as_str()) {
                return Err(GiftError::InvalidRequest(format!(
                    "asset {} appears twice in basket",
                    entry.mint
                )));
            }
            total += entry.weight_bps as u64;
        }

        if total != BPS_DENOMINATOR {
            return Err(GiftError::InvalidRequest(format!(
                "basket weights sum to {} bps, expected {}",
                total, BPS_DENOMINATOR
            )));
        }

        Ok(())
    }
}

/// Gift lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GiftStatus {
    Selecting,
    Initiated,
    AwaitingFunding,
    Funded,
    Swapping,
    EscrowFunding,
    Sent,
    Failed,
}

impl GiftStatus {
    /// `SENT` and `FAILED` never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, GiftStatus::Sent | GiftStatus::Failed)
    }

    /// Forward edges of the lifecycle, plus `FAILED` from any live state.
    pub fn can_transition_to(&self, next: GiftStatus) -> bool {
        use GiftStatus::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Selecting, Initiated)
            | (Initiated, AwaitingFunding)
            | (AwaitingFunding, Funded)
            | (Funded, Swapping)
            | (Funded, EscrowFunding)
            | (Swapping, EscrowFunding)
            | (EscrowFunding, Sent) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for GiftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GiftStatus::Selecting => "SELECTING",
            GiftStatus::Initiated => "INITIATED",
            GiftStatus::AwaitingFunding => "AWAITING_FUNDING",
            GiftStatus::Funded => "FUNDED",
            GiftStatus::Swapping => "SWAPPING",
            GiftStatus::EscrowFunding => "ESCROW_FUNDING",
            GiftStatus::Sent => "SENT",
            GiftStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Claim-side progress of a `SENT` gift. "Locked" is derived from
/// [`ClaimSecurity::locked_until`] rather than stored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClaimPhase {
    #[default]
    Open,
    InFlight,
    Claimed,
    Refunding,
    Refunded,
}

/// Claim attempt bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimSecurity {
    pub phase: ClaimPhase,
    /// Identity mismatches since the last lockout.
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    /// Lockouts so far; each one doubles the next lock duration.
    pub lockouts: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_signature: Option<String>,
    pub claimant_wallet: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub refund_signature: Option<String>,
    /// Escrow release signed and stored before it is sent; cleared once the
    /// outcome is recorded.
    #[serde(default)]
    pub pending_release: Option<SignedTransfer>,
    /// When the leftover settlement buffer went back to the sender.
    #[serde(default)]
    pub buffer_returned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub buffer_return_signature: Option<String>,
}

impl ClaimSecurity {
    pub fn is_claimed(&self) -> bool {
        self.phase == ClaimPhase::Claimed
    }

    /// Remaining lock time, if a lock is active at `now`.
    pub fn lock_remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

/// Gift sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub user_id: UserId,
    pub wallet: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Gift recipient. The e-mail address is the only claim credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Progress of a single swap or escrow leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

/// Conversion of part of the funding asset into one basket asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapLeg {
    pub index: u32,
    pub input_mint: String,
    pub output_mint: String,
    /// Input in the funding asset's smallest unit.
    pub input_amount: u64,
    /// Target allocation in micro-USD.
    pub target_usd: u64,
    pub quoted_output: Option<u64>,
    pub output_amount: Option<u64>,
    pub signature: Option<String>,
    pub status: LegStatus,
}

/// Kind of escrow funding transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowLegKind {
    /// A basket asset destined for the recipient.
    Asset,
    /// Native balance that pays for the claim (rent + fees).
    SettlementBuffer,
}

/// Transfer from the sender into the escrow account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowLeg {
    pub index: u32,
    pub kind: EscrowLegKind,
    pub asset: Asset,
    pub amount: u64,
    pub signature: Option<String>,
    pub status: LegStatus,
}

/// A swap or escrow leg of some gift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegRef {
    Swap(u32),
    Escrow(u32),
}

/// What the funding detector waits for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingExpectation {
    /// USD the sender's wallet must receive (total minus processing fee).
    pub expected_usd: u64,
    pub funding_mint: String,
    pub wallet: String,
    /// Balance recorded at creation; growth above it counts as funding.
    pub baseline: u64,
    pub threshold_bps: u32,
    #[serde(default)]
    pub onramp_reference: Option<String>,
    #[serde(default)]
    pub onramp_url: Option<String>,
}

/// Phase a gift was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Pricing,
    Funding,
    Swapping,
    EscrowFunding,
    Cancelled,
}

/// Why a gift entered `FAILED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReason {
    pub phase: FailurePhase,
    pub code: String,
    pub detail: String,
    #[serde(default)]
    pub leg: Option<u32>,
}

impl FailureReason {
    pub fn from_error(phase: FailurePhase, err: &GiftError) -> Self {
        let leg = match err {
            GiftError::SwapLegFailed { leg, .. } => Some(*leg),
            _ => None,
        };
        Self {
            phase,
            code: err.code().to_string(),
            detail: err.to_string(),
            leg,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            phase: FailurePhase::Cancelled,
            code: "CANCELLED".to_string(),
            detail: "Cancelled by sender".to_string(),
            leg: None,
        }
    }
}

/// Escrow keypair. The secret is a base58 32-byte seed.
#[derive(Clone, Serialize, Deserialize)]
pub struct EscrowKeys {
    pub public_key: String,
    pub secret: String,
}

impl std::fmt::Debug for EscrowKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowKeys")
            .field("public_key", &self.public_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Secrets held only in the encrypted store.
#[derive(Clone, Serialize, Deserialize)]
pub struct GiftSecrets {
    /// Claim token (base58); the capability in the claim URL.
    pub claim_token: String,
    pub escrow: EscrowKeys,
}

impl std::fmt::Debug for GiftSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GiftSecrets")
            .field("claim_token", &"[REDACTED]")
            .field("escrow", &self.escrow)
            .finish()
    }
}

/// Fee breakdown and the prices it was computed from, frozen at initiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrozenQuote {
    pub breakdown: FeeBreakdown,
    pub snapshot: PriceSnapshot,
}

/// A gift and everything needed to drive it to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gift {
    pub id: GiftId,
    pub sender: Sender,
    pub recipient: Recipient,
    #[serde(default)]
    pub message: Option<String>,
    pub content: GiftContent,
    pub face_value_usd: u64,
    pub payment_method: PaymentMethod,
    pub card_add_on: bool,
    pub status: GiftStatus,
    #[serde(default)]
    pub quote: Option<FrozenQuote>,
    #[serde(default)]
    pub funding: Option<FundingExpectation>,
    pub escrow_address: String,
    pub secrets: GiftSecrets,
    /// SHA-256 hex of the claim token; the store's lookup key.
    pub claim_token_hash: String,
    #[serde(default)]
    pub swap_legs: Vec<SwapLeg>,
    #[serde(default)]
    pub escrow_legs: Vec<EscrowLeg>,
    #[serde(default)]
    pub claim: ClaimSecurity,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub credit_consumed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
}

impl Gift {
    /// Move to `next`, enforcing the lifecycle graph.
    pub fn transition(&mut self, next: GiftStatus, now: DateTime<Utc>) -> Result<(), GiftError> {
        if !self.status.can_transition_to(next) {
            return Err(GiftError::InvalidState {
                expected: format!("a state that can move to {}", next),
                actual: self.status.to_string(),
            });
        }

        self.status = next;
        self.updated_at = now;
        match next {
            GiftStatus::Funded => self.funded_at = Some(now),
            GiftStatus::Sent => self.sent_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    /// Fail the gift unless it already reached a terminal state.
    /// Returns whether the status changed.
    pub fn fail(&mut self, reason: FailureReason, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = GiftStatus::Failed;
        self.failure = Some(reason);
        self.updated_at = now;
        true
    }

    /// Require the gift to be in `expected`.
    pub fn expect_status(&self, expected: GiftStatus) -> Result<(), GiftError> {
        if self.status != expected {
            return Err(GiftError::InvalidState {
                expected: expected.to_string(),
                actual: self.status.to_string(),
            });
        }
        Ok(())
    }

    /// Funding asset for this gift.
    pub fn funding_mint<'a>(&'a self, basket_funding_mint: &'a str) -> &'a str {
        self.content.funding_mint(basket_funding_mint)
    }

    pub fn breakdown(&self) -> Option<&FeeBreakdown> {
        self.quote.as_ref().map(|q| &q.breakdown)
    }

    /// Signatures recorded against this gift's legs.
    pub fn leg_signatures(&self) -> impl Iterator<Item = (LegRef, &str)> {
        let swaps = self
            .swap_legs
            .iter()
            .filter_map(|l| Some((LegRef::Swap(l.index), l.signature.as_deref()?)));
        let escrow = self
            .escrow_legs
            .iter()
            .filter_map(|l| Some((LegRef::Escrow(l.index), l.signature.as_deref()?)));
        swaps.chain(escrow)
    }
}

/// Transaction status on the settlement network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed { confirmations: u64 },
    Failed { reason: String },
}

/// Unsigned transaction handed to the sender's wallet for signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    /// Base64-encoded serialized transaction.
    pub transaction: String,
    #[serde(default)]
    pub recent_blockhash: Option<String>,
    #[serde(default)]
    pub last_valid_block_height: Option<u64>,
}

/// Escrow-signed transaction, stored before it is sent so its outcome can be
/// looked up after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransfer {
    pub signature: String,
    /// Base64-encoded serialized transaction.
    pub transaction: String,
    pub destination: String,
    pub transfers: Vec<AssetTransfer>,
}

/// An amount of one asset to move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetTransfer {
    pub asset: Asset,
    pub amount: u64,
}

/// Promotional card onramp credits for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnrampCredit {
    pub user_id: UserId,
    pub allowed: u32,
    pub remaining: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_at: DateTime<Utc>,
}

impl OnrampCredit {
    pub fn new(user_id: UserId, allowed: u32, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            user_id,
            allowed,
            remaining: allowed,
            expires_at,
            granted_at: Utc::now(),
        }
    }

    /// Whether a credit can be spent at `now`.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.remaining > 0 && self.expires_at.map_or(true, |exp| exp > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basket_validation() {
        let basket = GiftContent::Basket {
            entries: vec![
                BasketEntry { mint: "A".into(), weight_bps: 6000 },
                BasketEntry { mint: "B".into(), weight_bps: 4000 },
            ],
        };
        assert!(basket.validate().is_ok());

        let short = GiftContent::Basket {
            entries: vec![BasketEntry { mint: "A".into(), weight_bps: 9000 }],
        };
        assert!(matches!(short.validate(), Err(GiftError::InvalidRequest(_))));

        let duplicate = GiftContent::Basket {
            entries: vec![
                BasketEntry { mint: "A".into(), weight_bps: 5000 },
                BasketEntry { mint: "A".into(), weight_bps: 5000 },
            ],
        };
        assert!(duplicate.validate().is_err());

        assert!(GiftContent::Basket { entries: vec![] }.validate().is_err());
        assert!(GiftContent::Single { mint: "A".into() }.validate().is_ok());
    }

    #[test]
    fn test_single_asset_funds_itself() {
        let single = GiftContent::Single { mint: "USDC".into() };
        assert_eq!(single.funding_mint(NATIVE_SOL_MINT), "USDC");

        let basket = GiftContent::Basket {
            entries: vec![BasketEntry { mint: "USDC".into(), weight_bps: 10_000 }],
        };
        assert_eq!(basket.funding_mint(NATIVE_SOL_MINT), NATIVE_SOL_MINT);
    }

    #[test]
    fn test_status_transitions() {
        use GiftStatus::*;
        assert!(Selecting.can_transition_to(Initiated));
        assert!(Funded.can_transition_to(EscrowFunding));
        assert!(Swapping.can_transition_to(Failed));
        assert!(!Sent.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!AwaitingFunding.can_transition_to(Initiated));
        assert!(!AwaitingFunding.can_transition_to(Swapping));
        assert!(!EscrowFunding.can_transition_to(Swapping));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&GiftStatus::AwaitingFunding).unwrap();
        assert_eq!(json, "\"AWAITING_FUNDING\"");
        assert_eq!(GiftStatus::EscrowFunding.to_string(), "ESCROW_FUNDING");
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let secrets = GiftSecrets {
            claim_token: "claim-token-value".into(),
            escrow: EscrowKeys {
                public_key: "EscrowPubkey".into(),
                secret: "escrow-secret-value".into(),
            },
        };
        let debug = format!("{:?}", secrets);
        assert!(!debug.contains("claim-token-value"));
        assert!(!debug.contains("escrow-secret-value"));
        assert!(debug.contains("EscrowPubkey"));
    }

    #[test]
    fn test_credit_usability() {
        let now = Utc::now();
        let mut credit = OnrampCredit::new("user".into(), 1, Some(now + chrono::Duration::days(1)));
        assert!(credit.is_usable(now));

        credit.remaining = 0;
        assert!(!credit.is_usable(now));

        let expired = OnrampCredit::new("user".into(), 3, Some(now - chrono::Duration::seconds(1)));
        assert!(!expired.is_usable(now));
    }
}
