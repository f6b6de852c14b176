//! Gift pipeline configuration.

use crate::types::NATIVE_SOL_MINT;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GiftConfig {
    /// Public base URL for claim links (`{claim_base_url}/claim/{token}`).
    #[serde(default = "default_claim_base_url")]
    pub claim_base_url: String,

    /// Funding asset for baskets. Single-asset gifts are funded in their own asset.
    #[serde(default = "default_basket_funding_mint")]
    pub basket_funding_mint: String,

    /// Supported assets.
    #[serde(default = "default_assets")]
    pub assets: Vec<AssetConfig>,

    #[serde(default)]
    pub fees: FeeConfig,

    #[serde(default)]
    pub funding: FundingConfig,

    #[serde(default)]
    pub confirmation: ConfirmationConfig,

    #[serde(default)]
    pub swap: SwapConfig,

    #[serde(default)]
    pub claim: ClaimConfig,

    #[serde(default)]
    pub refund: RefundConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub solana: SolanaConfig,

    #[serde(default)]
    pub onramp: OnrampConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub email: EmailConfig,
}

fn default_claim_base_url() -> String {
    "https://gifts.example.com".to_string()
}

fn default_basket_funding_mint() -> String {
    NATIVE_SOL_MINT.to_string()
}

fn default_assets() -> Vec<AssetConfig> {
    vec![
        AssetConfig::new("SOL", NATIVE_SOL_MINT, 9, Some(150.0)),
        AssetConfig::new(
            "USDC",
            "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            6,
            Some(1.0),
        ),
        AssetConfig::new(
            "JUP",
            "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN",
            6,
            Some(0.8),
        ),
        AssetConfig::new(
            "BONK",
            "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263",
            5,
            Some(0.00002),
        ),
    ]
}

impl Default for GiftConfig {
    fn default() -> Self {
        Self {
            claim_base_url: default_claim_base_url(),
            basket_funding_mint: default_basket_funding_mint(),
            assets: default_assets(),
            fees: FeeConfig::default(),
            funding: FundingConfig::default(),
            confirmation: ConfirmationConfig::default(),
            swap: SwapConfig::default(),
            claim: ClaimConfig::default(),
            refund: RefundConfig::default(),
            storage: StorageConfig::default(),
            solana: SolanaConfig::default(),
            onramp: OnrampConfig::default(),
            identity: IdentityConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

/// A supported asset and its fallback price.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetConfig {
    pub symbol: String,
    pub mint: String,
    pub decimals: u8,
    /// Served (flagged degraded) when neither the oracle nor the cache has a price.
    #[serde(default)]
    pub default_price_usd: Option<f64>,
}

impl AssetConfig {
    pub fn new(symbol: &str, mint: &str, decimals: u8, default_price_usd: Option<f64>) -> Self {
        Self {
            symbol: symbol.to_string(),
            mint: mint.to_string(),
            decimals,
            default_price_usd,
        }
    }
}

/// Fee schedule. Lamport amounts are settlement-network costs; USD amounts
/// are micro-USD.
#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    /// Rent-exempt minimum of a token account.
    #[serde(default = "default_token_account_rent")]
    pub token_account_rent_lamports: u64,

    /// Rent-exempt minimum of the escrow system account.
    #[serde(default = "default_escrow_account_rent")]
    pub escrow_account_rent_lamports: u64,

    /// Fee per transaction.
    #[serde(default = "default_transaction_fee")]
    pub transaction_fee_lamports: u64,

    /// Swap venue fee on converted value.
    #[serde(default = "default_swap_fee_bps")]
    pub swap_fee_bps: u64,

    /// Card processing fee, card onramp only.
    #[serde(default = "default_card_processing_fee_bps")]
    pub card_processing_fee_bps: u64,

    /// Optional card add-on charge.
    #[serde(default = "default_card_add_on_usd")]
    pub card_add_on_usd: u64,

    #[serde(default = "default_min_face_value")]
    pub min_face_value_usd: u64,

    #[serde(default = "default_max_face_value")]
    pub max_face_value_usd: u64,

    /// How long an oracle price stays fresh.
    #[serde(default = "default_price_ttl", with = "humantime_serde")]
    pub price_ttl: Duration,
}

fn default_token_account_rent() -> u64 {
    2_039_280
}

fn default_escrow_account_rent() -> u64 {
    890_880
}

fn default_transaction_fee() -> u64 {
    5_000
}

fn default_swap_fee_bps() -> u64 {
    50
}

fn default_card_processing_fee_bps() -> u64 {
    450
}

fn default_card_add_on_usd() -> u64 {
    1_000_000
}

fn default_min_face_value() -> u64 {
    1_000_000
}

fn default_max_face_value() -> u64 {
    10_000_000_000
}

fn default_price_ttl() -> Duration {
    Duration::from_secs(30)
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            token_account_rent_lamports: default_token_account_rent(),
            escrow_account_rent_lamports: default_escrow_account_rent(),
            transaction_fee_lamports: default_transaction_fee(),
            swap_fee_bps: default_swap_fee_bps(),
            card_processing_fee_bps: default_card_processing_fee_bps(),
            card_add_on_usd: default_card_add_on_usd(),
            min_face_value_usd: default_min_face_value(),
            max_face_value_usd: default_max_face_value(),
            price_ttl: default_price_ttl(),
        }
    }
}

/// Funding detector cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct FundingConfig {
    #[serde(default = "default_funding_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_funding_attempts")]
    pub max_attempts: u32,

    /// Share of the expected deposit that counts as funded.
    #[serde(default = "default_funding_threshold")]
    pub threshold_bps: u32,
}

fn default_funding_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_funding_attempts() -> u32 {
    360
}

fn default_funding_threshold() -> u32 {
    9_500
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_funding_interval(),
            max_attempts: default_funding_attempts(),
            threshold_bps: default_funding_threshold(),
        }
    }
}

/// Bounded polling for swap and escrow confirmations.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default = "default_confirmation_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_confirmation_attempts")]
    pub max_attempts: u32,
}

fn default_confirmation_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_confirmation_attempts() -> u32 {
    30
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_confirmation_interval(),
            max_attempts: default_confirmation_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwapConfig {
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u16,
}

fn default_slippage_bps() -> u16 {
    50
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            slippage_bps: default_slippage_bps(),
        }
    }
}

/// Claim lockout policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimConfig {
    /// Identity mismatches before a lockout.
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,

    /// First lockout; doubles on every subsequent lockout.
    #[serde(default = "default_lock_duration", with = "humantime_serde")]
    pub lock_duration: Duration,

    #[serde(default = "default_max_lock_duration", with = "humantime_serde")]
    pub max_lock_duration: Duration,

    /// Global claim endpoint rate limit.
    #[serde(default = "default_claims_per_minute")]
    pub requests_per_minute: u32,
}

fn default_max_failed_attempts() -> u32 {
    3
}

fn default_lock_duration() -> Duration {
    Duration::from_secs(4 * 60 * 60)
}

fn default_max_lock_duration() -> Duration {
    Duration::from_secs(48 * 60 * 60)
}

fn default_claims_per_minute() -> u32 {
    60
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: default_max_failed_attempts(),
            lock_duration: default_lock_duration(),
            max_lock_duration: default_max_lock_duration(),
            requests_per_minute: default_claims_per_minute(),
        }
    }
}

/// Unclaimed-gift refund sweep.
#[derive(Debug, Clone, Deserialize)]
pub struct RefundConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Age (from creation) after which an unclaimed gift is returned.
    #[serde(default = "default_unclaimed_after", with = "humantime_serde")]
    pub unclaimed_after: Duration,

    #[serde(default = "default_refund_interval", with = "humantime_serde")]
    pub interval: Duration,
}

fn default_true() -> bool {
    true
}

fn default_unclaimed_after() -> Duration {
    Duration::from_secs(48 * 60 * 60)
}

fn default_refund_interval() -> Duration {
    Duration::from_secs(600)
}

impl Default for RefundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unclaimed_after: default_unclaimed_after(),
            interval: default_refund_interval(),
        }
    }
}

/// Encrypted gift store.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Hex-encoded 32-byte AES-256-GCM key.
    #[serde(default)]
    pub encryption_key: Option<SecretString>,

    /// Keep everything in memory only (development).
    #[serde(default)]
    pub memory_only: bool,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/data/gifts.enc")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            encryption_key: None,
            memory_only: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaConfig {
    #[serde(default = "default_solana_rpc")]
    pub rpc_url: String,

    #[serde(default = "default_rpc_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_solana_rpc() -> String {
    "https://api.mainnet-beta.solana.com".to_string()
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for SolanaConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_solana_rpc(),
            timeout: default_rpc_timeout(),
        }
    }
}

/// Fiat onramp provider.
#[derive(Debug, Clone, Deserialize)]
pub struct OnrampConfig {
    /// Hosted purchase page the sender is redirected to.
    #[serde(default = "default_onramp_widget")]
    pub widget_url: String,

    /// Status API.
    #[serde(default = "default_onramp_api")]
    pub api_url: String,

    /// Publishable key embedded in funding URLs.
    #[serde(default)]
    pub public_key: Option<String>,

    #[serde(default)]
    pub secret_key: Option<SecretString>,

    #[serde(default = "default_provider_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_onramp_widget() -> String {
    "https://buy.moonpay.com".to_string()
}

fn default_onramp_api() -> String {
    "https://api.moonpay.com".to_string()
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(15)
}

impl Default for OnrampConfig {
    fn default() -> Self {
        Self {
            widget_url: default_onramp_widget(),
            api_url: default_onramp_api(),
            public_key: None,
            secret_key: None,
            timeout: default_provider_timeout(),
        }
    }
}

/// Identity/wallet provider.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_url")]
    pub base_url: String,

    #[serde(default)]
    pub app_id: String,

    #[serde(default)]
    pub app_secret: Option<SecretString>,

    #[serde(default = "default_provider_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_identity_url() -> String {
    "https://auth.privy.io".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            base_url: default_identity_url(),
            app_id: String::new(),
            app_secret: None,
            timeout: default_provider_timeout(),
        }
    }
}

/// Transactional e-mail provider.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_email_api")]
    pub api_url: String,

    #[serde(default)]
    pub api_key: Option<SecretString>,

    #[serde(default = "default_email_from")]
    pub from: String,

    #[serde(default = "default_provider_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_email_api() -> String {
    "https://api.resend.com".to_string()
}

fn default_email_from() -> String {
    "Gifts <gifts@example.com>".to_string()
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_url: default_email_api(),
            api_key: None,
            from: default_email_from(),
            timeout: default_provider_timeout(),
        }
    }
}
