//! Multi-asset e-mail gift escrow.
//!
//! A sender picks a single asset or a weighted basket, pays by card onramp or
//! directly from their wallet, and the recipient claims by e-mail identity.
//!
//! # Architecture
//!
//! ```text
//! quote → initiate (fees frozen) → funding detected → swaps → escrow funded → e-mail
//!                                                                      ↓
//!                       recipient signs in → identity verified → escrow → recipient wallet
//!                                            (unclaimed after 48 h → escrow → sender wallet)
//! ```
//!
//! # Modules
//!
//! - [`pricing`] - Price cache and fee engine (integer micro-USD)
//! - [`funding`] - Per-gift funding detection
//! - [`swap`] - Swap orchestration against the swap venue
//! - [`escrow`] - Escrow funding legs
//! - [`machine`] - Fulfillment state machine
//! - [`claim`] - Claim verification and lockout
//! - [`refund`] - Unclaimed-gift refund sweep
//! - [`release`] - Recorded escrow releases and leftover returns
//! - [`store`] - Encrypted gift and credit store
//! - [`api`] - HTTP API
//!
//! # Security
//!
//! Claim tokens and escrow keys live only in the AES-256-GCM encrypted store
//! and are never logged. Escrow keys sign nothing but escrow → claimant and
//! escrow → sender transfers.

pub mod api;
pub mod assets;
pub mod chains;
pub mod claim;
pub mod config;
pub mod error;
pub mod escrow;
pub mod funding;
pub mod identity;
pub mod machine;
pub mod notify;
pub mod onramp;
pub mod poll;
pub mod pricing;
pub mod refund;
pub mod release;
pub mod store;
pub mod swap;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use assets::AssetRegistry;
pub use chains::{SettlementNetwork, SolanaNetwork};
pub use claim::{ClaimReceipt, ClaimVerifier};
pub use config::GiftConfig;
pub use error::GiftError;
pub use identity::{AuthenticatedIdentity, HttpIdentityProvider, IdentityProvider, LinkedAccount};
pub use machine::{Collaborators, FulfillmentMachine, GiftOrder, GiftStatusView, InitiatedGift};
pub use notify::{EmailNotifier, Notifier};
pub use onramp::{HttpOnramp, Onramp};
pub use pricing::{FeeBreakdown, FeeEngine, PriceCache, PriceOracle};
pub use refund::{spawn_refund_sweeper, RefundSweeper};
pub use release::EscrowRelease;
pub use store::GiftStore;
pub use swap::SwapVenue;
pub use types::{Gift, GiftContent, GiftId, GiftStatus, PaymentMethod};
