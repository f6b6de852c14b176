//! Settlement network abstraction.

pub mod solana;

pub use solana::SolanaNetwork;

use crate::error::GiftError;
use crate::types::{
    Asset, AssetTransfer, EscrowKeys, SignedTransfer, TxStatus, UnsignedTransaction,
};
use async_trait::async_trait;

/// Settlement network operations the pipeline relies on.
///
/// Sender-side transfers are returned unsigned; only escrow-side transfers are
/// signed here, with the escrow's own key.
#[async_trait]
pub trait SettlementNetwork: Send + Sync {
    /// Balance of `owner` in `asset`, in the asset's smallest unit.
    /// A missing token account counts as zero.
    async fn balance(&self, owner: &str, asset: &Asset) -> Result<u64, GiftError>;

    /// Whether `owner` already has a token account for `asset`.
    /// Always true for the native asset.
    async fn token_account_exists(&self, owner: &str, asset: &Asset) -> Result<bool, GiftError>;

    /// Fresh single-use escrow keypair.
    fn generate_escrow(&self) -> Result<EscrowKeys, GiftError>;

    /// Unsigned transfer from `from` to `to`, with a recent blockhash.
    /// The destination token account is created if missing, paid by `from`.
    async fn prepare_transfer(
        &self,
        from: &str,
        to: &str,
        transfer: &AssetTransfer,
    ) -> Result<UnsignedTransaction, GiftError>;

    /// Status of a submitted transaction.
    async fn signature_status(&self, signature: &str) -> Result<TxStatus, GiftError>;

    /// Sign, without sending, one escrow-paid transaction moving `transfers`
    /// to `destination`. The signature is known before submission so the
    /// release can be recorded first.
    async fn sign_escrow_transfer(
        &self,
        escrow: &EscrowKeys,
        destination: &str,
        transfers: &[AssetTransfer],
    ) -> Result<SignedTransfer, GiftError>;

    /// Send a signed escrow transfer and wait for confirmation.
    /// Returns the transaction signature.
    async fn submit_escrow_transfer(&self, transfer: &SignedTransfer) -> Result<String, GiftError>;

    /// Return whatever the escrow still holds to `to`: empty token accounts of
    /// `assets` are closed and the native balance, less the fee, is sent.
    /// `None` when there is nothing worth moving.
    async fn sweep_escrow(
        &self,
        escrow: &EscrowKeys,
        assets: &[Asset],
        to: &str,
    ) -> Result<Option<String>, GiftError>;

    async fn health_check(&self) -> Result<bool, GiftError>;
}

/// Whether `address` is a base58-encoded 32-byte public key.
pub fn is_valid_address(address: &str) -> bool {
    matches!(bs58::decode(address).into_vec(), Ok(bytes) if bytes.len() == 32)
}
