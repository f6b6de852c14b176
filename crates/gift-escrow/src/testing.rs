//! Fixtures shared by unit tests.

use crate::assets::AssetRegistry;
use crate::chains::SettlementNetwork;
use crate::config::{FeeConfig, GiftConfig};
use crate::error::GiftError;
use crate::pricing::{compute_fees, FeeRequest, PriceSnapshot};
use crate::store::hash_claim_token;
use crate::types::{
    Asset, AssetTransfer, EscrowKeys, EscrowLeg, EscrowLegKind, FrozenQuote, Gift, GiftContent,
    GiftSecrets, GiftStatus, LegStatus, PaymentMethod, Recipient, Sender, SignedTransfer,
    TxStatus, UnsignedTransaction, NATIVE_SOL_MINT,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
pub const JUP: &str = "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN";
pub const SENDER_WALLET: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

/// Escrow seed `[7; 32]` and its public key.
const ESCROW_SEED: [u8; 32] = [7; 32];

pub fn registry() -> AssetRegistry {
    AssetRegistry::from_config(&GiftConfig::default().assets).unwrap()
}

pub fn snapshot() -> PriceSnapshot {
    PriceSnapshot::fixed(BTreeMap::from([
        (NATIVE_SOL_MINT.to_string(), 150_000_000),
        (USDC.to_string(), 1_000_000),
        (JUP.to_string(), 800_000),
    ]))
}

pub fn escrow_keys() -> EscrowKeys {
    use solana_sdk::signer::{SeedDerivable, Signer};
    let keypair = solana_sdk::signature::Keypair::from_seed(&ESCROW_SEED).unwrap();
    EscrowKeys {
        public_key: keypair.pubkey().to_string(),
        secret: bs58::encode(ESCROW_SEED).into_string(),
    }
}

/// A $50 single-SOL gift awaiting funding, with a frozen quote.
pub fn sample_gift(id: &str, claim_token: &str) -> Gift {
    let content = GiftContent::Single {
        mint: NATIVE_SOL_MINT.to_string(),
    };
    let request = FeeRequest {
        face_value_usd: 50_000_000,
        content: content.clone(),
        card_add_on: false,
        payment_method: PaymentMethod::DirectAssetTransfer,
        sender_token_accounts: BTreeSet::new(),
        credit_available: false,
    };
    let snapshot = snapshot();
    let breakdown = compute_fees(
        &request,
        &snapshot,
        &registry(),
        &FeeConfig::default(),
        NATIVE_SOL_MINT,
    )
    .unwrap();

    let escrow = escrow_keys();
    let now = Utc::now();
    Gift {
        id: id.to_string(),
        sender: Sender {
            user_id: "sender-1".into(),
            wallet: SENDER_WALLET.into(),
            display_name: Some("Alice".into()),
        },
        recipient: Recipient {
            email: "recipient@example.com".into(),
            name: Some("Bob".into()),
        },
        message: None,
        content,
        face_value_usd: 50_000_000,
        payment_method: PaymentMethod::DirectAssetTransfer,
        card_add_on: false,
        status: GiftStatus::AwaitingFunding,
        quote: Some(FrozenQuote {
            breakdown,
            snapshot,
        }),
        funding: None,
        escrow_address: escrow.public_key.clone(),
        claim_token_hash: hash_claim_token(claim_token),
        secrets: GiftSecrets {
            claim_token: claim_token.to_string(),
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
    }
}

/// [`sample_gift`] after escrow funding: SENT, asset and buffer legs confirmed.
pub fn sent_gift(id: &str, claim_token: &str) -> Gift {
    let mut gift = sample_gift(id, claim_token);
    let registry = registry();
    let sol = registry.settlement().clone();
    let buffer = gift.breakdown().map_or(0, |b| b.escrow_buffer_lamports);

    gift.status = GiftStatus::Sent;
    gift.escrow_legs = vec![
        EscrowLeg {
            index: 0,
            kind: EscrowLegKind::Asset,
            asset: sol.clone(),
            amount: 333_333_333,
            signature: Some("escrow-sig-0".into()),
            status: LegStatus::Confirmed,
        },
        EscrowLeg {
            index: 1,
            kind: EscrowLegKind::SettlementBuffer,
            asset: sol,
            amount: buffer,
            signature: Some("escrow-sig-1".into()),
            status: LegStatus::Confirmed,
        },
    ];
    gift.funded_at = Some(gift.created_at);
    gift.sent_at = Some(gift.created_at);
    gift.notified_at = Some(gift.created_at);
    gift
}

/// Settlement network double with scripted statuses and balances.
#[derive(Default)]
pub struct MockNetwork {
    statuses: Mutex<HashMap<String, TxStatus>>,
    balances: Mutex<HashMap<(String, String), u64>>,
    escrow_transfers: AtomicUsize,
    signed: AtomicUsize,
    fail_escrow: AtomicBool,
    /// Destinations of escrow sweeps, in order.
    sweeps: Mutex<Vec<String>>,
}

impl MockNetwork {
    pub fn set_signature_status(&self, signature: &str, status: TxStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(signature.to_string(), status);
    }

    pub fn set_balance(&self, owner: &str, mint: &str, amount: u64) {
        self.balances
            .lock()
            .unwrap()
            .insert((owner.to_string(), mint.to_string()), amount);
    }

    /// Successful escrow-signed transfers so far.
    pub fn escrow_transfer_count(&self) -> usize {
        self.escrow_transfers.load(Ordering::SeqCst)
    }

    pub fn fail_escrow_transfers(&self, fail: bool) {
        self.fail_escrow.store(fail, Ordering::SeqCst);
    }

    pub fn sweeps(&self) -> Vec<String> {
        self.sweeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl SettlementNetwork for MockNetwork {
    async fn balance(&self, owner: &str, asset: &Asset) -> Result<u64, GiftError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&(owner.to_string(), asset.mint.clone()))
            .copied()
            .unwrap_or(0))
    }

    async fn token_account_exists(&self, _owner: &str, asset: &Asset) -> Result<bool, GiftError> {
        Ok(asset.is_native())
    }

    fn generate_escrow(&self) -> Result<EscrowKeys, GiftError> {
        Ok(escrow_keys())
    }

    async fn prepare_transfer(
        &self,
        from: &str,
        to: &str,
        transfer: &AssetTransfer,
    ) -> Result<UnsignedTransaction, GiftError> {
        Ok(UnsignedTransaction {
            transaction: format!("{}:{}:{}:{}", from, to, transfer.asset.symbol, transfer.amount),
            recent_blockhash: None,
            last_valid_block_height: None,
        })
    }

    async fn signature_status(&self, signature: &str) -> Result<TxStatus, GiftError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(signature)
            .cloned()
            .unwrap_or(TxStatus::Pending))
    }

    async fn sign_escrow_transfer(
        &self,
        _escrow: &EscrowKeys,
        destination: &str,
        transfers: &[AssetTransfer],
    ) -> Result<SignedTransfer, GiftError> {
        let n = self.signed.fetch_add(1, Ordering::SeqCst);
        Ok(SignedTransfer {
            signature: format!("escrow-out-{}", n),
            transaction: String::new(),
            destination: destination.to_string(),
            transfers: transfers.to_vec(),
        })
    }

    async fn submit_escrow_transfer(&self, transfer: &SignedTransfer) -> Result<String, GiftError> {
        if self.fail_escrow.load(Ordering::SeqCst) {
            return Err(GiftError::TxFailed("scripted failure".into()));
        }
        self.escrow_transfers.fetch_add(1, Ordering::SeqCst);
        self.set_signature_status(&transfer.signature, TxStatus::Confirmed { confirmations: 1 });
        Ok(transfer.signature.clone())
    }

    async fn sweep_escrow(
        &self,
        _escrow: &EscrowKeys,
        _assets: &[Asset],
        to: &str,
    ) -> Result<Option<String>, GiftError> {
        let mut sweeps = self.sweeps.lock().unwrap();
        sweeps.push(to.to_string());
        Ok(Some(format!("sweep-{}", sweeps.len())))
    }

    async fn health_check(&self) -> Result<bool, GiftError> {
        Ok(true)
    }
}
