//! Shared collaborators and harness for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use gift_escrow::{
    claim::ClaimVerifier,
    identity::{AuthenticatedIdentity, IdentityProvider},
    machine::{Collaborators, FulfillmentMachine, GiftOrder},
    notify::{ClaimNotice, Notifier},
    onramp::{Onramp, OnrampStatus},
    pricing::PriceOracle,
    swap::{PreparedSwap, SwapStatus, SwapVenue},
    types::{
        Asset, AssetTransfer, EscrowKeys, GiftContent, GiftStatus, PaymentMethod, Recipient,
        Sender, SignedTransfer, TxStatus, UnsignedTransaction, NATIVE_SOL_MINT,
    },
    GiftConfig, GiftError, GiftStore, SettlementNetwork,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
pub const JUP: &str = "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN";
pub const SENDER_WALLET: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
pub const RECIPIENT_WALLET: &str = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T";
pub const RECIPIENT_EMAIL: &str = "bob@example.com";

/// Settlement network double. Unknown signatures stay pending.
#[derive(Default)]
pub struct MockNetwork {
    statuses: Mutex<HashMap<String, TxStatus>>,
    balances: Mutex<HashMap<(String, String), u64>>,
    escrow_counter: AtomicUsize,
    signed_counter: AtomicUsize,
    /// Submitted escrow releases: destination and contents.
    pub escrow_transfers: Mutex<Vec<(String, Vec<AssetTransfer>)>>,
    /// Escrow sweeps: escrow address and destination.
    pub sweeps: Mutex<Vec<(String, String)>>,
    pub fail_escrow: AtomicBool,
    /// Delay inside escrow transfers, to widen race windows.
    pub transfer_delay: Mutex<Option<Duration>>,
}

impl MockNetwork {
    pub fn set_balance(&self, owner: &str, mint: &str, amount: u64) {
        self.balances
            .lock()
            .unwrap()
            .insert((owner.to_string(), mint.to_string()), amount);
    }

    /// Add `amount` to what `owner` holds of `mint`.
    pub fn deposit(&self, owner: &str, mint: &str, amount: u64) {
        *self
            .balances
            .lock()
            .unwrap()
            .entry((owner.to_string(), mint.to_string()))
            .or_insert(0) += amount;
    }

    pub fn confirm(&self, signature: &str) {
        self.statuses.lock().unwrap().insert(
            signature.to_string(),
            TxStatus::Confirmed { confirmations: 32 },
        );
    }

    pub fn reject(&self, signature: &str, reason: &str) {
        self.statuses.lock().unwrap().insert(
            signature.to_string(),
            TxStatus::Failed {
                reason: reason.to_string(),
            },
        );
    }

    pub fn escrow_transfer_count(&self) -> usize {
        self.escrow_transfers.lock().unwrap().len()
    }

    pub fn sweep_destinations(&self) -> Vec<String> {
        self.sweeps.lock().unwrap().iter().map(|(_, to)| to.clone()).collect()
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
        let n = self.escrow_counter.fetch_add(1, Ordering::SeqCst);
        Ok(EscrowKeys {
            public_key: format!("Escrow{}", n),
            secret: format!("secret-{}", n),
        })
    }

    async fn prepare_transfer(
        &self,
        from: &str,
        to: &str,
        transfer: &AssetTransfer,
    ) -> Result<UnsignedTransaction, GiftError> {
        Ok(UnsignedTransaction {
            transaction: format!("{}->{}:{}:{}", from, to, transfer.asset.symbol, transfer.amount),
            recent_blockhash: Some("blockhash".into()),
            last_valid_block_height: Some(1_000),
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
        let n = self.signed_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SignedTransfer {
            signature: format!("escrow-out-{}", n),
            transaction: format!("signed-{}", n),
            destination: destination.to_string(),
            transfers: transfers.to_vec(),
        })
    }

    async fn submit_escrow_transfer(&self, transfer: &SignedTransfer) -> Result<String, GiftError> {
        let delay = *self.transfer_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_escrow.load(Ordering::SeqCst) {
            return Err(GiftError::TxFailed("blockhash expired".into()));
        }

        self.escrow_transfers
            .lock()
            .unwrap()
            .push((transfer.destination.clone(), transfer.transfers.clone()));
        self.confirm(&transfer.signature);
        Ok(transfer.signature.clone())
    }

    async fn sweep_escrow(
        &self,
        escrow: &EscrowKeys,
        _assets: &[Asset],
        to: &str,
    ) -> Result<Option<String>, GiftError> {
        let mut sweeps = self.sweeps.lock().unwrap();
        sweeps.push((escrow.public_key.clone(), to.to_string()));
        Ok(Some(format!("sweep-{}", sweeps.len())))
    }

    async fn health_check(&self) -> Result<bool, GiftError> {
        Ok(true)
    }
}

/// Swap venue that fills every swap at the quoted amount.
#[derive(Default)]
pub struct MockVenue {
    pub rejected: Mutex<Vec<String>>,
}

#[async_trait]
impl SwapVenue for MockVenue {
    async fn prepare_swap(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        _slippage_bps: u16,
        user: &str,
    ) -> Result<PreparedSwap, GiftError> {
        Ok(PreparedSwap {
            quoted_output: amount / 10,
            transaction: UnsignedTransaction {
                transaction: format!("swap:{}:{}:{}:{}", user, input_mint, output_mint, amount),
                recent_blockhash: None,
                last_valid_block_height: None,
            },
        })
    }

    async fn swap_status(&self, signature: &str) -> Result<SwapStatus, GiftError> {
        if self.rejected.lock().unwrap().iter().any(|s| s == signature) {
            return Ok(SwapStatus::Failed {
                reason: "slippage exceeded".into(),
            });
        }
        Ok(SwapStatus::Confirmed {
            output_amount: Some(1_000_000),
        })
    }
}

/// Onramp whose purchases complete on demand.
#[derive(Default)]
pub struct MockOnramp {
    pub completed: AtomicBool,
}

#[async_trait]
impl Onramp for MockOnramp {
    fn funding_url(
        &self,
        wallet: &str,
        asset: &Asset,
        usd_amount: u64,
        reference: &str,
    ) -> Result<String, GiftError> {
        Ok(format!(
            "https://onramp.test/buy?wallet={}&currency={}&usd={}&ref={}",
            wallet, asset.symbol, usd_amount, reference
        ))
    }

    async fn status(&self, _reference: &str) -> Result<OnrampStatus, GiftError> {
        Ok(if self.completed.load(Ordering::SeqCst) {
            OnrampStatus::Completed
        } else {
            OnrampStatus::Pending
        })
    }
}

/// Notifier that records what it would send.
#[derive(Default)]
pub struct MockNotifier {
    pub sent: Mutex<Vec<ClaimNotice>>,
    pub fail: AtomicBool,
}

impl MockNotifier {
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send_claim(&self, notice: &ClaimNotice) -> Result<(), GiftError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GiftError::NetworkError("mail relay down".into()));
        }
        self.sent.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

/// Oracle quoting SOL $150, USDC $1, JUP $0.80.
pub struct MockOracle;

#[async_trait]
impl PriceOracle for MockOracle {
    async fn usd_prices(&self, mints: &[String]) -> Result<HashMap<String, f64>, GiftError> {
        let known = HashMap::from([
            (NATIVE_SOL_MINT.to_string(), 150.0),
            (USDC.to_string(), 1.0),
            (JUP.to_string(), 0.8),
        ]);
        Ok(mints
            .iter()
            .filter_map(|m| known.get(m).map(|p| (m.clone(), *p)))
            .collect())
    }
}

/// Identity provider over a fixed token table.
#[derive(Default)]
pub struct MockIdentity {
    pub users: HashMap<String, AuthenticatedIdentity>,
}

impl MockIdentity {
    pub fn standard() -> Self {
        let mut users = HashMap::new();
        users.insert("alice-token".to_string(), sender_identity());
        users.insert("bob-token".to_string(), recipient_identity());
        users.insert(
            "mallory-token".to_string(),
            AuthenticatedIdentity {
                user_id: "mallory".into(),
                verified_email: Some("mallory@example.com".into()),
                wallets: vec![RECIPIENT_WALLET.into()],
            },
        );
        Self { users }
    }
}

#[async_trait]
impl IdentityProvider for MockIdentity {
    async fn authenticate(&self, access_token: &str) -> Result<AuthenticatedIdentity, GiftError> {
        self.users
            .get(access_token)
            .cloned()
            .ok_or_else(|| GiftError::Unauthorized("Invalid access token".into()))
    }
}

pub fn sender_identity() -> AuthenticatedIdentity {
    AuthenticatedIdentity {
        user_id: "alice".into(),
        verified_email: Some("alice@example.com".into()),
        wallets: vec![SENDER_WALLET.into()],
    }
}

pub fn recipient_identity() -> AuthenticatedIdentity {
    AuthenticatedIdentity {
        user_id: "bob".into(),
        verified_email: Some(RECIPIENT_EMAIL.into()),
        wallets: vec![RECIPIENT_WALLET.into()],
    }
}

/// Pipeline configuration with fast polling.
pub fn test_config() -> GiftConfig {
    let mut config = GiftConfig::default();
    config.claim_base_url = "https://gifts.test".into();
    config.funding.poll_interval = Duration::from_millis(10);
    config.funding.max_attempts = 200;
    config.confirmation.poll_interval = Duration::from_millis(1);
    config.confirmation.max_attempts = 5;
    config.storage.memory_only = true;
    config
}

pub struct Harness {
    pub config: GiftConfig,
    pub store: Arc<GiftStore>,
    pub network: Arc<MockNetwork>,
    pub venue: Arc<MockVenue>,
    pub onramp: Arc<MockOnramp>,
    pub notifier: Arc<MockNotifier>,
    pub machine: Arc<FulfillmentMachine>,
    pub claims: Arc<ClaimVerifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: GiftConfig) -> Self {
        Self::with_store(config, Arc::new(GiftStore::memory()))
    }

    pub fn with_store(config: GiftConfig, store: Arc<GiftStore>) -> Self {
        Self::with_parts(config, store, Arc::new(MockNetwork::default()))
    }

    /// A fresh machine over this harness's store and network, as after a
    /// process restart.
    pub fn restarted(&self) -> Self {
        Self::with_parts(self.config.clone(), self.store.clone(), self.network.clone())
    }

    fn with_parts(config: GiftConfig, store: Arc<GiftStore>, network: Arc<MockNetwork>) -> Self {
        let venue = Arc::new(MockVenue::default());
        let onramp = Arc::new(MockOnramp::default());
        let notifier = Arc::new(MockNotifier::default());

        let machine = FulfillmentMachine::new(
            config.clone(),
            store.clone(),
            Collaborators {
                network: network.clone(),
                swap_venue: venue.clone(),
                onramp: onramp.clone(),
                notifier: notifier.clone(),
                oracle: Arc::new(MockOracle),
            },
        )
        .unwrap();
        let claims = Arc::new(ClaimVerifier::new(
            store.clone(),
            network.clone(),
            config.claim.clone(),
        ));

        Self {
            config,
            store,
            network,
            venue,
            onramp,
            notifier,
            machine,
            claims,
        }
    }

    /// Wait until the gift reaches `status` (or give up after ~2 s).
    pub async fn wait_for(&self, gift_id: &str, status: GiftStatus) -> GiftStatus {
        let mut current = GiftStatus::Selecting;
        for _ in 0..200 {
            current = self.store.get(gift_id).await.unwrap().status;
            if current == status {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        current
    }

    /// Drive a $50 single-SOL wallet-direct gift to `SENT`.
    /// Returns the gift id and its claim token.
    pub async fn send_sol_gift(&self) -> (String, String) {
        self.network
            .set_balance(SENDER_WALLET, NATIVE_SOL_MINT, 1_000_000_000);

        let initiated = self
            .machine
            .initiate(sender(), sol_order(50_000_000, PaymentMethod::DirectAssetTransfer))
            .await
            .unwrap();
        let gift_id = initiated.gift_id;
        assert_eq!(
            self.wait_for(&gift_id, GiftStatus::EscrowFunding).await,
            GiftStatus::EscrowFunding
        );

        let intents = self.machine.pending_escrow_transfers(&gift_id).await.unwrap();
        for intent in &intents {
            let signature = format!("{}-escrow-{}", gift_id, intent.leg);
            self.network
                .deposit(&initiated.escrow_address, &intent.mint, intent.amount);
            self.network.confirm(&signature);
            self.machine
                .fund_escrow_leg(&gift_id, intent.leg, &signature)
                .await
                .unwrap();
        }

        let gift = self.store.get(&gift_id).await.unwrap();
        assert_eq!(gift.status, GiftStatus::Sent);
        (gift_id, gift.secrets.claim_token)
    }
}

pub fn sender() -> Sender {
    Sender {
        user_id: "alice".into(),
        wallet: SENDER_WALLET.into(),
        display_name: Some("Alice".into()),
    }
}

pub fn recipient() -> Recipient {
    Recipient {
        email: RECIPIENT_EMAIL.into(),
        name: Some("Bob".into()),
    }
}

pub fn sol_order(face_value_usd: u64, payment_method: PaymentMethod) -> GiftOrder {
    GiftOrder {
        content: GiftContent::Single {
            mint: NATIVE_SOL_MINT.into(),
        },
        face_value_usd,
        payment_method,
        card_add_on: false,
        recipient: recipient(),
        message: Some("Happy birthday!".into()),
    }
}
