//! Encrypted gift store.
//!
//! Gifts and onramp credits live in memory behind one `RwLock` and are
//! written through to a single AES-256-GCM encrypted JSON file after every
//! mutation. File format: `[12 byte nonce][ciphertext + tag]`, replaced
//! atomically via temp file + rename.

use crate::config::StorageConfig;
use crate::error::GiftError;
use crate::types::{Gift, GiftId, GiftStatus, LegRef, OnrampCredit, UserId};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use chrono::{DateTime, Utc};
use rand::RngCore;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// SHA-256 hex of a claim token; the only form in which tokens are indexed.
pub fn hash_claim_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    gifts: BTreeMap<GiftId, Gift>,
    credits: BTreeMap<UserId, OnrampCredit>,
    /// Claim token hash -> gift id. Rebuilt on load.
    #[serde(skip)]
    claim_index: HashMap<String, GiftId>,
}

impl StoreData {
    fn rebuild_index(&mut self) {
        self.claim_index = self
            .gifts
            .values()
            .map(|g| (g.claim_token_hash.clone(), g.id.clone()))
            .collect();
    }

    /// Gift and leg that already carry `signature`, if any.
    fn signature_owner(&self, signature: &str) -> Option<(&str, LegRef)> {
        self.gifts.values().find_map(|g| {
            g.leg_signatures()
                .find(|(_, sig)| *sig == signature)
                .map(|(leg, _)| (g.id.as_str(), leg))
        })
    }

    fn gift_mut(&mut self, id: &str) -> Result<&mut Gift, GiftError> {
        self.gifts
            .get_mut(id)
            .ok_or_else(|| GiftError::GiftNotFound(id.to_string()))
    }
}

/// AES-256-GCM encrypted file.
struct EncryptedFile {
    path: PathBuf,
    key: [u8; 32],
}

impl EncryptedFile {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, GiftError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, plaintext)?;

        let mut data = nonce_bytes.to_vec();
        data.extend(ciphertext);
        Ok(data)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, GiftError> {
        if data.len() < NONCE_SIZE {
            return Err(GiftError::Encryption("Store file too short".to_string()));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);

        cipher.decrypt(nonce, &data[NONCE_SIZE..]).map_err(|_| {
            GiftError::Encryption(
                "Failed to decrypt gift store. Was the encryption key changed?".to_string(),
            )
        })
    }

    async fn save(&self, data: &StoreData) -> Result<(), GiftError> {
        let plaintext = serde_json::to_vec(data)?;
        let encrypted = self.encrypt(&plaintext)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &encrypted).await?;
        fs::rename(&temp_path, &self.path).await?;

        debug!(
            "Saved encrypted gift store ({} bytes) to {:?}",
            encrypted.len(),
            self.path
        );
        Ok(())
    }

    async fn load(&self) -> Result<StoreData, GiftError> {
        if !self.path.exists() {
            info!("Gift store not found at {:?}, starting empty", self.path);
            return Ok(StoreData::default());
        }

        let encrypted = fs::read(&self.path).await?;
        let plaintext = self.decrypt(&encrypted)?;
        let mut data: StoreData = serde_json::from_slice(&plaintext)?;
        data.rebuild_index();

        info!(
            "Loaded gift store with {} gifts and {} credit records from {:?}",
            data.gifts.len(),
            data.credits.len(),
            self.path
        );
        Ok(data)
    }
}

enum Backend {
    Encrypted(EncryptedFile),
    Memory,
}

/// Durable store for gifts and onramp credits.
pub struct GiftStore {
    data: RwLock<StoreData>,
    backend: Backend,
}

impl GiftStore {
    /// Open the store described by `config`.
    pub async fn open(config: &StorageConfig) -> Result<Self, GiftError> {
        if config.memory_only {
            warn!("Using in-memory gift store (data will be lost on restart)");
            return Ok(Self::memory());
        }

        let key_hex = config.encryption_key.as_ref().ok_or_else(|| {
            GiftError::Config("storage.encryption_key is required for a persistent store".into())
        })?;
        let key = parse_key(key_hex.expose_secret())?;

        Self::encrypted(config.path.clone(), key).await
    }

    /// Encrypted store at `path`, loading existing contents.
    pub async fn encrypted(path: PathBuf, key: [u8; 32]) -> Result<Self, GiftError> {
        let file = EncryptedFile { path, key };
        let data = file.load().await?;
        Ok(Self {
            data: RwLock::new(data),
            backend: Backend::Encrypted(file),
        })
    }

    /// Store without persistence.
    pub fn memory() -> Self {
        Self {
            data: RwLock::new(StoreData::default()),
            backend: Backend::Memory,
        }
    }

    async fn persist(&self, data: &StoreData) -> Result<(), GiftError> {
        match &self.backend {
            Backend::Encrypted(file) => file.save(data).await,
            Backend::Memory => Ok(()),
        }
    }

    /// Add a new gift. Ids and claim tokens must be unique.
    pub async fn insert(&self, gift: Gift) -> Result<(), GiftError> {
        let mut data = self.data.write().await;
        if data.gifts.contains_key(&gift.id) || data.claim_index.contains_key(&gift.claim_token_hash)
        {
            return Err(GiftError::Internal(format!("Gift {} already exists", gift.id)));
        }

        data.claim_index
            .insert(gift.claim_token_hash.clone(), gift.id.clone());
        data.gifts.insert(gift.id.clone(), gift);
        self.persist(&data).await
    }

    pub async fn get(&self, id: &str) -> Result<Gift, GiftError> {
        self.data
            .read()
            .await
            .gifts
            .get(id)
            .cloned()
            .ok_or_else(|| GiftError::GiftNotFound(id.to_string()))
    }

    /// Id of the gift a claim token belongs to.
    pub async fn resolve_claim_token(&self, token: &str) -> Option<GiftId> {
        self.data
            .read()
            .await
            .claim_index
            .get(&hash_claim_token(token))
            .cloned()
    }

    /// Apply `f` to a gift under the write lock and persist the result,
    /// whatever `f` returns. Use when a rejection must still be recorded.
    pub async fn update<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Gift) -> R,
    ) -> Result<R, GiftError> {
        let mut data = self.data.write().await;
        let result = f(data.gift_mut(id)?);
        self.persist(&data).await?;
        Ok(result)
    }

    /// Apply `f` to a copy of a gift; commit and persist only if it succeeds.
    pub async fn try_update<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Gift) -> Result<R, GiftError>,
    ) -> Result<R, GiftError> {
        let mut data = self.data.write().await;
        let gift = data.gift_mut(id)?;
        let mut draft = gift.clone();
        let result = f(&mut draft)?;
        *gift = draft;
        self.persist(&data).await?;
        Ok(result)
    }

    /// `try_update` for recording `signature` against one leg. Fails with
    /// `SignatureReused` when any other leg, of this gift or another, already
    /// holds the same signature.
    pub async fn try_update_leg<R>(
        &self,
        id: &str,
        leg: LegRef,
        signature: &str,
        f: impl FnOnce(&mut Gift) -> Result<R, GiftError>,
    ) -> Result<R, GiftError> {
        let mut data = self.data.write().await;
        if let Some((owner, owner_leg)) = data.signature_owner(signature) {
            if owner != id || owner_leg != leg {
                warn!(
                    "Signature {} for gift {} {:?} is already recorded on gift {} {:?}",
                    signature, id, leg, owner, owner_leg
                );
                return Err(GiftError::SignatureReused(signature.to_string()));
            }
        }

        let gift = data.gift_mut(id)?;
        let mut draft = gift.clone();
        let result = f(&mut draft)?;
        *gift = draft;
        self.persist(&data).await?;
        Ok(result)
    }

    /// Snapshot of every gift matching `predicate`.
    pub async fn find(&self, predicate: impl Fn(&Gift) -> bool) -> Vec<Gift> {
        self.data
            .read()
            .await
            .gifts
            .values()
            .filter(|g| predicate(g))
            .cloned()
            .collect()
    }

    pub async fn with_status(&self, status: GiftStatus) -> Vec<Gift> {
        self.find(|g| g.status == status).await
    }

    pub async fn count(&self) -> usize {
        self.data.read().await.gifts.len()
    }

    /// Grant (or replace) a user's onramp credits.
    pub async fn grant_credit(
        &self,
        user_id: &str,
        allowed: u32,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<OnrampCredit, GiftError> {
        let credit = OnrampCredit::new(user_id.to_string(), allowed, expires_at);
        let mut data = self.data.write().await;
        data.credits.insert(user_id.to_string(), credit.clone());
        self.persist(&data).await?;

        info!("Granted {} onramp credits to {}", allowed, user_id);
        Ok(credit)
    }

    pub async fn credit(&self, user_id: &str) -> Option<OnrampCredit> {
        self.data.read().await.credits.get(user_id).cloned()
    }

    /// Whether `user_id` has a credit to spend at `now`.
    pub async fn has_usable_credit(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        self.data
            .read()
            .await
            .credits
            .get(user_id)
            .is_some_and(|c| c.is_usable(now))
    }

    /// Spend the credit a gift's quote relied on, at most once per gift.
    /// Returns whether a credit was decremented.
    pub async fn consume_credit(&self, gift_id: &str, now: DateTime<Utc>) -> Result<bool, GiftError> {
        let mut data = self.data.write().await;
        let gift = data.gift_mut(gift_id)?;

        let applied = gift.breakdown().is_some_and(|b| b.credit_applied);
        if !applied || gift.credit_consumed {
            return Ok(false);
        }
        gift.credit_consumed = true;
        gift.updated_at = now;
        let user_id = gift.sender.user_id.clone();

        match data.credits.get_mut(&user_id) {
            Some(credit) if credit.remaining > 0 => {
                credit.remaining -= 1;
                debug!("Consumed onramp credit for {} ({} left)", user_id, credit.remaining);
            }
            _ => warn!(
                "Gift {} was quoted with a credit but {} has none left",
                gift_id, user_id
            ),
        }

        self.persist(&data).await?;
        Ok(true)
    }
}

/// Decode a hex-encoded 32-byte key.
pub fn parse_key(hex_key: &str) -> Result<[u8; 32], GiftError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| GiftError::Config(format!("Encryption key is not hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| GiftError::Config("Encryption key must be 32 bytes".to_string()))
}
