//! Identity/wallet provider.
//!
//! The provider describes a user as a list of linked accounts whose shape
//! varies by account kind and SDK version. They are collapsed once, here,
//! into [`LinkedAccount`]; nothing downstream inspects raw provider JSON.

use crate::chains::is_valid_address;
use crate::config::IdentityConfig;
use crate::error::GiftError;
use crate::types::UserId;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// A linked account, normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkedAccount {
    Email { address: String, verified: bool },
    SolanaWallet { address: String },
    OtherWallet { address: String, chain: String },
}

/// Caller identity as the pipeline sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    pub user_id: UserId,
    /// Lowercased, and only if the provider verified it.
    pub verified_email: Option<String>,
    /// Solana wallets, in provider order.
    pub wallets: Vec<String>,
}

impl AuthenticatedIdentity {
    pub fn from_accounts(user_id: UserId, accounts: &[LinkedAccount]) -> Self {
        let verified_email = accounts.iter().find_map(|a| match a {
            LinkedAccount::Email {
                address,
                verified: true,
            } => Some(address.trim().to_lowercase()),
            _ => None,
        });

        let wallets = accounts
            .iter()
            .filter_map(|a| match a {
                LinkedAccount::SolanaWallet { address } => Some(address.clone()),
                _ => None,
            })
            .collect();

        Self {
            user_id,
            verified_email,
            wallets,
        }
    }

    /// Case-insensitive match against a verified e-mail.
    pub fn has_verified_email(&self, email: &str) -> bool {
        self.verified_email
            .as_deref()
            .is_some_and(|own| own.eq_ignore_ascii_case(email.trim()))
    }

    pub fn primary_wallet(&self) -> Option<&str> {
        self.wallets.first().map(String::as_str)
    }
}

/// Linked-account entry as sent by the provider.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawLinkedAccount {
    Email {
        address: String,
        #[serde(default)]
        verified_at: Option<i64>,
    },
    Wallet(RawWallet),
    SmartWallet {
        address: String,
    },
    GoogleOauth {
        email: String,
    },
    #[serde(other)]
    Unsupported,
}

/// Wallet entries come with or without a chain tag.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawWallet {
    Tagged { address: String, chain_type: String },
    Bare { address: String },
}

/// Collapse provider account entries into [`LinkedAccount`]s. Entries of an
/// unknown or malformed shape are dropped.
pub fn normalize_linked_accounts(raw: &[serde_json::Value]) -> Vec<LinkedAccount> {
    raw.iter()
        .filter_map(|value| match serde_json::from_value::<RawLinkedAccount>(value.clone()) {
            Ok(account) => Some(account),
            Err(e) => {
                debug!("Skipping malformed linked account: {}", e);
                None
            }
        })
        .filter_map(|account| match account {
            RawLinkedAccount::Email {
                address,
                verified_at,
            } => Some(LinkedAccount::Email {
                address,
                verified: verified_at.is_some(),
            }),
            RawLinkedAccount::GoogleOauth { email } => Some(LinkedAccount::Email {
                address: email,
                verified: true,
            }),
            RawLinkedAccount::Wallet(RawWallet::Tagged {
                address,
                chain_type,
            }) if chain_type.eq_ignore_ascii_case("solana") => {
                Some(LinkedAccount::SolanaWallet { address })
            }
            RawLinkedAccount::Wallet(RawWallet::Tagged {
                address,
                chain_type,
            }) => Some(LinkedAccount::OtherWallet {
                address,
                chain: chain_type.to_lowercase(),
            }),
            RawLinkedAccount::Wallet(RawWallet::Bare { address })
            | RawLinkedAccount::SmartWallet { address } => Some(if is_valid_address(&address) {
                LinkedAccount::SolanaWallet { address }
            } else {
                LinkedAccount::OtherWallet {
                    address,
                    chain: "unknown".to_string(),
                }
            }),
            RawLinkedAccount::Unsupported => None,
        })
        .collect()
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a bearer access token to an identity.
    async fn authenticate(&self, access_token: &str) -> Result<AuthenticatedIdentity, GiftError>;
}

/// User payload, bare or wrapped in `{"user": ...}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserEnvelope {
    Wrapped { user: ProviderUser },
    Bare(ProviderUser),
}

#[derive(Debug, Deserialize)]
struct ProviderUser {
    id: String,
    #[serde(default)]
    linked_accounts: Vec<serde_json::Value>,
}

/// Identity provider over HTTP (`GET {base_url}/api/v1/users/me`).
pub struct HttpIdentityProvider {
    client: Client,
    config: IdentityConfig,
}

impl HttpIdentityProvider {
    pub fn new(config: IdentityConfig) -> Result<Self, GiftError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GiftError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    #[instrument(skip_all)]
    async fn authenticate(&self, access_token: &str) -> Result<AuthenticatedIdentity, GiftError> {
        let response = self
            .client
            .get(format!(
                "{}/api/v1/users/me",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(access_token)
            .header("privy-app-id", &self.config.app_id)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(GiftError::Unauthorized("Invalid access token".to_string()))
            }
            status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                return Err(GiftError::NetworkError(format!(
                    "Identity provider returned {}",
                    status
                )))
            }
            status if !status.is_success() => {
                return Err(GiftError::Provider(format!(
                    "Identity provider returned {}",
                    status
                )))
            }
            _ => {}
        }

        let envelope: UserEnvelope = response
            .json()
            .await
            .map_err(|e| GiftError::Provider(format!("Invalid identity response: {}", e)))?;
        let user = match envelope {
            UserEnvelope::Wrapped { user } | UserEnvelope::Bare(user) => user,
        };

        let accounts = normalize_linked_accounts(&user.linked_accounts);
        debug!("Authenticated {} with {} linked accounts", user.id, accounts.len());
        Ok(AuthenticatedIdentity::from_accounts(user.id, &accounts))
    }
}
