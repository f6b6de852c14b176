//! Solana settlement network.
//!
//! Native SOL moves with system transfers; every other asset is an SPL token
//! (classic token program) moved between associated token accounts.

use super::SettlementNetwork;
use crate::config::SolanaConfig;
use crate::error::GiftError;
use crate::types::{
    Asset, AssetTransfer, EscrowKeys, SignedTransfer, TxStatus, UnsignedTransaction,
};
use async_trait::async_trait;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    signer::SeedDerivable,
    transaction::Transaction,
};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};
use spl_token::instruction::{close_account, transfer_checked};

/// Fee for a transaction with one signature (the escrow's).
const ESCROW_SIGNATURE_FEE_LAMPORTS: u64 = 5_000;

/// Solana settlement network over JSON-RPC.
pub struct SolanaNetwork {
    config: SolanaConfig,
    rpc_client: RpcClient,
    /// HTTP client for raw JSON-RPC calls.
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureStatus {
    confirmations: Option<u64>,
    err: Option<serde_json::Value>,
    confirmation_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignatureStatusResult {
    value: Vec<Option<SignatureStatus>>,
}

impl SolanaNetwork {
    pub fn new(config: SolanaConfig) -> Result<Self, GiftError> {
        info!("Initializing Solana network: rpc={}", config.rpc_url);

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GiftError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let rpc_client = RpcClient::new_with_timeout_and_commitment(
            config.rpc_url.clone(),
            config.timeout,
            CommitmentConfig::confirmed(),
        );

        Ok(Self {
            config,
            rpc_client,
            client,
        })
    }

    async fn rpc_call<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        method: &'static str,
        params: T,
    ) -> Result<R, GiftError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let response = self
            .client
            .post(&self.config.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| GiftError::RpcError(format!("Solana RPC request failed: {}", e)))?;

        let json_response: JsonRpcResponse<R> = response.json().await.map_err(|e| {
            GiftError::RpcError(format!("Failed to parse Solana RPC response: {}", e))
        })?;

        if let Some(error) = json_response.error {
            return Err(GiftError::RpcError(error.message));
        }

        json_response
            .result
            .ok_or_else(|| GiftError::RpcError("Empty Solana RPC response".to_string()))
    }

    fn parse_pubkey(s: &str) -> Result<Pubkey, GiftError> {
        s.parse()
            .map_err(|e| GiftError::InvalidRequest(format!("Invalid Solana address '{}': {}", s, e)))
    }

    /// Rebuild the escrow keypair from its stored seed.
    fn escrow_keypair(escrow: &EscrowKeys) -> Result<Keypair, GiftError> {
        let seed = bs58::decode(&escrow.secret)
            .into_vec()
            .map_err(|_| GiftError::Internal("Escrow secret is not base58".to_string()))?;
        let keypair = Keypair::from_seed(&seed)
            .map_err(|e| GiftError::Internal(format!("Invalid escrow seed: {}", e)))?;

        if keypair.pubkey().to_string() != escrow.public_key {
            return Err(GiftError::Internal(
                "Escrow secret does not match escrow address".to_string(),
            ));
        }
        Ok(keypair)
    }

    /// Transaction over `instructions` paid for and signed by the escrow.
    async fn sign_with_escrow(
        &self,
        keypair: &Keypair,
        instructions: &[Instruction],
    ) -> Result<Transaction, GiftError> {
        let recent_blockhash = self
            .rpc_client
            .get_latest_blockhash()
            .await
            .map_err(|e| GiftError::RpcError(format!("Failed to get recent blockhash: {}", e)))?;

        Ok(Transaction::new_signed_with_payer(
            instructions,
            Some(&keypair.pubkey()),
            &[keypair],
            recent_blockhash,
        ))
    }

    fn encode_transaction(transaction: &Transaction) -> Result<String, GiftError> {
        let bytes = bincode::serialize(transaction)
            .map_err(|e| GiftError::Internal(format!("Failed to serialize transaction: {}", e)))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Instructions moving `transfer` from `from` to `to`, creating the
    /// destination token account if needed (paid by `payer`).
    #[allow(deprecated)]
    fn transfer_instructions(
        payer: &Pubkey,
        from: &Pubkey,
        to: &Pubkey,
        transfer: &AssetTransfer,
    ) -> Result<Vec<Instruction>, GiftError> {
        if transfer.asset.is_native() {
            return Ok(vec![solana_sdk::system_instruction::transfer(
                from,
                to,
                transfer.amount,
            )]);
        }

        let mint = Self::parse_pubkey(&transfer.asset.mint)?;
        let source_ata = get_associated_token_address(from, &mint);
        let dest_ata = get_associated_token_address(to, &mint);

        let create_ata_ix =
            create_associated_token_account_idempotent(payer, to, &mint, &spl_token::id());

        let transfer_ix = transfer_checked(
            &spl_token::id(),
            &source_ata,
            &mint,
            &dest_ata,
            from,
            &[],
            transfer.amount,
            transfer.asset.decimals,
        )
        .map_err(|e| GiftError::Internal(format!("Failed to create transfer instruction: {}", e)))?;

        Ok(vec![create_ata_ix, transfer_ix])
    }
}

#[async_trait]
impl SettlementNetwork for SolanaNetwork {
    async fn balance(&self, owner: &str, asset: &Asset) -> Result<u64, GiftError> {
        let owner = Self::parse_pubkey(owner)?;

        if asset.is_native() {
            return self
                .rpc_client
                .get_balance(&owner)
                .await
                .map_err(|e| GiftError::RpcError(format!("Failed to get SOL balance: {}", e)));
        }

        let mint = Self::parse_pubkey(&asset.mint)?;
        let ata = get_associated_token_address(&owner, &mint);

        match self.rpc_client.get_token_account_balance(&ata).await {
            Ok(balance) => balance
                .amount
                .parse::<u64>()
                .map_err(|e| GiftError::RpcError(format!("Invalid balance amount: {}", e))),
            Err(e) => {
                if e.to_string().contains("could not find account") {
                    debug!("ATA {} not found, balance is 0", ata);
                    Ok(0)
                } else {
                    Err(GiftError::RpcError(format!(
                        "Failed to get {} balance: {}",
                        asset.symbol, e
                    )))
                }
            }
        }
    }

    async fn token_account_exists(&self, owner: &str, asset: &Asset) -> Result<bool, GiftError> {
        if asset.is_native() {
            return Ok(true);
        }

        let owner = Self::parse_pubkey(owner)?;
        let mint = Self::parse_pubkey(&asset.mint)?;
        let ata = get_associated_token_address(&owner, &mint);

        let response = self
            .rpc_client
            .get_account_with_commitment(&ata, CommitmentConfig::confirmed())
            .await
            .map_err(|e| GiftError::RpcError(format!("Failed to get account {}: {}", ata, e)))?;

        Ok(response.value.is_some())
    }

    fn generate_escrow(&self) -> Result<EscrowKeys, GiftError> {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);

        let keypair = Keypair::from_seed(&seed)
            .map_err(|e| GiftError::Internal(format!("Failed to create escrow keypair: {}", e)))?;

        Ok(EscrowKeys {
            public_key: keypair.pubkey().to_string(),
            secret: bs58::encode(seed).into_string(),
        })
    }

    async fn prepare_transfer(
        &self,
        from: &str,
        to: &str,
        transfer: &AssetTransfer,
    ) -> Result<UnsignedTransaction, GiftError> {
        let from = Self::parse_pubkey(from)?;
        let to = Self::parse_pubkey(to)?;

        let instructions = Self::transfer_instructions(&from, &from, &to, transfer)?;

        let (blockhash, last_valid_block_height) = self
            .rpc_client
            .get_latest_blockhash_with_commitment(CommitmentConfig::confirmed())
            .await
            .map_err(|e| GiftError::RpcError(format!("Failed to get recent blockhash: {}", e)))?;

        let mut transaction = Transaction::new_with_payer(&instructions, Some(&from));
        transaction.message.recent_blockhash = blockhash;

        debug!(
            "Prepared {} {} transfer {} -> {}",
            transfer.amount, transfer.asset.symbol, from, to
        );

        Ok(UnsignedTransaction {
            transaction: Self::encode_transaction(&transaction)?,
            recent_blockhash: Some(blockhash.to_string()),
            last_valid_block_height: Some(last_valid_block_height),
        })
    }

    async fn signature_status(&self, signature: &str) -> Result<TxStatus, GiftError> {
        let params = serde_json::json!([[signature], {"searchTransactionHistory": true}]);
        let result: SignatureStatusResult = self.rpc_call("getSignatureStatuses", params).await?;

        match result.value.into_iter().next() {
            Some(Some(status)) => {
                if let Some(err) = status.err {
                    Ok(TxStatus::Failed {
                        reason: err.to_string(),
                    })
                } else if matches!(
                    status.confirmation_status.as_deref(),
                    Some("confirmed") | Some("finalized")
                ) {
                    Ok(TxStatus::Confirmed {
                        confirmations: status.confirmations.unwrap_or(1),
                    })
                } else {
                    Ok(TxStatus::Pending)
                }
            }
            _ => Ok(TxStatus::Pending),
        }
    }

    async fn sign_escrow_transfer(
        &self,
        escrow: &EscrowKeys,
        destination: &str,
        transfers: &[AssetTransfer],
    ) -> Result<SignedTransfer, GiftError> {
        let keypair = Self::escrow_keypair(escrow)?;
        let escrow_pubkey = keypair.pubkey();
        let destination_pubkey = Self::parse_pubkey(destination)?;

        let mut instructions = Vec::new();
        for transfer in transfers.iter().filter(|t| t.amount > 0) {
            instructions.extend(Self::transfer_instructions(
                &escrow_pubkey,
                &escrow_pubkey,
                &destination_pubkey,
                transfer,
            )?);
        }

        if instructions.is_empty() {
            return Err(GiftError::InvalidRequest("Nothing to transfer".to_string()));
        }

        let transaction = self.sign_with_escrow(&keypair, &instructions).await?;
        let signature = transaction.signatures[0].to_string();
        debug!(
            "Signed escrow release {} from {} to {}",
            signature, escrow_pubkey, destination
        );

        Ok(SignedTransfer {
            signature,
            transaction: Self::encode_transaction(&transaction)?,
            destination: destination.to_string(),
            transfers: transfers.to_vec(),
        })
    }

    async fn submit_escrow_transfer(&self, transfer: &SignedTransfer) -> Result<String, GiftError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&transfer.transaction)
            .map_err(|e| GiftError::Internal(format!("Stored transaction is not base64: {}", e)))?;
        let transaction: Transaction = bincode::deserialize(&bytes)
            .map_err(|e| GiftError::Internal(format!("Failed to decode stored transaction: {}", e)))?;

        let signature = self
            .rpc_client
            .send_and_confirm_transaction(&transaction)
            .await
            .map_err(|e| GiftError::TxFailed(format!("Escrow transfer failed: {}", e)))?;

        info!(
            "Escrow released {} transfers to {}, signature: {}",
            transfer.transfers.len(),
            transfer.destination,
            signature
        );

        Ok(signature.to_string())
    }

    async fn sweep_escrow(
        &self,
        escrow: &EscrowKeys,
        assets: &[Asset],
        to: &str,
    ) -> Result<Option<String>, GiftError> {
        let keypair = Self::escrow_keypair(escrow)?;
        let escrow_pubkey = keypair.pubkey();
        let to = Self::parse_pubkey(to)?;

        let mut instructions = Vec::new();
        let mut reclaimed_rent: u64 = 0;
        for asset in assets.iter().filter(|a| !a.is_native()) {
            let mint = Self::parse_pubkey(&asset.mint)?;
            let ata = get_associated_token_address(&escrow_pubkey, &mint);

            let account = self
                .rpc_client
                .get_account_with_commitment(&ata, CommitmentConfig::confirmed())
                .await
                .map_err(|e| GiftError::RpcError(format!("Failed to get account {}: {}", ata, e)))?
                .value;
            let Some(account) = account else {
                continue;
            };

            if self.balance(&escrow.public_key, asset).await? > 0 {
                warn!(
                    "Escrow {} still holds {}, leaving its token account open",
                    escrow_pubkey, asset.symbol
                );
                continue;
            }

            instructions.push(
                close_account(&spl_token::id(), &ata, &to, &escrow_pubkey, &[]).map_err(|e| {
                    GiftError::Internal(format!("Failed to create close instruction: {}", e))
                })?,
            );
            reclaimed_rent = reclaimed_rent.saturating_add(account.lamports);
        }

        let lamports = self
            .rpc_client
            .get_balance(&escrow_pubkey)
            .await
            .map_err(|e| GiftError::RpcError(format!("Failed to get SOL balance: {}", e)))?;

        if lamports < ESCROW_SIGNATURE_FEE_LAMPORTS {
            debug!("Escrow {} cannot pay for a sweep ({} lamports)", escrow_pubkey, lamports);
            return Ok(None);
        }

        let sweepable = (lamports - ESCROW_SIGNATURE_FEE_LAMPORTS).saturating_add(reclaimed_rent);
        if sweepable > 0 {
            #[allow(deprecated)]
            instructions.push(solana_sdk::system_instruction::transfer(
                &escrow_pubkey,
                &to,
                sweepable,
            ));
        }

        if instructions.is_empty() {
            return Ok(None);
        }

        let transaction = self.sign_with_escrow(&keypair, &instructions).await?;
        let signature = self
            .rpc_client
            .send_and_confirm_transaction(&transaction)
            .await
            .map_err(|e| GiftError::TxFailed(format!("Escrow sweep failed: {}", e)))?;

        info!(
            "Swept {} lamports from escrow {} to {}, signature: {}",
            sweepable, escrow_pubkey, to, signature
        );

        Ok(Some(signature.to_string()))
    }

    async fn health_check(&self) -> Result<bool, GiftError> {
        let params: Vec<()> = vec![];
        match self.rpc_call::<_, u64>("getSlot", params).await {
            Ok(slot) => {
                debug!("Solana RPC healthy, slot: {}", slot);
                Ok(true)
            }
            Err(e) => {
                warn!("Solana RPC health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NATIVE_SOL_MINT;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn network(rpc_url: String) -> SolanaNetwork {
        SolanaNetwork::new(SolanaConfig {
            rpc_url,
            timeout: std::time::Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_parse_pubkey() {
        assert!(SolanaNetwork::parse_pubkey("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v").is_ok());
        assert!(SolanaNetwork::parse_pubkey("invalid").is_err());
    }

    #[test]
    fn test_escrow_keys_round_trip() {
        let network = network("http://localhost:8899".into());
        let keys = network.generate_escrow().unwrap();
        let keypair = SolanaNetwork::escrow_keypair(&keys).unwrap();
        assert_eq!(keypair.pubkey().to_string(), keys.public_key);

        let other = network.generate_escrow().unwrap();
        assert_ne!(other.public_key, keys.public_key);

        let mismatched = EscrowKeys {
            public_key: keys.public_key.clone(),
            secret: other.secret,
        };
        assert!(SolanaNetwork::escrow_keypair(&mismatched).is_err());
    }

    #[test]
    fn test_token_transfer_creates_destination_account() {
        let from = Keypair::new().pubkey();
        let to = Keypair::new().pubkey();
        let usdc = AssetTransfer {
            asset: Asset {
                symbol: "USDC".into(),
                mint: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".into(),
                decimals: 6,
            },
            amount: 5_000_000,
        };
        let ixs = SolanaNetwork::transfer_instructions(&from, &from, &to, &usdc).unwrap();
        assert_eq!(ixs.len(), 2);
        assert_eq!(ixs[1].program_id, spl_token::id());

        let sol = AssetTransfer {
            asset: Asset {
                symbol: "SOL".into(),
                mint: NATIVE_SOL_MINT.into(),
                decimals: 9,
            },
            amount: 1,
        };
        let ixs = SolanaNetwork::transfer_instructions(&from, &from, &to, &sol).unwrap();
        assert_eq!(ixs.len(), 1);
    }

    #[tokio::test]
    async fn test_signature_status_mapping() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "params": [["confirmed-sig"]] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": { "context": { "slot": 1 }, "value": [{
                    "slot": 1, "confirmations": 3, "err": null, "confirmationStatus": "confirmed"
                }]}
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "params": [["failed-sig"]] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": { "context": { "slot": 1 }, "value": [{
                    "slot": 1, "confirmations": null,
                    "err": { "InstructionError": [0, "Custom"] },
                    "confirmationStatus": "processed"
                }]}
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "params": [["unknown-sig"]] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": { "context": { "slot": 1 }, "value": [null] }
            })))
            .mount(&mock_server)
            .await;

        let network = network(mock_server.uri());

        assert_eq!(
            network.signature_status("confirmed-sig").await.unwrap(),
            TxStatus::Confirmed { confirmations: 3 }
        );
        assert!(matches!(
            network.signature_status("failed-sig").await.unwrap(),
            TxStatus::Failed { .. }
        ));
        assert_eq!(
            network.signature_status("unknown-sig").await.unwrap(),
            TxStatus::Pending
        );
    }
}
