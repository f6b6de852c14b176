//! Registry of supported assets.

use crate::config::AssetConfig;
use crate::error::GiftError;
use crate::pricing::usd_price_to_micro;
use crate::types::{Asset, NATIVE_SOL_MINT};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct RegisteredAsset {
    asset: Asset,
    default_price: Option<u64>,
}

/// Assets the pipeline can price, swap into and escrow.
#[derive(Debug, Clone)]
pub struct AssetRegistry {
    assets: BTreeMap<String, RegisteredAsset>,
}

impl AssetRegistry {
    /// Build from configuration. The native settlement asset must be listed.
    pub fn from_config(assets: &[AssetConfig]) -> Result<Self, GiftError> {
        let mut registry = BTreeMap::new();

        for config in assets {
            let default_price = match config.default_price_usd {
                Some(price) => Some(usd_price_to_micro(price).ok_or_else(|| {
                    GiftError::Config(format!(
                        "Invalid default price {} for {}",
                        price, config.symbol
                    ))
                })?),
                None => None,
            };

            let asset = Asset {
                symbol: config.symbol.clone(),
                mint: config.mint.clone(),
                decimals: config.decimals,
            };
            if registry
                .insert(config.mint.clone(), RegisteredAsset { asset, default_price })
                .is_some()
            {
                return Err(GiftError::Config(format!(
                    "Asset {} configured twice",
                    config.mint
                )));
            }
        }

        if !registry.contains_key(NATIVE_SOL_MINT) {
            return Err(GiftError::Config(
                "Native SOL must be a configured asset".to_string(),
            ));
        }

        Ok(Self { assets: registry })
    }

    /// Look up an asset by mint.
    pub fn get(&self, mint: &str) -> Result<&Asset, GiftError> {
        self.assets
            .get(mint)
            .map(|r| &r.asset)
            .ok_or_else(|| GiftError::InvalidRequest(format!("Unsupported asset: {}", mint)))
    }

    /// The asset fees and rent are paid in.
    pub fn settlement(&self) -> &Asset {
        // Presence is checked in `from_config`.
        &self.assets[NATIVE_SOL_MINT].asset
    }

    /// Hardcoded fallback price in micro-USD per whole unit.
    pub fn default_price(&self, mint: &str) -> Option<u64> {
        self.assets.get(mint).and_then(|r| r.default_price)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Asset> {
        self.assets.values().map(|r| &r.asset)
    }
}
