//! Price cache in front of the oracle.
//!
//! Fallback order per asset: fresh oracle price, then the last good cached
//! price (even if stale), then the registry's hardcoded default (snapshot is
//! flagged `degraded`). Only an asset with none of these is unavailable.

use crate::assets::AssetRegistry;
use crate::error::GiftError;
use crate::pricing::usd_price_to_micro;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use price_oracle_client::PriceOracleClient;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// USD price source keyed by mint.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Prices in USD per whole unit. Unknown mints are simply absent.
    async fn usd_prices(&self, mints: &[String]) -> Result<HashMap<String, f64>, GiftError>;
}

#[async_trait]
impl PriceOracle for PriceOracleClient {
    async fn usd_prices(&self, mints: &[String]) -> Result<HashMap<String, f64>, GiftError> {
        Ok(self.prices_with_retry(mints, Some(2)).await?)
    }
}

/// Prices used for one computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    /// Micro-USD per whole unit, by mint.
    pub prices: BTreeMap<String, u64>,
    /// At least one price is a hardcoded default.
    pub degraded: bool,
    /// At least one price came from an expired cache entry.
    pub stale: bool,
    pub taken_at: DateTime<Utc>,
}

impl PriceSnapshot {
    /// Snapshot with fixed prices (previews and tests).
    pub fn fixed(prices: BTreeMap<String, u64>) -> Self {
        Self {
            prices,
            degraded: false,
            stale: false,
            taken_at: Utc::now(),
        }
    }

    pub fn price(&self, mint: &str) -> Result<u64, GiftError> {
        self.prices
            .get(mint)
            .copied()
            .ok_or_else(|| GiftError::PriceUnavailable(mint.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: u64,
    fetched_at: Instant,
}

/// Oracle prices cached for a configurable TTL.
pub struct PriceCache {
    oracle: Arc<dyn PriceOracle>,
    registry: Arc<AssetRegistry>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedPrice>>,
}

impl PriceCache {
    pub fn new(oracle: Arc<dyn PriceOracle>, registry: Arc<AssetRegistry>, ttl: Duration) -> Self {
        Self {
            oracle,
            registry,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Price every mint, refreshing whatever is missing or expired.
    pub async fn snapshot(&self, mints: &[String]) -> Result<PriceSnapshot, GiftError> {
        let mut wanted: Vec<String> = mints.to_vec();
        wanted.sort();
        wanted.dedup();

        let expired: Vec<String> = {
            let entries = self.entries.read().await;
            wanted
                .iter()
                .filter(|mint| {
                    entries
                        .get(*mint)
                        .map_or(true, |e| e.fetched_at.elapsed() >= self.ttl)
                })
                .cloned()
                .collect()
        };

        if !expired.is_empty() {
            self.refresh(&expired).await;
        }

        let entries = self.entries.read().await;
        let mut snapshot = PriceSnapshot {
            prices: BTreeMap::new(),
            degraded: false,
            stale: false,
            taken_at: Utc::now(),
        };

        for mint in &wanted {
            if let Some(entry) = entries.get(mint) {
                if entry.fetched_at.elapsed() >= self.ttl {
                    warn!("Serving stale cached price for {}", mint);
                    snapshot.stale = true;
                }
                snapshot.prices.insert(mint.clone(), entry.price);
            } else if let Some(default) = self.registry.default_price(mint) {
                warn!("Price oracle unavailable for {}, using default (degraded)", mint);
                snapshot.degraded = true;
                snapshot.prices.insert(mint.clone(), default);
            } else {
                return Err(GiftError::PriceUnavailable(mint.clone()));
            }
        }

        Ok(snapshot)
    }

    /// Current price of one asset.
    pub async fn price(&self, mint: &str) -> Result<u64, GiftError> {
        self.snapshot(&[mint.to_string()]).await?.price(mint)
    }

    async fn refresh(&self, mints: &[String]) {
        match self.oracle.usd_prices(mints).await {
            Ok(prices) => {
                let now = Instant::now();
                let mut entries = self.entries.write().await;
                for (mint, price) in prices {
                    match usd_price_to_micro(price) {
                        Some(price) => {
                            debug!("Cached price for {}: {} micro-USD", mint, price);
                            entries.insert(mint, CachedPrice { price, fetched_at: now });
                        }
                        None => warn!("Ignoring invalid oracle price {} for {}", price, mint),
                    }
                }
            }
            Err(e) => {
                warn!("Price oracle fetch failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssetConfig;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    const SOL: &str = crate::types::NATIVE_SOL_MINT;
    const USDC: &str = "usdc-mint";
    const NODEFAULT: &str = "no-default-mint";

    struct MockOracle {
        fail: AtomicBool,
        calls: AtomicU32,
        prices: HashMap<String, f64>,
    }

    impl MockOracle {
        fn new(prices: &[(&str, f64)]) -> Self {
            Self {
                fail: AtomicBool::new(false),
                calls: AtomicU32::new(0),
                prices: prices.iter().map(|(m, p)| (m.to_string(), *p)).collect(),
            }
        }
    }

    #[async_trait]
    impl PriceOracle for MockOracle {
        async fn usd_prices(&self, mints: &[String]) -> Result<HashMap<String, f64>, GiftError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(GiftError::NetworkError("oracle down".into()));
            }
            Ok(mints
                .iter()
                .filter_map(|m| self.prices.get(m).map(|p| (m.clone(), *p)))
                .collect())
        }
    }

    fn registry() -> Arc<AssetRegistry> {
        Arc::new(
            AssetRegistry::from_config(&[
                AssetConfig::new("SOL", SOL, 9, Some(100.0)),
                AssetConfig::new("USDC", USDC, 6, Some(1.0)),
                AssetConfig::new("ND", NODEFAULT, 6, None),
            ])
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_fresh_prices_are_cached() {
        let oracle = Arc::new(MockOracle::new(&[(SOL, 150.0), (USDC, 1.0)]));
        let cache = PriceCache::new(oracle.clone(), registry(), Duration::from_secs(60));

        let snapshot = cache.snapshot(&[SOL.into(), USDC.into()]).await.unwrap();
        assert_eq!(snapshot.price(SOL).unwrap(), 150_000_000);
        assert!(!snapshot.degraded);
        assert!(!snapshot.stale);

        cache.snapshot(&[SOL.into()]).await.unwrap();
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_cache_served_when_oracle_fails() {
        let oracle = Arc::new(MockOracle::new(&[(SOL, 150.0)]));
        let cache = PriceCache::new(oracle.clone(), registry(), Duration::ZERO);

        cache.snapshot(&[SOL.into()]).await.unwrap();
        oracle.fail.store(true, Ordering::SeqCst);

        let snapshot = cache.snapshot(&[SOL.into()]).await.unwrap();
        assert_eq!(snapshot.price(SOL).unwrap(), 150_000_000);
        assert!(snapshot.stale);
        assert!(!snapshot.degraded);
    }

    #[tokio::test]
    async fn test_default_price_is_degraded() {
        let oracle = Arc::new(MockOracle::new(&[]));
        oracle.fail.store(true, Ordering::SeqCst);
        let cache = PriceCache::new(oracle, registry(), Duration::from_secs(30));

        let snapshot = cache.snapshot(&[SOL.into()]).await.unwrap();
        assert_eq!(snapshot.price(SOL).unwrap(), 100_000_000);
        assert!(snapshot.degraded);
    }

    #[tokio::test]
    async fn test_unavailable_without_default() {
        let oracle = Arc::new(MockOracle::new(&[]));
        let cache = PriceCache::new(oracle, registry(), Duration::from_secs(30));

        let result = cache.snapshot(&[NODEFAULT.into()]).await;
        assert!(matches!(result, Err(GiftError::PriceUnavailable(m)) if m == NODEFAULT));
    }
}
