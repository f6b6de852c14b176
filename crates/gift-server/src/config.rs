//! Server configuration loaded from environment variables.
//!
//! Nested keys use `__`, e.g. `GIFT__CLAIM__LOCK_DURATION=4h` or
//! `PRICE_ORACLE__BASE_URL=https://...`.

use anyhow::{Context, Result};
use gift_escrow::GiftConfig;
use secrecy::SecretString;
use serde::Deserialize;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Pipeline configuration
    #[serde(default)]
    pub gift: GiftConfig,

    #[serde(default = "default_price_oracle")]
    pub price_oracle: VenueConfig,

    #[serde(default = "default_swap_venue")]
    pub swap_venue: VenueConfig,

    #[serde(default)]
    pub operator: OperatorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

/// HTTP venue endpoint (price oracle or swap venue).
#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperatorConfig {
    /// Bearer token for operator endpoints; unset closes them.
    #[serde(default)]
    pub token: Option<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info,gift_escrow=debug".into()
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_price_oracle() -> VenueConfig {
    VenueConfig {
        base_url: "https://lite-api.jup.ag/price/v2".into(),
        api_key: None,
        timeout: default_timeout(),
    }
}

fn default_swap_venue() -> VenueConfig {
    VenueConfig {
        base_url: "https://lite-api.jup.ag/swap/v1".into(),
        api_key: None,
        timeout: default_timeout(),
    }
}

impl Config {
    /// Load configuration from `.env` and the environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}
