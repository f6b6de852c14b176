//! Gift escrow server - Main entry point.

mod config;
mod error;

use crate::config::{Config, LogFormat};
use crate::error::AppResult;
use anyhow::Context;
use gift_escrow::{
    api::{create_router, AppState},
    spawn_refund_sweeper, ClaimVerifier, Collaborators, EmailNotifier, FulfillmentMachine,
    GiftStore, HttpIdentityProvider, HttpOnramp, RefundSweeper, SettlementNetwork, SolanaNetwork,
};
use price_oracle_client::PriceOracleClient;
use std::net::SocketAddr;
use std::sync::Arc;
use swap_venue_client::SwapVenueClient;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> AppResult<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.log.level, config.log.format);

    info!("Starting gift escrow server...");

    // Settlement network and venue clients
    let network = Arc::new(
        SolanaNetwork::new(config.gift.solana.clone()).context("Failed to create Solana client")?,
    );
    if network.health_check().await.unwrap_or(false) {
        info!("Solana RPC healthy at {}", config.gift.solana.rpc_url);
    } else {
        warn!("Solana RPC health check failed - will retry on requests");
    }

    let oracle = PriceOracleClient::new(
        &config.price_oracle.base_url,
        config.price_oracle.api_key.clone(),
        config.price_oracle.timeout,
    )?;
    let swap_venue = SwapVenueClient::new(
        &config.swap_venue.base_url,
        config.swap_venue.api_key.clone(),
        config.swap_venue.timeout,
    )?;

    let onramp = HttpOnramp::new(config.gift.onramp.clone())?;
    let notifier = EmailNotifier::new(config.gift.email.clone())?;
    let identity = HttpIdentityProvider::new(config.gift.identity.clone())?;

    // Storage
    let store = Arc::new(GiftStore::open(&config.gift.storage).await?);
    info!("Gift store ready ({} gifts)", store.count().await);

    // Pipeline
    let machine = FulfillmentMachine::new(
        config.gift.clone(),
        store.clone(),
        Collaborators {
            network: network.clone(),
            swap_venue: Arc::new(swap_venue),
            onramp: Arc::new(onramp),
            notifier: Arc::new(notifier),
            oracle: Arc::new(oracle),
        },
    )?;
    let claims = Arc::new(ClaimVerifier::new(
        store.clone(),
        network.clone(),
        config.gift.claim.clone(),
    ));

    // Background work
    let report = machine.resume().await;
    info!("Resume complete: {:?}", report);

    let sweeper_handle = if config.gift.refund.enabled {
        let sweeper = Arc::new(RefundSweeper::new(
            store.clone(),
            network.clone(),
            config.gift.refund.clone(),
        ));
        Some(spawn_refund_sweeper(sweeper))
    } else {
        info!("Refund sweep disabled");
        None
    };

    // HTTP API
    let state = AppState::new(
        machine,
        claims,
        Arc::new(identity),
        config.operator.token.clone(),
    );
    if state.operator_token.is_none() {
        warn!("No operator token configured - operator endpoints are closed");
    }
    let app = create_router(state, config.gift.claim.requests_per_minute);

    let addr = SocketAddr::new(
        config
            .server
            .listen_addr
            .parse()
            .unwrap_or([0, 0, 0, 0].into()),
        config.server.port,
    );
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = sweeper_handle {
        handle.abort();
    }

    info!("Shutting down...");
    Ok(())
}

async fn shutdown_signal() {
    if signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
