//! CryptoSim - Simulated Crypto Trading Backend
//!
//! Paper-trading API priced from the CoinGecko public API.

mod api;
mod auth;
mod config;
mod db;
mod market;
mod trading;

use crate::api::create_router;
use crate::auth::TokenSigner;
use crate::config::AppConfig;
use crate::db::Database;
use crate::market::MarketClient;
use crate::trading::TradingService;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Application state shared across all handlers
pub struct AppState {
    pub db: Database,
    pub market: Arc<MarketClient>,
    pub tokens: TokenSigner,
    pub trading: TradingService<MarketClient, Database>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("CryptoSim backend starting");

    let config = AppConfig::from_env();

    // Initialize database
    info!("Connecting to database...");
    let db = Database::new(&config.database_url).await?;
    db.migrate().await?;
    info!("Database connected");

    // The price client is constructed once here and injected everywhere it
    // is needed - one instance owns the rate-limit clock for the process.
    info!(
        "Price client: {} ({} req/min)",
        config.market.base_url, config.market.max_requests_per_minute
    );
    let market = Arc::new(MarketClient::new(config.market.clone())?);

    let tokens = TokenSigner::new(&config.token_secret, config.token_ttl);
    let trading = TradingService::new(market.clone(), db.clone());

    // Create application state
    let state = Arc::new(AppState {
        db,
        market,
        tokens,
        trading,
    });

    // Create router with all API endpoints
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Starting API server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
