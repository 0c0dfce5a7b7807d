//! API module - Axum HTTP server and routes
//!
//! All API endpoints for the simulated trading platform. Market data and
//! account routes require a bearer token; registration, login and the
//! health probe are public.

mod handlers;

use crate::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main application router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ==========================================
        // Status & Health
        // ==========================================
        .route("/api/health", get(handlers::health_check))
        // ==========================================
        // Auth
        // ==========================================
        .route("/api/auth/register", post(handlers::register))
        .route("/api/auth/login", post(handlers::login))
        // ==========================================
        // Market Data
        // ==========================================
        .route("/api/market/assets", get(handlers::get_supported_assets))
        .route("/api/market/:coin/price", get(handlers::get_price))
        .route("/api/market/:coin/history", get(handlers::get_price_history))
        // ==========================================
        // Trading
        // ==========================================
        .route("/api/trading/buy", post(handlers::buy))
        .route("/api/trading/history", get(handlers::get_transaction_history))
        .route("/api/trading/balance", get(handlers::get_balance))
        // ==========================================
        // Account
        // ==========================================
        .route("/api/account/balance/add", post(handlers::add_balance))
        // Apply middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
