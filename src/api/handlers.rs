//! API request handlers
//!
//! All endpoint handlers for the trading API. Each error kind maps to one
//! HTTP status and one human-readable message; internal causes (transport,
//! decode, SQL) are logged here and never echoed to the caller.

use crate::auth::{hash_password, verify_password, AuthSession};
use crate::db::{Account, AccountStore, StoreError};
use crate::market::MarketError;
use crate::trading::TradeError;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

// ==========================================
// Response Helpers
// ==========================================

pub fn error_response(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": error
        })),
    )
        .into_response()
}

fn trade_error_response(err: TradeError) -> Response {
    match err {
        TradeError::InvalidAmount => {
            error_response(StatusCode::BAD_REQUEST, "The amount entered is invalid")
        }
        TradeError::InsufficientFunds => {
            error_response(StatusCode::BAD_REQUEST, "Insufficient balance")
        }
        TradeError::AccountNotFound => {
            error_response(StatusCode::NOT_FOUND, "Account not found")
        }
        TradeError::Price(market_err) => market_error_response(market_err),
        TradeError::Persistence(cause) => {
            error!("Persistence failure during trading operation: {}", cause);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist the operation",
            )
        }
    }
}

fn market_error_response(err: MarketError) -> Response {
    match err {
        MarketError::AssetNotFound { .. } => {
            error_response(StatusCode::NOT_FOUND, "Asset not supported or unavailable")
        }
        MarketError::Unavailable => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Price service is unavailable",
        ),
        MarketError::Upstream { .. } => {
            error!("Price service failure: {}", err);
            error_response(StatusCode::BAD_GATEWAY, "Price service request failed")
        }
        MarketError::Decode(_) => {
            error!("Price service failure: {}", err);
            error_response(
                StatusCode::BAD_GATEWAY,
                "Price service returned an unreadable response",
            )
        }
        MarketError::InvalidUrl(_) => {
            error!("Price service misconfiguration: {}", err);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Price service is misconfigured",
            )
        }
    }
}

// ==========================================
// Request Types
// ==========================================

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct BuyRequest {
    pub coin: String,
    /// Quantity as entered by the user; validated by the trading layer.
    pub amount: String,
}

#[derive(Debug, Deserialize)]
pub struct AddBalanceRequest {
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct PriceQuery {
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub start: String,
    pub end: String,
}

// ==========================================
// Health
// ==========================================

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "cryptosim_backend",
        "version": "1.0.0"
    }))
}

// ==========================================
// Auth Handlers
// ==========================================

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AuthRequest>,
) -> Response {
    if request.username.is_empty() || request.password.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Username and password are required");
    }

    match state.db.find_by_username(&request.username).await {
        Ok(_) => return error_response(StatusCode::CONFLICT, "User already exists"),
        Err(StoreError::NotFound) => {}
        Err(err) => {
            error!("Username lookup failed during registration: {}", err);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not create user");
        }
    }

    let account = Account::new(request.username, hash_password(&request.password));
    if let Err(err) = state.db.insert(&account).await {
        error!("Failed to insert new account: {}", err);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not create user");
    }

    info!("Registered new account {} ({})", account.username, account.id);
    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "message": "User registered",
            "account": {
                "id": account.id,
                "username": account.username,
                "balance": account.balance,
            }
        })),
    )
        .into_response()
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AuthRequest>,
) -> Response {
    // One generic message for every failure so usernames cannot be probed
    let rejected = || error_response(StatusCode::UNAUTHORIZED, "Invalid username or password");

    let account = match state.db.find_by_username(&request.username).await {
        Ok(account) => account,
        Err(StoreError::NotFound) => return rejected(),
        Err(err) => {
            error!("Username lookup failed during login: {}", err);
            return rejected();
        }
    };

    if !verify_password(&request.password, &account.password_hash) {
        return rejected();
    }

    let token = state.tokens.sign(account.id);
    Json(serde_json::json!({ "token": token })).into_response()
}

// ==========================================
// Market Data Handlers
// ==========================================

pub async fn get_price(
    State(state): State<Arc<AppState>>,
    _session: AuthSession,
    Path(coin): Path<String>,
    Query(query): Query<PriceQuery>,
) -> Response {
    match state.market.current_price(&coin, &query.currency).await {
        Ok(price) => Json(serde_json::json!({
            "crypto": coin,
            "currency": query.currency,
            "price": price,
        }))
        .into_response(),
        Err(err) => market_error_response(err),
    }
}

pub async fn get_price_history(
    State(state): State<Arc<AppState>>,
    _session: AuthSession,
    Path(coin): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let Some(from_unix) = parse_date_bound(&query.start) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Start date must be dd-mm-yyyy or RFC3339",
        );
    };
    let Some(to_unix) = parse_date_bound(&query.end) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "End date must be dd-mm-yyyy or RFC3339",
        );
    };

    match state.market.historical_prices(&coin, from_unix, to_unix).await {
        Ok(points) => Json(points).into_response(),
        Err(err) => market_error_response(err),
    }
}

pub async fn get_supported_assets(
    State(state): State<Arc<AppState>>,
    _session: AuthSession,
) -> Response {
    match state.market.supported_assets().await {
        Ok(assets) => Json(serde_json::json!({
            "count": assets.len(),
            "assets": assets,
        }))
        .into_response(),
        Err(err) => market_error_response(err),
    }
}

/// Accepts dd-mm-yyyy (midnight UTC) or a full RFC3339 timestamp.
fn parse_date_bound(raw: &str) -> Option<i64> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%d-%m-%Y") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|timestamp| timestamp.timestamp())
}

// ==========================================
// Trading Handlers
// ==========================================

pub async fn buy(
    State(state): State<Arc<AppState>>,
    session: AuthSession,
    Json(request): Json<BuyRequest>,
) -> Response {
    match state
        .trading
        .buy(session.account_id, &request.coin, &request.amount)
        .await
    {
        Ok(outcome) => Json(serde_json::json!({
            "message": "Buy executed",
            "balance": outcome.balance,
            "holdings": outcome.holdings,
            "transaction": outcome.transaction,
        }))
        .into_response(),
        Err(err) => trade_error_response(err),
    }
}

pub async fn get_transaction_history(
    State(state): State<Arc<AppState>>,
    session: AuthSession,
) -> Response {
    match state.trading.history(session.account_id).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => trade_error_response(err),
    }
}

pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    session: AuthSession,
) -> Response {
    match state.trading.balances(session.account_id).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => trade_error_response(err),
    }
}

// ==========================================
// Account Handlers
// ==========================================

pub async fn add_balance(
    State(state): State<Arc<AppState>>,
    session: AuthSession,
    Json(request): Json<AddBalanceRequest>,
) -> Response {
    match state.trading.deposit(session.account_id, request.amount).await {
        Ok(balance) => Json(serde_json::json!({
            "message": "Balance added",
            "balance": balance,
        }))
        .into_response(),
        Err(err) => trade_error_response(err),
    }
}
