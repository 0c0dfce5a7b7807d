//! Session token and password storage
//!
//! Tokens are `claims.signature` pairs: base64url-encoded JSON claims
//! (`sub` = account id, `exp` = unix expiry) signed with HMAC-SHA256 over
//! the encoded claims. Verification recomputes the MAC in constant time
//! before the claims are even parsed.
//!
//! Passwords are stored as `salt$digest`, both base64, where digest is
//! SHA-256 over salt followed by the password bytes.

use crate::AppState;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("token is malformed or has a bad signature")]
    InvalidToken,
    #[error("token has expired")]
    Expired,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    exp: i64,
}

/// Issues and verifies bearer tokens for authenticated sessions.
pub struct TokenSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            ttl,
        }
    }

    /// Create a signed token for `account_id`, valid for the configured TTL.
    pub fn sign(&self, account_id: Uuid) -> String {
        let claims = Claims {
            sub: account_id,
            exp: Utc::now().timestamp() + self.ttl.as_secs() as i64,
        };
        self.sign_claims(&claims)
    }

    fn sign_claims(&self, claims: &Claims) -> String {
        // Serializing two plain fields cannot fail
        let payload = serde_json::to_vec(claims).unwrap_or_default();
        let encoded = BASE64_URL.encode(payload);

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(encoded.as_bytes());
        let signature = BASE64_URL.encode(mac.finalize().into_bytes());

        format!("{encoded}.{signature}")
    }

    /// Verify signature and expiry, returning the account id.
    pub fn verify(&self, token: &str) -> Result<Uuid, AuthError> {
        let (encoded, signature) = token.split_once('.').ok_or(AuthError::InvalidToken)?;
        let signature = BASE64_URL
            .decode(signature)
            .map_err(|_| AuthError::InvalidToken)?;

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(encoded.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidToken)?;

        let payload = BASE64_URL
            .decode(encoded)
            .map_err(|_| AuthError::InvalidToken)?;
        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| AuthError::InvalidToken)?;

        if claims.exp < Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(claims.sub)
    }
}

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let salt: [u8; SALT_LEN] = rand::random();
    let digest = salted_digest(&salt, password);
    format!("{}${}", BASE64.encode(salt), BASE64.encode(digest))
}

/// Check a password against a stored `salt$digest` hash.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    let (Ok(salt), Ok(digest)) = (BASE64.decode(salt), BASE64.decode(digest)) else {
        return false;
    };

    salted_digest(&salt, password) == digest
}

fn salted_digest(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Extractor for handlers behind authentication. Rejects with 401 when the
/// bearer token is missing, malformed or expired.
pub struct AuthSession {
    pub account_id: Uuid,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthSession
where
    Arc<AppState>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = Arc::<AppState>::from_ref(state);

        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| unauthorized("Missing bearer token"))?;

        let account_id = state.tokens.verify(token).map_err(|err| {
            debug!("Rejected bearer token: {}", err);
            unauthorized("Invalid or expired token")
        })?;

        Ok(AuthSession { account_id })
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "success": false,
            "error": message
        })),
    )
        .into_response()
}
