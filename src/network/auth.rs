//! Connection Identity
//!
//! Resolves the numeric user id of a connecting socket from the upgrade
//! request. Two modes:
//!
//! - **Token mode** (`AUTH_SECRET` set): the request must carry
//!   `token=<jwt>`, an HS256 token signed with the identity service's shared
//!   secret; the id is the token's `ID` claim, or a numeric `sub`.
//! - **Trusted mode** (nothing configured): the id is taken from the `id`
//!   query parameter or `id` header, as issued by the identity service.

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::game::UserId;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// HS256 secret, shared with the identity service.
    pub secret: Option<String>,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Check if token validation is configured.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }
}

/// Claims issued by the identity service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Numeric user id.
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<UserId>,
    /// Subject, used when `ID` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
}

impl TokenClaims {
    /// User id carried by the token.
    pub fn user_id(&self) -> Result<UserId, AuthError> {
        let id = match (self.id, self.sub.as_deref()) {
            (Some(id), _) => id,
            (None, Some(sub)) => sub
                .parse()
                .map_err(|_| AuthError::InvalidIdentity(sub.to_string()))?,
            (None, None) => return Err(AuthError::MissingClaim("ID".into())),
        };
        non_zero(id)
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Request carried neither token nor id.
    #[error("missing identity")]
    MissingIdentity,
    /// Identity was not a positive integer.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

fn non_zero(id: UserId) -> Result<UserId, AuthError> {
    if id == 0 {
        Err(AuthError::InvalidIdentity("0".into()))
    } else {
        Ok(id)
    }
}

/// Value of `key` in a raw query string.
pub fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Resolve the connecting user's id.
///
/// `query` is the raw request query string, `id_header` the value of an
/// `id` header if present.
pub fn resolve_identity(
    query: Option<&str>,
    id_header: Option<&str>,
    config: &AuthConfig,
) -> Result<UserId, AuthError> {
    let query = query.unwrap_or_default();

    if config.is_configured() {
        let token = query_param(query, "token").ok_or(AuthError::MissingIdentity)?;
        return validate_token(token, config)?.user_id();
    }

    let raw = query_param(query, "id")
        .or(id_header)
        .ok_or(AuthError::MissingIdentity)?;
    let id = raw
        .trim()
        .parse::<UserId>()
        .map_err(|_| AuthError::InvalidIdentity(raw.to_string()))?;
    non_zero(id)
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let secret = config.secret.as_ref().ok_or(AuthError::NotConfigured)?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims = std::collections::HashSet::new();
    validation.validate_aud = false;
    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let key = DecodingKey::from_secret(secret.as_bytes());
    let token_data: TokenData<TokenClaims> =
        decode(token, &key, &validation).map_err(map_jwt_error)?;

    let claims = token_data.claims;

    // Tokens without `exp` slip past the library check.
    if !config.skip_expiry && claims.exp > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidAlgorithm => AuthError::InvalidSignature,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
