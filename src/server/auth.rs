//! API token authentication.
//!
//! Tokens come from `Authorization: Bearer <token>`, `X-API-Key: <token>` or a
//! `?token=` query parameter (browsers cannot set headers on an EventSource).
//! With no tokens configured, every request is allowed.

use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};
use sha2::{Digest, Sha256};

use super::error::ApiError;

/// Accepted API tokens, stored hashed
#[derive(Debug, Clone, Default)]
pub struct ApiAuth {
    token_hashes: Vec<[u8; 32]>,
}

fn hash_token(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

impl ApiAuth {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            token_hashes: tokens
                .into_iter()
                .filter(|t| !t.as_ref().is_empty())
                .map(|t| hash_token(t.as_ref()))
                .collect(),
        }
    }

    /// Auth is enforced only when at least one token is configured
    pub fn is_enabled(&self) -> bool {
        !self.token_hashes.is_empty()
    }

    pub fn validate(&self, token: &str) -> bool {
        let candidate = hash_token(token);
        // Compare every byte regardless of where the first mismatch is
        self.token_hashes.iter().any(|known| {
            known
                .iter()
                .zip(candidate.iter())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
        })
    }
}

/// Extractor that rejects requests without a valid token
pub struct RequireAuth;

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth = parts
            .extensions
            .get::<Arc<ApiAuth>>()
            .ok_or_else(|| ApiError::internal("Authentication is not configured"))?;

        if !auth.is_enabled() {
            return Ok(RequireAuth);
        }

        let token = extract_token(parts).ok_or_else(|| {
            ApiError::unauthorized(
                "Authentication required. Provide Authorization: Bearer <token> or X-API-Key header.",
            )
        })?;

        if auth.validate(&token) {
            Ok(RequireAuth)
        } else {
            Err(ApiError::unauthorized("Invalid token or API key"))
        }
    }
}

/// Extract token from request headers or query params
fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    if let Some(value) = parts.headers.get("x-api-key").and_then(|h| h.to_str().ok()) {
        return Some(value.trim().to_string());
    }

    parts.uri.query().and_then(|query| {
        query
            .split('&')
            .find_map(|param| param.strip_prefix("token="))
            .map(str::to_string)
    })
}
