//! Gateway authentication.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

use crate::config::ServerConfig;

/// Header carrying the API token.
pub const TOKEN_HEADER: &str = "x-token";

/// Token-based authentication for API requests.
#[derive(Debug, Clone)]
pub struct GatewayAuth {
    valid_tokens: Vec<String>,
}

impl GatewayAuth {
    /// Create a new auth validator from the server config.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.auth_tokens.clone())
    }

    /// Create a new auth validator with the given tokens.
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            valid_tokens: tokens,
        }
    }

    /// Validate a token.
    ///
    /// If no tokens are configured, all tokens are accepted (open mode).
    pub fn validate(&self, token: &str) -> bool {
        if self.valid_tokens.is_empty() {
            return true;
        }
        self.valid_tokens.iter().any(|t| t == token)
    }

    /// Validate the token presented in request headers, if any.
    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        if self.is_open_mode() {
            return true;
        }
        token_from_headers(headers).is_some_and(|token| self.validate(token))
    }

    /// Number of configured tokens.
    pub fn token_count(&self) -> usize {
        self.valid_tokens.len()
    }

    /// Whether the gateway is in open mode (no auth required).
    pub fn is_open_mode(&self) -> bool {
        self.valid_tokens.is_empty()
    }
}

/// `X-Token: <t>` wins over `Authorization: Bearer <t>`.
pub fn token_from_headers(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(token.trim());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}
