//! Domain service for authentication.
//!
//! Handles login and bearer token resolution.

use serde::Serialize;
use thiserror::Error;

use crate::domain::User;
use crate::services::tokens::{Claims, TokenError};

/// Errors specific to authentication operations.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    Unauthenticated(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        Self::Database(format!("{err:#}"))
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => Self::Unauthenticated("Token expired".to_string()),
            TokenError::Invalid => Self::Unauthenticated("Invalid token".to_string()),
            TokenError::Signing(msg) => Self::Internal(msg),
        }
    }
}

/// Login result: the user record (never the secret) and a bearer token.
#[derive(Debug, Clone, Serialize)]
pub struct LoginResult {
    pub user: User,
    pub token: String,
    pub expires_at: i64,
}

/// A bearer token resolved to a live user.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user: User,
    pub claims: Claims,
}

/// Domain service trait for authentication.
#[async_trait::async_trait]
pub trait AuthService: Send + Sync {
    /// Verifies credentials and issues a token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] if login fails.
    async fn login(&self, username: &str, secret: &str) -> Result<LoginResult, AuthError>;

    /// Verifies a bearer token and loads its user from the store.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthenticated`] for bad or expired tokens and for
    /// users that no longer exist.
    async fn resolve(&self, token: &str) -> Result<Principal, AuthError>;

    /// Re-issues the user's token bound to platform session `psid`.
    async fn bind_session(&self, user: &User, psid: &str) -> Result<String, AuthError>;
}
