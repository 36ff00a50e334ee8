//! Signed bearer tokens.
//!
//! A single HS256 JWT identifies the dashboard user and, once a platform
//! connection is open, carries the session reference (`psid`) as well.

use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{Role, User};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Role at issue time. Informational only; authorization re-reads it.
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psid: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Token expired")]
    Expired,

    #[error("Invalid token")]
    Invalid,

    #[error("Failed to sign token: {0}")]
    Signing(String),
}

pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenIssuer {
    /// Builds an issuer from a shared secret. An empty secret is replaced by
    /// random bytes, which invalidates all tokens on restart.
    #[must_use]
    pub fn new(secret: &str, ttl: Duration) -> Self {
        let secret = if secret.is_empty() {
            warn!("No auth.jwt_secret configured, generating an ephemeral one");
            let mut bytes = [0u8; 32];
            rand::rng().fill_bytes(&mut bytes);
            bytes.to_vec()
        } else {
            secret.as_bytes().to_vec()
        };

        let mut validation = Validation::default();
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(&secret),
            decoding: DecodingKey::from_secret(&secret),
            validation,
            ttl,
        }
    }

    /// Issues a token for `user`, optionally bound to a platform session.
    pub fn issue(&self, user: &User, psid: Option<&str>) -> Result<IssuedToken, TokenError> {
        let now = Utc::now();
        let exp = (now + self.ttl).timestamp();
        let claims = Claims {
            sub: user.id.to_string(),
            role: user.role,
            psid: psid.map(str::to_string),
            iat: now.timestamp(),
            exp,
        };

        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))?;

        Ok(IssuedToken {
            token,
            expires_at: exp,
        })
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserId;

    fn user() -> User {
        User {
            id: UserId::from("user-1"),
            username: "alice".into(),
            role: Role::User,
            assigned_vms: vec![],
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn issue_and_verify() {
        let issuer = TokenIssuer::new("test-secret", Duration::hours(1));
        let issued = issuer.issue(&user(), Some("abc")).unwrap();
        let claims = issuer.verify(&issued.token).unwrap();

        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.role, Role::User);
        assert_eq!(claims.psid.as_deref(), Some("abc"));
        assert_eq!(claims.exp, issued.expires_at);
    }

    #[test]
    fn rejects_foreign_signature() {
        let a = TokenIssuer::new("secret-a", Duration::hours(1));
        let b = TokenIssuer::new("secret-b", Duration::hours(1));
        let issued = a.issue(&user(), None).unwrap();
        assert!(matches!(b.verify(&issued.token), Err(TokenError::Invalid)));
        assert!(matches!(a.verify("garbage"), Err(TokenError::Invalid)));
    }

    #[test]
    fn rejects_expired() {
        let issuer = TokenIssuer::new("secret", Duration::hours(-1));
        let issued = issuer.issue(&user(), None).unwrap();
        assert!(matches!(issuer.verify(&issued.token), Err(TokenError::Expired)));
    }

    #[test]
    fn ephemeral_secret_still_round_trips() {
        let issuer = TokenIssuer::new("", Duration::hours(1));
        let issued = issuer.issue(&user(), None).unwrap();
        assert!(issuer.verify(&issued.token).is_ok());
    }
}
