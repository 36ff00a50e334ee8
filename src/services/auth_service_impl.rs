//! `SeaORM` implementation of the `AuthService` trait.

use crate::db::Store;
use crate::domain::{User, UserId};
use crate::services::auth_service::{AuthError, AuthService, LoginResult, Principal};
use crate::services::tokens::TokenIssuer;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub struct SeaOrmAuthService {
    store: Store,
    tokens: Arc<TokenIssuer>,
}

impl SeaOrmAuthService {
    #[must_use]
    pub const fn new(store: Store, tokens: Arc<TokenIssuer>) -> Self {
        Self { store, tokens }
    }
}

#[async_trait]
impl AuthService for SeaOrmAuthService {
    async fn login(&self, username: &str, secret: &str) -> Result<LoginResult, AuthError> {
        if username.trim().is_empty() || secret.is_empty() {
            return Err(AuthError::Validation(
                "Username and password are required".to_string(),
            ));
        }

        let Some(user) = self.store.verify_user_credentials(username, secret).await? else {
            debug!(username, "Rejected login");
            return Err(AuthError::InvalidCredentials);
        };

        let issued = self.tokens.issue(&user, None)?;
        info!(user_id = %user.id, username = %user.username, "User logged in");

        Ok(LoginResult {
            user,
            token: issued.token,
            expires_at: issued.expires_at,
        })
    }

    async fn resolve(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = self.tokens.verify(token)?;

        let user = self
            .store
            .get_user(&UserId::from(claims.sub.as_str()))
            .await?
            .ok_or_else(|| AuthError::Unauthenticated("User no longer exists".to_string()))?;

        Ok(Principal { user, claims })
    }

    async fn bind_session(&self, user: &User, psid: &str) -> Result<String, AuthError> {
        Ok(self.tokens.issue(user, Some(psid))?.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BootstrapConfig, SecurityConfig};
    use crate::domain::Role;
    use chrono::Duration;

    async fn service() -> (SeaOrmAuthService, Store) {
        let store = Store::new("sqlite::memory:").await.unwrap();
        let security = SecurityConfig {
            argon2_memory_cost_kib: 1024,
            argon2_time_cost: 1,
            ..SecurityConfig::default()
        };
        store
            .bootstrap_admin(
                &BootstrapConfig {
                    admin_username: "admin".into(),
                    admin_secret: Some("123456".into()),
                },
                &security,
            )
            .await
            .unwrap();
        let tokens = Arc::new(TokenIssuer::new("test", Duration::hours(1)));
        (SeaOrmAuthService::new(store.clone(), tokens), store)
    }

    #[tokio::test]
    async fn login_then_resolve() {
        let (auth, _) = service().await;
        let login = auth.login("admin", "123456").await.unwrap();
        assert_eq!(login.user.role, Role::Admin);

        let principal = auth.resolve(&login.token).await.unwrap();
        assert_eq!(principal.user.username, "admin");
        assert_eq!(principal.claims.psid, None);

        let bound = auth.bind_session(&principal.user, "feed").await.unwrap();
        let principal = auth.resolve(&bound).await.unwrap();
        assert_eq!(principal.claims.psid.as_deref(), Some("feed"));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let (auth, _) = service().await;
        assert!(matches!(
            auth.login("admin", "nope").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.login("ghost", "123456").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.login("", "").await,
            Err(AuthError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn deleted_user_token_stops_resolving() {
        let (auth, store) = service().await;
        let login = auth.login("admin", "123456").await.unwrap();
        store.delete_user(&login.user.id).await.unwrap();

        assert!(matches!(
            auth.resolve(&login.token).await,
            Err(AuthError::Unauthenticated(_))
        ));
    }
}
