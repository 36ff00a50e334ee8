use axum::{
    Json,
    extract::{FromRequestParts, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};
use std::sync::Arc;
use tracing::warn;

use super::{ApiError, ApiResponse, AppState, LoginRequest, LoginResponse};
use crate::domain::User;
use crate::services::Principal;
use crate::session::SessionHandle;

// ============================================================================
// Extractors
// ============================================================================

/// Any authenticated dashboard user.
pub struct AuthUser(pub Principal);

/// An authenticated user whose stored role is ADMIN.
pub struct AdminUser(pub User);

/// An authenticated user with a live platform session.
pub struct PlatformSession {
    pub user: User,
    pub session: SessionHandle,
}

/// Resolves the bearer token once per request and caches the result.
async fn principal(parts: &mut Parts, state: &Arc<AppState>) -> Result<Principal, ApiError> {
    if let Some(principal) = parts.extensions.get::<Principal>() {
        return Ok(principal.clone());
    }

    let token = bearer_token(&parts.headers)
        .ok_or_else(|| ApiError::unauthenticated("Missing or malformed Authorization header"))?;

    let principal = state.shared.auth_service.resolve(token).await?;
    tracing::Span::current().record("user_id", principal.user.id.as_str());
    parts.extensions.insert(principal.clone());
    Ok(principal)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        principal(parts, state).await.map(Self)
    }
}

impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Principal { user, .. } = principal(parts, state).await?;

        if user.role.is_admin() {
            Ok(Self(user))
        } else {
            warn!(user_id = %user.id, path = %parts.uri.path(), "Admin access denied");
            Err(ApiError::forbidden("Admin access required"))
        }
    }
}

impl FromRequestParts<Arc<AppState>> for PlatformSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Principal { user, claims } = principal(parts, state).await?;

        let psid = claims
            .psid
            .ok_or_else(|| ApiError::unauthenticated("No platform session, connect first"))?;

        let session = state
            .shared
            .platform_service
            .session(&psid)
            .await
            .ok_or_else(|| ApiError::unauthenticated("Unauthorized or session expired"))?;

        Ok(Self { user, session })
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<ApiResponse<LoginResponse>>, ApiError> {
    let username = payload.username.unwrap_or_default();
    let secret = payload.secret.unwrap_or_default();

    let result = state.shared.auth_service.login(&username, &secret).await?;

    Ok(Json(ApiResponse::success(LoginResponse {
        user: result.user,
        token: result.token,
        expires_at: result.expires_at,
    })))
}

/// GET /auth/me
pub async fn me(AuthUser(principal): AuthUser) -> Json<ApiResponse<User>> {
    Json(ApiResponse::success(principal.user))
}
