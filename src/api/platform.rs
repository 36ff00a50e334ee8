//! Platform proxy endpoints.
//!
//! `connect` needs only a logged-in user; everything else needs a token that
//! also carries a live platform session.

use axum::{
    Json,
    extract::{Path, State},
};
use std::sync::Arc;

use super::auth::{AuthUser, PlatformSession};
use super::validation::{required, validate_vm_id};
use super::{
    ApiError, ApiResponse, AppState, ConnectRequest, ConnectResponse, CreateSnapshotRequest,
    MessageResponse, SnapshotListResponse,
};
use crate::platform::{SnapshotSpec, VmDetail};
use crate::services::{ConnectInput, PowerOutcome, SnapshotCreated, VmView};

/// POST /platform/connect
pub async fn connect(
    State(state): State<Arc<AppState>>,
    AuthUser(principal): AuthUser,
    Json(payload): Json<ConnectRequest>,
) -> Result<Json<ApiResponse<ConnectResponse>>, ApiError> {
    let platform = &state.shared.platform_service;
    let auth = &state.shared.auth_service;
    let user = &principal.user;

    let (handle, token) = platform
        .connect(
            &user.id,
            ConnectInput {
                endpoint: payload.endpoint,
                username: payload.username,
                secret: payload.secret,
                insecure_tls: payload.insecure_tls,
            },
            move |handle| async move {
                auth.bind_session(user, &handle.token)
                    .await
                    .map_err(ApiError::from)
            },
        )
        .await?;

    // A previous session bound to this token is replaced.
    if let Some(old) = principal.claims.psid.as_deref() {
        platform.disconnect(old).await;
    }

    Ok(Json(ApiResponse::success(ConnectResponse {
        token,
        session_expires_at: handle.expires_at.to_rfc3339(),
    })))
}

/// POST /platform/disconnect
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    AuthUser(principal): AuthUser,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    let psid = principal
        .claims
        .psid
        .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))?;

    if state.shared.platform_service.disconnect(&psid).await {
        Ok(Json(ApiResponse::success(MessageResponse::new(
            "Disconnected successfully",
        ))))
    } else {
        Err(ApiError::NotFound("Session not found".to_string()))
    }
}

/// GET /platform/vms
pub async fn list_vms(
    State(state): State<Arc<AppState>>,
    PlatformSession { user, session }: PlatformSession,
) -> Result<Json<ApiResponse<Vec<VmView>>>, ApiError> {
    let vms = state
        .shared
        .platform_service
        .list_vms(&user, &session)
        .await?;
    Ok(Json(ApiResponse::success(vms)))
}

/// GET /platform/vms/{id}
pub async fn get_vm(
    State(state): State<Arc<AppState>>,
    PlatformSession { user, session }: PlatformSession,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<VmDetail>>, ApiError> {
    let vm_id = validate_vm_id(&id)?;
    let vm = state
        .shared
        .platform_service
        .get_vm(&user, &session, vm_id)
        .await?;
    Ok(Json(ApiResponse::success(vm)))
}

/// POST /platform/vms/{id}/power/{operation}
pub async fn power(
    State(state): State<Arc<AppState>>,
    PlatformSession { user, session }: PlatformSession,
    Path((id, operation)): Path<(String, String)>,
) -> Result<Json<ApiResponse<PowerOutcome>>, ApiError> {
    let vm_id = validate_vm_id(&id)?;
    let outcome = state
        .shared
        .platform_service
        .power(&user, &session, vm_id, &operation)
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// GET /platform/vms/{id}/snapshots
pub async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    PlatformSession { user, session }: PlatformSession,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<SnapshotListResponse>>, ApiError> {
    let vm_id = validate_vm_id(&id)?;
    let snapshots = state
        .shared
        .platform_service
        .list_snapshots(&user, &session, vm_id)
        .await?;

    Ok(Json(ApiResponse::success(SnapshotListResponse {
        vm_id: vm_id.to_string(),
        snapshots,
    })))
}

/// POST /platform/vms/{id}/snapshots
pub async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    PlatformSession { user, session }: PlatformSession,
    Path(id): Path<String>,
    Json(payload): Json<CreateSnapshotRequest>,
) -> Result<Json<ApiResponse<SnapshotCreated>>, ApiError> {
    let vm_id = validate_vm_id(&id)?;
    let name = required(payload.name, "Snapshot name")?;

    let created = state
        .shared
        .platform_service
        .create_snapshot(
            &user,
            &session,
            vm_id,
            SnapshotSpec {
                name,
                description: payload.description,
                memory: payload.memory,
                quiesce: payload.quiesce,
            },
        )
        .await?;
    Ok(Json(ApiResponse::success(created)))
}
