use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;

use super::auth::{AdminUser, AuthUser};
use super::validation::{required, validate_vm_id};
use super::{
    ApiError, ApiResponse, AppState, AssignmentResponse, ChangePasswordRequest, CreateUserRequest,
    MessageResponse,
};
use crate::domain::{Role, User, UserId};
use crate::services::NewUser;

/// GET /users
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<ApiResponse<Vec<User>>>, ApiError> {
    let users = state.shared.user_service.list().await?;
    Ok(Json(ApiResponse::success(users)))
}

/// POST /users
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<ApiResponse<User>>), ApiError> {
    let username = required(payload.username, "username")?;
    let secret = required(payload.secret, "password")?;
    let role = match payload.role.as_deref() {
        None => Role::User,
        Some(raw) => raw.parse::<Role>().map_err(|e| ApiError::validation(e.to_string()))?,
    };

    let user = state
        .shared
        .user_service
        .create(NewUser {
            username,
            secret,
            role,
        })
        .await?;

    tracing::info!(by = %admin.username, user_id = %user.id, "User created via API");
    Ok((StatusCode::CREATED, Json(ApiResponse::success(user))))
}

/// DELETE /users/{id}
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    let target = UserId::from(id);
    state.shared.user_service.delete(&admin.id, &target).await?;
    let closed = state.shared.platform_service.disconnect_user(&target).await;
    if closed > 0 {
        tracing::info!(user_id = %target, closed, "Closed platform sessions of deleted user");
    }

    Ok(Json(ApiResponse::success(MessageResponse::new(format!(
        "User {target} deleted"
    )))))
}

/// PUT /users/password
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    AuthUser(principal): AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    let current = required(payload.current, "current password")?;
    let new = required(payload.new, "new password")?;

    state
        .shared
        .user_service
        .change_password(&principal.user.id, &current, &new)
        .await?;

    Ok(Json(ApiResponse::success(MessageResponse::new(
        "Password updated successfully",
    ))))
}

/// PUT /users/{id}/vms/{vm_id}
pub async fn assign_vm(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path((id, vm_id)): Path<(String, String)>,
) -> Result<Json<ApiResponse<AssignmentResponse>>, ApiError> {
    let vm_id = validate_vm_id(&vm_id)?;
    let user_id = UserId::from(id);
    let assigned_vms = state.shared.user_service.assign_vm(&user_id, vm_id).await?;

    Ok(Json(ApiResponse::success(AssignmentResponse {
        user_id: user_id.to_string(),
        assigned_vms,
    })))
}

/// DELETE /users/{id}/vms/{vm_id}
pub async fn unassign_vm(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path((id, vm_id)): Path<(String, String)>,
) -> Result<Json<ApiResponse<AssignmentResponse>>, ApiError> {
    let vm_id = validate_vm_id(&vm_id)?;
    let user_id = UserId::from(id);
    let assigned_vms = state
        .shared
        .user_service
        .unassign_vm(&user_id, vm_id)
        .await?;

    Ok(Json(ApiResponse::success(AssignmentResponse {
        user_id: user_id.to_string(),
        assigned_vms,
    })))
}
