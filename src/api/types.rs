use serde::{Deserialize, Serialize};

use crate::domain::User;
use crate::platform::SnapshotInfo;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub const fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ============================================================================
// Auth & users
// ============================================================================

/// Request fields are optional so a missing field is a 400, not a 422.
#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    pub username: Option<String>,
    #[serde(alias = "password")]
    pub secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user: User,
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateUserRequest {
    pub username: Option<String>,
    #[serde(alias = "password")]
    pub secret: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangePasswordRequest {
    #[serde(alias = "currentPassword", alias = "current_password")]
    pub current: Option<String>,
    #[serde(alias = "newPassword", alias = "new_password")]
    pub new: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AssignmentResponse {
    pub user_id: String,
    pub assigned_vms: Vec<String>,
}

// ============================================================================
// Platform
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    pub endpoint: Option<String>,
    pub username: Option<String>,
    #[serde(alias = "password")]
    pub secret: Option<String>,
    #[serde(alias = "ignoreSsl", alias = "ignore_ssl")]
    pub insecure_tls: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub token: String,
    pub session_expires_at: String,
}

#[derive(Debug, Serialize)]
pub struct SnapshotListResponse {
    pub vm_id: String,
    pub snapshots: Vec<SnapshotInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub memory: bool,
    #[serde(default)]
    pub quiesce: bool,
}

// ============================================================================
// System
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub database: bool,
    pub active_sessions: usize,
    pub platform_endpoint: Option<String>,
}
