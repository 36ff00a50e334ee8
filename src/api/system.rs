//! Health endpoint.

use axum::{Json, extract::State, http::StatusCode};
use std::sync::Arc;

use super::{ApiResponse, AppState, HealthResponse};

/// `GET /health`
///
/// Reports database reachability, live platform sessions and the configured
/// default endpoint. Returns 503 when the database cannot be reached.
pub async fn health(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    let database = state.store().ping().await.is_ok();
    let active_sessions = state.shared.sessions.len().await;

    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ApiResponse::success(HealthResponse {
            status: if database { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            database,
            active_sessions,
            platform_endpoint: state
                .shared
                .platform_service
                .default_endpoint()
                .map(str::to_string),
        })),
    )
}
