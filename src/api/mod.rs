use axum::{
    Router,
    http::HeaderValue,
    middleware,
    routing::{delete, get, post, put},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::platform::Platform;
use crate::session::Clock;
use crate::state::SharedState;

pub mod auth;
mod error;
mod observability;
mod platform;
mod system;
mod types;
mod users;
mod validation;

pub use error::ApiError;
pub use types::*;

use metrics_exporter_prometheus::PrometheusHandle;

#[derive(Clone)]
pub struct AppState {
    pub shared: Arc<SharedState>,

    pub start_time: std::time::Instant,

    pub prometheus_handle: Option<PrometheusHandle>,
}

impl AppState {
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    #[must_use]
    pub fn store(&self) -> &crate::db::Store {
        &self.shared.store
    }
}

#[must_use]
pub fn create_app_state(
    shared: Arc<SharedState>,
    prometheus_handle: Option<PrometheusHandle>,
) -> Arc<AppState> {
    Arc::new(AppState {
        shared,
        start_time: std::time::Instant::now(),
        prometheus_handle,
    })
}

/// Builds the state around an explicit platform and clock.
pub async fn create_app_state_with_platform(
    config: Config,
    platform: Arc<dyn Platform>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<AppState>> {
    let shared = Arc::new(SharedState::with_platform(config, platform, clock).await?);
    Ok(create_app_state(shared, None))
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors_origins = state.config().server.cors_allowed_origins.clone();

    let api_router = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/me", get(auth::me))
        .route("/users", get(users::list_users).post(users::create_user))
        .route("/users/password", put(users::change_password))
        .route("/users/{id}", delete(users::delete_user))
        .route(
            "/users/{id}/vms/{vm_id}",
            put(users::assign_vm).delete(users::unassign_vm),
        )
        .route("/platform/connect", post(platform::connect))
        .route("/platform/disconnect", post(platform::disconnect))
        .route("/platform/vms", get(platform::list_vms))
        .route("/platform/vms/{id}", get(platform::get_vm))
        .route(
            "/platform/vms/{id}/power/{operation}",
            post(platform::power),
        )
        .route(
            "/platform/vms/{id}/snapshots",
            get(platform::list_snapshots).post(platform::create_snapshot),
        )
        .route("/metrics", get(observability::get_metrics));

    let cors_layer = if cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> =
            cors_origins.iter().filter_map(|s| s.parse().ok()).collect();
        CorsLayer::new().allow_origin(origins)
    };

    Router::new()
        .route("/health", get(system::health))
        .nest("/api", api_router)
        .route_layer(middleware::from_fn(observability::logging_middleware))
        .with_state(state)
        .layer(cors_layer.allow_methods(Any).allow_headers(Any))
        .layer(middleware::from_fn(observability::security_headers_middleware))
        .layer(TraceLayer::new_for_http())
}
