//! HTTP surface for AgentVault.
//!
//! Routes are grouped by the pipeline stages they pass through: public
//! (rate-limited registration), authenticated reads, authenticated mutating
//! calls that additionally require an active agent, and the admin surface
//! behind the API key.

use std::sync::Arc;
use std::time::Duration;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use agentvault_core::DataStore;

use crate::config::Config;
use crate::http::middleware::RateLimiter;
use crate::objectstore::ObjectStoreBroker;

pub mod agents;
pub mod backups;
pub mod error;
pub mod middleware;

#[cfg(test)]
pub mod test_support;

/// Per-request deadline; handlers block on store and broker I/O.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DataStore>,
    pub broker: Arc<ObjectStoreBroker>,
    pub config: Arc<Config>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(store: Arc<dyn DataStore>, broker: Arc<ObjectStoreBroker>, config: Config) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.register_rate_limit));
        Self {
            store,
            broker,
            config: Arc::new(config),
            rate_limiter,
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Build the full router with the middleware chain applied.
pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/v1/agents/register", post(agents::register))
        .route_layer(from_fn_with_state(
            state.clone(),
            self::middleware::rate_limit_register,
        ));

    let reads = Router::new()
        .route("/v1/agents/me", get(agents::agent_info))
        .route("/v1/agents/me/rotate-token", post(agents::rotate_token))
        .route("/v1/backups", get(backups::list_backups))
        .route("/v1/backups/{timestamp}", get(backups::get_backup))
        .route("/v1/backups/download-url", post(backups::download_url));

    let mutating = Router::new()
        .route("/v1/backups/upload-url", post(backups::upload_url))
        .route("/v1/backups", delete(backups::delete_all_backups))
        .route("/v1/backups/{timestamp}", delete(backups::delete_backup))
        .route(
            "/v1/backups/{timestamp}/undelete",
            post(backups::undelete_backup),
        )
        .route_layer(from_fn(self::middleware::require_active));

    let authed = reads
        .merge(mutating)
        .route_layer(from_fn_with_state(
            state.clone(),
            self::middleware::authenticate,
        ));

    let admin = Router::new()
        .route("/v1/admin/agents", get(agents::admin_list_agents))
        .route(
            "/v1/admin/agents/{id}/approve",
            post(agents::admin_approve_agent),
        )
        .route(
            "/v1/admin/agents/{id}/suspend",
            post(agents::admin_suspend_agent),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            self::middleware::require_admin,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(public)
        .merge(authed)
        .merge(admin)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(from_fn(self::middleware::log_requests))
        .with_state(state)
}
