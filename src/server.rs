use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::app::Application;
use crate::auth::AuthStore;
use crate::config::Config;
use crate::dispatch;
use crate::handlers;
use crate::pool::DbPool;
use crate::render::Renderer;
use crate::session::SessionRegistry;

// ============================================================================
// Runtime Services
// ============================================================================

/// Shared runtime services: everything the dispatcher and the application
/// callbacks reach for. Cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<SessionRegistry>,
    pub pool: DbPool,
    pub auth: Arc<dyn AuthStore>,
    pub renderer: Arc<dyn Renderer>,
    pub app: Arc<dyn Application>,
    pub config: Arc<Config>,
}

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn build_app(state: AppState) -> Router {
    let request_timeout = Duration::from_secs(state.services.config.server.request_timeout_seconds);

    // Operational surface, out of the application's URL space.
    let admin_routes = Router::new()
        .route("/sessions", get(handlers::list_sessions))
        .route(
            "/sessions/{session_id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/pool", get(handlers::pool_occupancy))
        .with_state(state.clone());

    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/version", get(handlers::version))
        // Everything else belongs to the application.
        .fallback(dispatch::dispatch)
        .with_state(state)
        .nest("/admin", admin_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Test Support
// ============================================================================
