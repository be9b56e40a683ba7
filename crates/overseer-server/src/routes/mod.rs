//! API route modules.

pub mod health;
pub mod load;
pub mod streams;

use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::middleware::allowlist_middleware;
use crate::state::AppState;

/// Create the main router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    // Public routes (no origin check)
    let public_routes = Router::new().route("/health", get(health::health_check));

    // Neighbour-only routes
    let protected_routes = Router::new()
        .merge(streams::router())
        .merge(load::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            allowlist_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
