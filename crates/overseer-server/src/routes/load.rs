//! Load reporting route.

use axum::{extract::State, routing::get, Json, Router};
use overseer_core::types::LoadReport;
use std::sync::Arc;

use crate::services::delegation;
use crate::state::AppState;

/// Create load router
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/load", get(get_load))
}

/// Aggregated load of this node's subtree
pub async fn get_load(State(state): State<Arc<AppState>>) -> Json<LoadReport> {
    Json(delegation::subtree_load(&state).await)
}
